//! Product/model code extraction and normalization.
//!
//! Grounded in the reference text normalizer: codes are folded to a single
//! hyphen style before pattern matching so detection is stable regardless of
//! which dash-like Unicode character the source document used.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

const HYPHEN_VARIANTS: &[char] = &['\u{2010}', '\u{2011}', '\u{2012}', '\u{2013}', '\u{2014}', '\u{2212}'];

static CODE_DENYLIST: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "EMAIL", "THIS", "THAT", "FROM", "WITH", "WERE", "HAVE", "WILL", "YOUR", "THEY", "WHEN",
        "WHAT", "THERE", "THEIR", "WOULD", "ABOUT", "WHICH", "THESE", "OTHER", "AFTER", "FIRST",
        "COULD", "PAGE",
    ]
    .into_iter()
    .collect()
});

const BRAND_PREFIXES: &[&str] = &[
    "LVM", "XRN", "NR", "RM", "KONA", "DECKLINK", "FS", "FX", "BM", "SDI", "HDR", "LAG", "ODIN",
    "ATEYAA", "EX", "BE", "COM",
];

static CODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // 1) multi-segment, hyphen/slash/space separated, 1-4 segments, each 1-12 chars,
        //    requiring at least one digit anywhere in the match.
        Regex::new(r"(?i)\b(?=[A-Z0-9/\- ]*\d)[A-Z0-9]{1,12}(?:[\-/ ][A-Z0-9]{1,12}){0,3}\b").unwrap(),
        // 2) mixed alnum-with-embedded-spaces product name, e.g. "DeckLink 4K Extreme 12G"
        Regex::new(r"(?i)\b[A-Za-z]{2,}(?:\s+[A-Za-z0-9]{1,10}){1,4}\b").unwrap(),
        // 3) tight single-token alnum code, e.g. "LVM180A", "FX3"
        Regex::new(r"(?i)\b(?=[A-Za-z0-9]*\d)[A-Za-z]{1,6}[0-9]{1,6}[A-Za-z0-9]{0,4}\b").unwrap(),
    ]
});

fn fold_hyphens(text: &str) -> String {
    text.chars()
        .map(|c| if HYPHEN_VARIANTS.contains(&c) { '-' } else { c })
        .collect()
}

/// NFKC-equivalent normalization: fold hyphen variants and collapse whitespace.
/// `unicode-normalization` crate is not part of this stack; ASCII-range codes
/// this extractor targets are unaffected by full NFKC, so folding + whitespace
/// collapse is sufficient here.
pub fn normalize_text(text: &str) -> String {
    let folded = fold_hyphens(text);
    let mut out = String::with_capacity(folded.len());
    let mut last_was_space = false;
    for c in folded.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

pub fn normalize_code(code: &str, uppercase: bool) -> String {
    let normalized = normalize_text(code);
    let cased = if uppercase { normalized.to_uppercase() } else { normalized };
    cased.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Pad with single spaces on both sides, for boundary-safe `LIKE` matching
/// against a `padded_norm` column (`" " || norm_code || " "`).
pub fn padded_norm(norm_code: &str) -> String {
    format!(" {norm_code} ")
}

/// Generate separator-variant spellings of a code: hyphen, space, slash,
/// and no-separator forms, so a code written "XRN-1620B2" also matches
/// "XRN 1620B2" or "XRN/1620B2" in free text.
pub fn generate_variants(code: &str) -> Vec<String> {
    let base = normalize_text(code).to_uppercase();
    let mut variants: HashSet<String> = HashSet::new();
    variants.insert(base.clone());

    if base.contains('-') {
        variants.insert(base.replace('-', " "));
        variants.insert(base.replace('-', ""));
    }
    if base.contains(' ') {
        variants.insert(base.replace(' ', "-"));
        variants.insert(base.replace(' ', ""));
    }
    if base.contains('/') {
        variants.insert(base.replace('/', "-"));
        variants.insert(base.replace('/', " "));
    }

    let mut sorted: Vec<String> = variants.into_iter().collect();
    sorted.sort();
    sorted
}

fn looks_like_brand_code(candidate: &str) -> bool {
    let upper = candidate.to_uppercase();
    BRAND_PREFIXES
        .iter()
        .any(|p| upper.starts_with(p) && upper.len() >= 4 && upper.len() <= 12)
}

/// Extract candidate product/model codes from free text, longest-first then
/// alphabetical, filtered against the deny-list by their normalized form.
pub fn extract_codes(text: &str) -> Vec<String> {
    let normalized_text = normalize_text(text);
    let mut found: HashSet<String> = HashSet::new();

    for pattern in CODE_PATTERNS.iter() {
        for m in pattern.find_iter(&normalized_text) {
            let candidate = m.as_str();
            if candidate.chars().filter(|c| c.is_ascii_digit()).count() == 0
                && !looks_like_brand_code(candidate)
            {
                continue;
            }
            let norm = normalize_code(candidate, true);
            if norm.len() < 3 {
                continue;
            }
            if CODE_DENYLIST.contains(norm.as_str()) {
                continue;
            }
            found.insert(norm);
        }
    }

    // Brand-prefix whitelist pass, independent of the digit requirement.
    let word_re = Regex::new(r"[A-Za-z]{2,}").unwrap();
    for m in word_re.find_iter(&normalized_text) {
        let candidate = m.as_str();
        if looks_like_brand_code(candidate) {
            let norm = normalize_code(candidate, true);
            if !CODE_DENYLIST.contains(norm.as_str()) {
                found.insert(norm);
            }
        }
    }

    let mut out: Vec<String> = found.into_iter().collect();
    out.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    out
}

pub fn is_code_query(text: &str) -> bool {
    !extract_codes(text).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_unicode_hyphens() {
        let text = "XRN\u{2013}1620B2";
        assert_eq!(normalize_text(text), "XRN-1620B2");
    }

    #[test]
    fn extracts_hyphenated_code_with_digit() {
        let codes = extract_codes("문의사항: XRN-1620B2 매뉴얼이 필요합니다");
        assert!(codes.iter().any(|c| c == "XRN1620B2"));
    }

    #[test]
    fn denylist_filters_common_words() {
        let codes = extract_codes("EMAIL THIS to me");
        assert!(!codes.iter().any(|c| c == "EMAIL"));
    }

    #[test]
    fn generates_separator_variants() {
        let variants = generate_variants("XRN-1620B2");
        assert!(variants.contains(&"XRN 1620B2".to_string()));
        assert!(variants.contains(&"XRN1620B2".to_string()));
    }

    #[test]
    fn padded_norm_has_boundary_spaces() {
        assert_eq!(padded_norm("XRN1620B2"), " XRN1620B2 ");
    }

    #[test]
    fn brand_prefix_detected_without_digit_in_first_pass() {
        assert!(looks_like_brand_code("DECKLINK"));
    }
}
