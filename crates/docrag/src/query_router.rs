//! Query classification and rewriting.
//!
//! Classifies each query into one of {COST, DOCUMENT, SEARCH, QA} via a
//! priority cascade of Korean regex patterns, grounded exactly in the
//! reference router. The low-confidence signal it computes is observability
//! only — it never changes the chosen mode (see `SPEC_FULL.md` §11).

use regex::Regex;
use std::sync::LazyLock;

use crate::types::{QueryMode, RouterDecision, ScoreStats};

static COST_INTERROGATIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(합계|총액|금액|비용).{0,10}(얼마|\?)").unwrap());
static COST_CONTEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(기안|작성|문서|구매|소모품|납품).{0,15}(합계|총액|금액|비용)").unwrap()
});
static COST_COMPOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(비용\s*합계|합계\s*금액)").unwrap());

static DETAIL_INTENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(자세히|상세히|구체적으로)").unwrap());
static DOC_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(이\s*문서|해당\s*문서|\.pdf|검토서|기안서|견적서)").unwrap()
});
static CONTENT_INTENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(미리보기|요약|내용)").unwrap());

static SEARCH_YEAR_AUTHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}년?).{0,10}([가-힣]{2,4})").unwrap());
static SEARCH_VERB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(찾아|검색|목록|리스트)").unwrap());
static SEARCH_RELATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([가-힣A-Za-z0-9]+)\s*관련\s*(문서|파일)").unwrap());

static AUTHOR_INTENT_1: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([가-힣\s]+)\s*(?:이|가)?\s*(?:작성|기안|제안)\s*(?:한|하신)?\s*(?:문서|자료|기안서)?").unwrap()
});
static AUTHOR_INTENT_2: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:작성자|기안자|제안자)[\s:]*([가-힣\s]+)").unwrap());
static AUTHOR_INTENT_3: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([가-힣\s]+)\s+(?:기안서|작성문서)").unwrap());

/// Lowercase, fold `&` to `and`, and strip separators — used by
/// `classify_mode_with_hits` to compare the query against candidate titles.
fn norm(text: &str) -> String {
    let lower = text.to_lowercase().replace('&', "and");
    lower
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' ' | '.' | ','))
        .collect()
}

/// Substring-containment base score (0.8) plus a length-proximity bonus
/// (`max(0, 0.4 - diff*0.01)`, capped at 1.0).
fn hit_score(query_norm: &str, title_norm: &str) -> f32 {
    if title_norm.is_empty() || query_norm.is_empty() {
        return 0.0;
    }
    let contains = title_norm.contains(query_norm) || query_norm.contains(title_norm);
    if !contains {
        return 0.0;
    }
    let diff = (title_norm.chars().count() as i64 - query_norm.chars().count() as i64).unsigned_abs() as f32;
    let bonus = (0.4 - diff * 0.01).max(0.0);
    (0.8 + bonus).min(1.0)
}

/// Extract a likely author name from an "X가/이 작성한 문서" style query.
pub fn extract_author_candidate(query: &str) -> Option<String> {
    for re in [&*AUTHOR_INTENT_2, &*AUTHOR_INTENT_3, &*AUTHOR_INTENT_1] {
        if let Some(caps) = re.captures(query) {
            if let Some(m) = caps.get(1) {
                let name = m.as_str().trim();
                if name.chars().count() >= 2 && name.chars().count() <= 6 {
                    return Some(name.to_string());
                }
            }
        }
    }
    None
}

/// Generate the 5 canonical author-intent query variants.
pub fn author_query_variants(author: &str) -> Vec<String> {
    vec![
        author.to_string(),
        format!("기안자 {author}"),
        format!("작성자 {author}"),
        format!("{author} 기안서"),
        format!("{author} 문서"),
    ]
}

pub struct QueryRouter {
    pub min_hits_for_low_confidence: usize,
    pub delta_threshold: f32,
    pub doc_hit_threshold: f32,
}

impl Default for QueryRouter {
    fn default() -> Self {
        Self {
            min_hits_for_low_confidence: 1,
            delta_threshold: 0.05,
            doc_hit_threshold: 0.66,
        }
    }
}

impl QueryRouter {
    /// Priority-cascade classification, independent of retrieval hits.
    pub fn classify(&self, query: &str) -> RouterDecision {
        let author_candidate = extract_author_candidate(query);
        let query_variants = author_candidate
            .as_deref()
            .map(author_query_variants)
            .unwrap_or_default();

        if COST_INTERROGATIVE.is_match(query) || COST_CONTEXT.is_match(query) || COST_COMPOUND.is_match(query) {
            return RouterDecision {
                mode: QueryMode::Cost,
                rewritten_query: query.to_string(),
                author_candidate,
                query_variants,
                reason: "cost_pattern".to_string(),
            };
        }

        if DETAIL_INTENT.is_match(query) {
            return RouterDecision {
                mode: QueryMode::Qa,
                rewritten_query: query.to_string(),
                author_candidate,
                query_variants,
                reason: "detail_intent_forces_qa".to_string(),
            };
        }

        let has_doc_reference = DOC_REFERENCE.is_match(query);
        if has_doc_reference && CONTENT_INTENT.is_match(query) {
            return RouterDecision {
                mode: QueryMode::Document,
                rewritten_query: query.to_string(),
                author_candidate,
                query_variants,
                reason: "doc_reference_with_content_intent".to_string(),
            };
        }

        if SEARCH_YEAR_AUTHOR.is_match(query) && SEARCH_VERB.is_match(query) {
            return RouterDecision {
                mode: QueryMode::Search,
                rewritten_query: query.to_string(),
                author_candidate,
                query_variants,
                reason: "year_author_find".to_string(),
            };
        }
        if SEARCH_RELATED.is_match(query) {
            return RouterDecision {
                mode: QueryMode::Search,
                rewritten_query: query.to_string(),
                author_candidate,
                query_variants,
                reason: "related_docs_find".to_string(),
            };
        }

        // Compatibility fallback: a bare filename/document-reference signal
        // with no content-intent keyword still routes to DOCUMENT rather
        // than falling through to QA.
        if has_doc_reference {
            return RouterDecision {
                mode: QueryMode::Document,
                rewritten_query: query.to_string(),
                author_candidate,
                query_variants,
                reason: "bare_doc_reference_fallback".to_string(),
            };
        }

        RouterDecision {
            mode: QueryMode::Qa,
            rewritten_query: query.to_string(),
            author_candidate,
            query_variants,
            reason: "default_qa".to_string(),
        }
    }

    /// When content/summary intent is present and retrieval hits are
    /// available, narrow to a single hit if it is the only candidate or
    /// scores above `doc_hit_threshold` against the query.
    pub fn classify_mode_with_hits(
        &self,
        query: &str,
        hit_titles: &[String],
    ) -> (RouterDecision, Option<Vec<usize>>) {
        let base = self.classify(query);
        if !(CONTENT_INTENT.is_match(query) || DOC_REFERENCE.is_match(query)) || hit_titles.is_empty() {
            return (base, None);
        }

        if hit_titles.len() == 1 {
            return (
                RouterDecision {
                    mode: QueryMode::Document,
                    reason: "single_hit_forces_document".to_string(),
                    ..base
                },
                Some(vec![0]),
            );
        }

        let qn = norm(query);
        let mut best_idx = 0usize;
        let mut best_score = 0.0f32;
        for (i, title) in hit_titles.iter().enumerate() {
            let score = hit_score(&qn, &norm(title));
            if score > best_score {
                best_score = score;
                best_idx = i;
            }
        }

        if best_score >= self.doc_hit_threshold {
            (
                RouterDecision {
                    mode: QueryMode::Document,
                    reason: format!("top_hit_score_{best_score:.2}_above_threshold"),
                    ..base
                },
                Some(vec![best_idx]),
            )
        } else {
            (base, None)
        }
    }

    /// Log-only: computes whether the top1/top2 delta is too close to trust,
    /// but the caller MUST NOT use this to change routing behavior.
    pub fn low_confidence_reason(&self, stats: &ScoreStats) -> Option<String> {
        if stats.is_low_confidence(self.min_hits_for_low_confidence, self.delta_threshold) {
            Some(format!(
                "low_confidence: top1={:.3} top2={:.3} delta12={:.3}",
                stats.top1, stats.top2, stats.delta12
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_query_routes_to_cost() {
        let router = QueryRouter::default();
        let decision = router.classify("채널에이 중계차 보수 합계 얼마였지?");
        assert_eq!(decision.mode, QueryMode::Cost);
    }

    #[test]
    fn search_query_routes_to_search() {
        let router = QueryRouter::default();
        let decision = router.classify("2024년 남준수 문서 찾아줘");
        assert_eq!(decision.mode, QueryMode::Search);
    }

    #[test]
    fn document_summary_routes_to_document() {
        let router = QueryRouter::default();
        let decision = router.classify("이 문서 요약해줘");
        assert_eq!(decision.mode, QueryMode::Document);
    }

    #[test]
    fn detail_intent_forces_qa_over_document() {
        let router = QueryRouter::default();
        let decision = router.classify("이 문서 자세히 설명해줘");
        assert_eq!(decision.mode, QueryMode::Qa);
    }

    #[test]
    fn cost_pattern_takes_priority_over_detail_intent() {
        let router = QueryRouter::default();
        let decision = router.classify("합계가 얼마인지 자세히 알려줘");
        assert_eq!(decision.mode, QueryMode::Cost);
    }

    #[test]
    fn fallback_routes_to_qa() {
        let router = QueryRouter::default();
        let decision = router.classify("APEX 중계 동시통역 라우팅 정확한 연결 도면?");
        assert_eq!(decision.mode, QueryMode::Qa);
    }

    #[test]
    fn author_candidate_extracted_from_intent() {
        let candidate = extract_author_candidate("작성자: 남준수");
        assert_eq!(candidate.as_deref(), Some("남준수"));
    }

    #[test]
    fn author_variants_has_five_entries() {
        let variants = author_query_variants("남준수");
        assert_eq!(variants.len(), 5);
        assert!(variants.contains(&"기안자 남준수".to_string()));
    }

    #[test]
    fn single_hit_forces_document_mode() {
        let router = QueryRouter::default();
        let (decision, idx) = router.classify_mode_with_hits("이 문서 요약해줘", &["2024-10-24_보수건.pdf".to_string()]);
        assert_eq!(decision.mode, QueryMode::Document);
        assert_eq!(idx, Some(vec![0]));
    }

    #[test]
    fn low_confidence_is_log_only_and_does_not_change_mode() {
        let router = QueryRouter::default();
        let decision = router.classify("2024년 남준수 문서 찾아줘");
        let stats = ScoreStats::from_scores(&[0.51, 0.50, 0.2]);
        assert!(router.low_confidence_reason(&stats).is_some());
        assert_eq!(decision.mode, QueryMode::Search);
    }
}
