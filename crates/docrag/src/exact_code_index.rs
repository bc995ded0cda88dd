//! Precise product/model-code lookup layered on top of `MetadataStore`.
//! Additive only: when a query carries no recognizable code, this layer
//! contributes nothing and the hybrid retriever falls back to lexical+vector.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::code_normalizer::{extract_codes, generate_variants};
use crate::metadata_store::{CodeMatchKind, MetadataStore};
use crate::types::DocId;

const EXACT_CODE_WEIGHT: f32 = 3.0;
const FILENAME_EXACT_WEIGHT: f32 = 1.5;
const FILENAME_PARTIAL_WEIGHT: f32 = 1.0;

#[derive(Debug, Clone)]
pub struct CodeHit {
    pub doc_id: DocId,
    pub score: f32,
    pub matched_code: String,
    pub match_kind: &'static str,
}

pub struct ExactCodeIndex {
    store: Arc<MetadataStore>,
}

impl ExactCodeIndex {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    pub async fn search_codes(&self, query: &str) -> Result<Vec<CodeHit>> {
        let codes = extract_codes(query);
        if codes.is_empty() {
            return Ok(Vec::new());
        }

        let mut variants: Vec<String> = Vec::new();
        for code in &codes {
            variants.extend(generate_variants(code));
        }
        variants.sort();
        variants.dedup();

        let raw_hits = self.store.list_codes(&variants).await?;
        Ok(merge_results(raw_hits))
    }
}

fn kind_weight(kind: CodeMatchKind) -> f32 {
    match kind {
        CodeMatchKind::ExactCode => EXACT_CODE_WEIGHT,
        CodeMatchKind::FilenameExact => FILENAME_EXACT_WEIGHT,
        CodeMatchKind::FilenamePartial => FILENAME_PARTIAL_WEIGHT,
    }
}

fn kind_name(kind: CodeMatchKind) -> &'static str {
    match kind {
        CodeMatchKind::ExactCode => "exact_code",
        CodeMatchKind::FilenameExact => "filename_exact",
        CodeMatchKind::FilenamePartial => "filename_partial",
    }
}

/// Keep the highest-weighted match per doc_id; exact-code matches always
/// win over filename matches for the same document.
fn merge_results(raw: Vec<(DocId, String, CodeMatchKind)>) -> Vec<CodeHit> {
    let mut best: HashMap<DocId, (f32, String, CodeMatchKind)> = HashMap::new();
    for (doc_id, code, kind) in raw {
        let weight = kind_weight(kind);
        best.entry(doc_id)
            .and_modify(|(score, matched, best_kind)| {
                if weight > *score {
                    *score = weight;
                    *matched = code.clone();
                    *best_kind = kind;
                }
            })
            .or_insert((weight, code, kind));
    }

    let mut hits: Vec<CodeHit> = best
        .into_iter()
        .map(|(doc_id, (score, matched_code, kind))| CodeHit {
            doc_id,
            score,
            matched_code,
            match_kind: kind_name(kind),
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_exact_code_over_filename() {
        let raw = vec![
            (DocId(1), "XRN1620B2".to_string(), CodeMatchKind::FilenamePartial),
            (DocId(1), "XRN1620B2".to_string(), CodeMatchKind::ExactCode),
        ];
        let merged = merge_results(raw);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].match_kind, "exact_code");
        assert!((merged[0].score - EXACT_CODE_WEIGHT).abs() < f32::EPSILON);
    }

    #[test]
    fn merge_sorts_by_score_then_doc_id() {
        let raw = vec![
            (DocId(2), "A".to_string(), CodeMatchKind::FilenamePartial),
            (DocId(1), "A".to_string(), CodeMatchKind::FilenamePartial),
            (DocId(3), "A".to_string(), CodeMatchKind::ExactCode),
        ];
        let merged = merge_results(raw);
        assert_eq!(merged[0].doc_id, DocId(3));
        assert_eq!(merged[1].doc_id, DocId(1));
        assert_eq!(merged[2].doc_id, DocId(2));
    }
}
