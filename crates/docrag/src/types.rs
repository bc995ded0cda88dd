//! Domain types shared across the retrieval core.

use serde::{Deserialize, Serialize};

/// An opaque document identifier of the form `doc_{N}`, `N` a stable integer
/// assigned once at first ingest and never reused or changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(pub i64);

impl DocId {
    pub fn as_str(&self) -> String {
        format!("doc_{}", self.0)
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.strip_prefix("doc_").and_then(|n| n.parse().ok()).map(DocId)
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Doctype {
    Proposal,
    Report,
    Review,
    Minutes,
    Disposal,
    Consumables,
    Repair,
    ProcEval,
    Generic,
    Unknown,
}

impl Doctype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Doctype::Proposal => "proposal",
            Doctype::Report => "report",
            Doctype::Review => "review",
            Doctype::Minutes => "minutes",
            Doctype::Disposal => "disposal",
            Doctype::Consumables => "consumables",
            Doctype::Repair => "repair",
            Doctype::ProcEval => "proc_eval",
            Doctype::Generic => "generic",
            Doctype::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "proposal" => Doctype::Proposal,
            "report" => Doctype::Report,
            "review" => Doctype::Review,
            "minutes" => Doctype::Minutes,
            "disposal" => Doctype::Disposal,
            "consumables" => Doctype::Consumables,
            "repair" => Doctype::Repair,
            "proc_eval" => Doctype::ProcEval,
            "generic" => Doctype::Generic,
            _ => Doctype::Unknown,
        }
    }
}

/// Tri-state indicator of whether itemized line totals match the declared total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SumMatch {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: DocId,
    pub filename: String,
    pub path: String,
    pub title: String,
    pub date: Option<String>,
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub doctype: Doctype,
    pub drafter: Option<String>,
    pub department: Option<String>,
    pub category: Option<String>,
    pub claimed_total: Option<i64>,
    pub sum_match: SumMatch,
    pub text_preview: String,
    pub page_count: Option<i32>,
    pub content_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A retriever-produced unit of context passed to the composer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: DocId,
    pub page: Option<i32>,
    pub text: String,
    pub score: f32,
    pub filename: String,
    pub date: Option<String>,
    pub drafter: Option<String>,
    pub category: Option<String>,
    pub author_matched: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryMode {
    Cost,
    Document,
    Search,
    Qa,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Cost => "COST",
            QueryMode::Document => "DOCUMENT",
            QueryMode::Search => "SEARCH",
            QueryMode::Qa => "QA",
        }
    }
}

/// Score distribution used for the (log-only) low-confidence routing signal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreStats {
    pub top1: f32,
    pub top2: f32,
    pub top3: f32,
    pub delta12: f32,
    pub delta13: f32,
    pub ratio12: f32,
    pub hits: usize,
}

impl ScoreStats {
    pub fn from_scores(scores: &[f32]) -> Self {
        let top1 = scores.first().copied().unwrap_or(0.0);
        let top2 = scores.get(1).copied().unwrap_or(0.0);
        let top3 = scores.get(2).copied().unwrap_or(0.0);
        Self {
            top1,
            top2,
            top3,
            delta12: top1 - top2,
            delta13: top1 - top3,
            ratio12: if top1.abs() > f32::EPSILON { top2 / top1 } else { 0.0 },
            hits: scores.len(),
        }
    }

    /// True when there are enough hits but the top two scores are too close
    /// to trust the ranking. Observability only — see `QueryRouter`.
    pub fn is_low_confidence(&self, min_hits: usize, delta_threshold: f32) -> bool {
        self.hits >= min_hits && self.delta12 < delta_threshold
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDecision {
    pub mode: QueryMode,
    pub rewritten_query: String,
    pub author_candidate: Option<String>,
    pub query_variants: Vec<String>,
    pub reason: String,
}
