//! The public error taxonomy. Internal plumbing uses `anyhow::Result` with
//! `.context(...)`; only the public API boundary (`DocRagEngine::query`,
//! `::ingest`, admin operations) converts into one of these variants so
//! callers see a stable taxonomy rather than an arbitrary error chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocRagError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("index error: lexical and vector index counts differ (lexical={lexical}, vector={vector})")]
    IndexCountMismatch { lexical: usize, vector: usize },

    #[error("index error: {0}")]
    Index(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("path escapes documents root: {0}")]
    PathEscape(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("search error: {0}")]
    Search(String),

    #[error("reindex already in progress (lock held by pid {pid:?})")]
    ReindexLocked { pid: Option<u32> },
}

pub type DocRagResult<T> = Result<T, DocRagError>;

impl DocRagError {
    /// Stable, lowercase taxonomy tag used in structured log records.
    pub fn kind(&self) -> &'static str {
        match self {
            DocRagError::Config(_) => "config_error",
            DocRagError::Database(_) => "database_error",
            DocRagError::IndexCountMismatch { .. } | DocRagError::Index(_) => "index_error",
            DocRagError::Validation(_) => "validation_error",
            DocRagError::PathEscape(_) => "validation_error",
            DocRagError::Model(_) => "model_error",
            DocRagError::Search(_) => "search_error",
            DocRagError::ReindexLocked { .. } => "index_error",
        }
    }
}
