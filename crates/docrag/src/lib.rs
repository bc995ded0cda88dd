//! Hybrid retrieval and answer composition core for internal Korean
//! document search: BM25 + dense-vector fusion, a 4-mode query router, a
//! metadata store with code-occurrence indexing, a two-tier cache, and an
//! LLM-based answer composer with citation enforcement.

pub mod cache;
pub mod code_normalizer;
pub mod composer;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod exact_code_index;
pub mod lexical_index;
pub mod llm;
pub mod metadata_store;
pub mod query_router;
pub mod reindex;
pub mod retriever;
pub mod types;
pub mod vector_index;

pub use config::DocRagConfig;
pub use engine::{DocRagEngine, EngineStats, IngestOutcome, IngestRequest, QueryResponse};
pub use error::{DocRagError, DocRagResult};
pub use types::{Chunk, DocId, Doctype, Document, QueryMode, RouterDecision, SumMatch};

pub use anyhow::{Error, Result};
pub use uuid::Uuid;
