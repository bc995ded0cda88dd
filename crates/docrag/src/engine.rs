//! `DocRagEngine`: the orchestrator wiring QueryRouter, CacheLayer,
//! HybridRetriever, MetadataStore, and AnswerComposer into the query and
//! ingestion data flows described in the component design.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::{cache_key, namespace, CacheLayer, InflightRole};
use crate::code_normalizer::extract_codes;
use crate::composer::{AnswerComposer, ComposedAnswer};
use crate::config::DocRagConfig;
use crate::embeddings::EmbeddingModel;
use crate::error::DocRagError;
use crate::exact_code_index::ExactCodeIndex;
use crate::lexical_index::LexicalIndex;
use crate::metadata_store::{MetadataStore, NewDocument};
use crate::query_router::QueryRouter;
use crate::reindex::{default_lock_path, ReindexCoordinator};
use crate::retriever::HybridRetriever;
use crate::types::{Chunk, DocId, Doctype, SumMatch};
use crate::vector_index::VectorIndex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub doctype: String,
    pub sources_cited: Vec<String>,
    pub has_proper_citation: bool,
    pub confidence: f32,
    pub source_docs: Vec<DocId>,
    pub evidence: Vec<Chunk>,
    pub mode: String,
    pub route_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineStats {
    pub document_count: i64,
    pub lexical_count: usize,
    pub vector_count: usize,
    pub index_version: String,
    pub last_full_reindex_ts: Option<String>,
    pub stale_index_count: i64,
    pub ingest_status: String,
    pub cache_hit_rate: f64,
}

pub struct DocRagEngine {
    config: DocRagConfig,
    store: Arc<MetadataStore>,
    lexical: Arc<LexicalIndex>,
    vector: Arc<VectorIndex>,
    exact: Arc<ExactCodeIndex>,
    embedder: Arc<dyn EmbeddingModel>,
    retriever: RwLock<Arc<HybridRetriever>>,
    router: QueryRouter,
    composer: AnswerComposer,
    cache: CacheLayer<QueryResponse>,
    reindex: ReindexCoordinator,
    index_version: RwLock<String>,
}

impl DocRagEngine {
    pub async fn open(
        config: DocRagConfig,
        embedder: Arc<dyn EmbeddingModel>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let store = Arc::new(
            MetadataStore::open(&config.data_dir.join("metadata.db"), &config.documents_root).await?,
        );
        let lexical = Arc::new(LexicalIndex::open(&config.data_dir)?);
        let vector = Arc::new(VectorIndex::open(&config.data_dir.join("vectors"), config.embedding.dimension).await?);
        let exact = Arc::new(ExactCodeIndex::new(store.clone()));

        let retriever = Arc::new(HybridRetriever::new(
            lexical.clone(),
            vector.clone(),
            exact.clone(),
            store.clone(),
            embedder.clone(),
            config.retrieval.clone(),
        )?);

        retriever.verify_index_parity().await?;

        let composer = AnswerComposer::new(&config.llm)?;
        let cache = CacheLayer::open(&config.data_dir.join("cache.db"), &config.cache).await?;
        let reindex = ReindexCoordinator::new(default_lock_path(&config.data_dir));
        let index_version = RwLock::new(read_index_version(&config.data_dir));

        Ok(Self {
            config,
            store,
            lexical,
            vector,
            exact,
            embedder,
            retriever: RwLock::new(retriever),
            router: QueryRouter::default(),
            composer,
            cache,
            reindex,
            index_version,
        })
    }

    fn cache_namespace(&self) -> String {
        namespace(&self.index_version.read(), &self.config.config_hash())
    }

    /// Runs the full query data flow: route -> cache lookup (with
    /// single-flight de-duplication on miss) -> hybrid retrieval -> compose
    /// -> cache store.
    pub async fn query(&self, text: &str, top_k: Option<usize>) -> Result<QueryResponse> {
        let trace_id = Uuid::new_v4();
        let decision = self.router.classify(text);
        let ns = self.cache_namespace();
        let key = cache_key(&ns, &decision.rewritten_query, decision.mode);

        let _span = tracing::info_span!("query", %trace_id, mode = decision.mode.as_str()).entered();

        if let Some(hit) = self.cache.get(&key).await? {
            tracing::info!(%trace_id, "cache hit");
            return Ok(hit);
        }

        match self.cache.begin_inflight(&key) {
            InflightRole::Follower => {
                self.cache.wait_inflight(&key);
                if let Some(hit) = self.cache.get(&key).await? {
                    return Ok(hit);
                }
                // Followers that time out become their own leader rather
                // than wait forever (see `SPEC_FULL.md` concurrency model).
                self.cache.begin_inflight(&key);
            }
            InflightRole::Leader => {}
        }

        let result = self.compute_answer(&decision.rewritten_query, top_k, &decision).await;
        self.cache.end_inflight(&key);

        let response = result?;
        self.cache.set(&key, response.clone()).await?;
        Ok(response)
    }

    async fn compute_answer(
        &self,
        query: &str,
        top_k: Option<usize>,
        decision: &crate::types::RouterDecision,
    ) -> Result<QueryResponse> {
        let retriever = self.retriever.read().clone();
        let mut chunks = retriever.search(query).await?;
        if let Some(k) = top_k {
            chunks.truncate(k);
        }

        let composed: ComposedAnswer = self
            .composer
            .compose(query, &chunks, self.config.cache.allow_ungrounded_chat)
            .await?;
        let source_docs: Vec<DocId> = chunks.iter().map(|c| c.doc_id).collect();

        Ok(QueryResponse {
            answer: composed.markdown,
            doctype: composed.doctype,
            sources_cited: composed.cited_filenames,
            has_proper_citation: composed.has_proper_citation,
            confidence: composed.confidence,
            source_docs,
            evidence: chunks,
            mode: decision.mode.as_str().to_string(),
            route_reason: decision.reason.clone(),
        })
    }

    /// Ingest a single document's already-extracted text. The PDF/OCR
    /// extraction pipeline that produces this text lives outside this core
    /// (see the Non-goals in `SPEC_FULL.md` §1).
    pub async fn ingest(&self, new_doc: IngestRequest<'_>) -> Result<IngestOutcome> {
        let validated_path = self.store.validate_path(Path::new(new_doc.path))?;
        let path_str = validated_path.to_string_lossy().to_string();

        let record = NewDocument {
            path: &path_str,
            filename: new_doc.filename,
            title: new_doc.title,
            date: new_doc.date,
            year: new_doc.year,
            month: new_doc.month,
            doctype: new_doc.doctype,
            category: new_doc.category,
            drafter: new_doc.drafter,
            department: new_doc.department,
            claimed_total: new_doc.claimed_total,
            sum_match: new_doc.sum_match,
            text_preview: new_doc.text,
            page_count: new_doc.page_count,
            content_hash: new_doc.content_hash,
            timestamp: new_doc.timestamp,
        };

        let (doc_id, is_duplicate) = self.store.upsert(&record).await?;
        if is_duplicate {
            return Ok(IngestOutcome { doc_id, reindexed: false });
        }

        let codes = extract_codes(new_doc.text);
        self.store.replace_codes(doc_id, &codes).await?;

        let lock_timeout = Duration::from_secs_f64(self.config.reindex.lock_timeout_secs);
        let poll = Duration::from_millis(self.config.reindex.poll_ms);
        let _guard = self
            .reindex
            .acquire(lock_timeout, poll)
            .map_err(|e| anyhow::anyhow!(e))?;

        let old_namespace = self.cache_namespace();

        let meta_line = format!(
            "{} {} {} {}",
            new_doc.filename,
            new_doc.drafter.unwrap_or(""),
            new_doc.category.unwrap_or(""),
            new_doc.date.unwrap_or("")
        );
        self.lexical.index_document(doc_id, new_doc.text, &meta_line)?;
        self.lexical.commit()?;

        let embedding = self.embedder.embed_document(new_doc.text)?;
        self.vector.upsert(vec![(doc_id, embedding)], new_doc.timestamp).await?;

        let new_version = compute_index_version(&self.config.config_hash());
        write_index_version(&self.config.data_dir, &new_version);
        *self.index_version.write() = new_version;

        self.cache.invalidate(&old_namespace).await?;

        Ok(IngestOutcome { doc_id, reindexed: true })
    }

    /// Fails fast if the lexical and vector indexes have diverged (a fatal
    /// condition here, see the index-parity decision in `DESIGN.md`).
    pub async fn verify_health(&self) -> Result<(), DocRagError> {
        self.retriever.read().clone().verify_index_parity().await
    }

    /// Full reindex: rebuilds the lexical and vector indexes from the
    /// documents already in `MetadataStore`, per the protocol in
    /// `SPEC_FULL.md` §4.8. Embedding (CPU-bound) is computed in parallel
    /// across documents via `rayon`; index writes themselves stay
    /// sequential since both backends serialize writers internally.
    pub async fn full_reindex(&self) -> Result<EngineStats> {
        let lock_timeout = Duration::from_secs_f64(self.config.reindex.lock_timeout_secs);
        let poll = Duration::from_millis(self.config.reindex.poll_ms);
        let _guard = self
            .reindex
            .acquire(lock_timeout, poll)
            .map_err(anyhow::Error::from)?;

        let old_namespace = self.cache_namespace();

        let mut docs = Vec::new();
        let mut offset = 0i64;
        loop {
            let batch = self.store.list(offset, 500, self.config.min_text_length).await?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len() as i64;
            docs.extend(batch);
        }

        self.lexical.clear()?;
        self.vector.clear().await?;

        let embedder = self.embedder.clone();
        let embedded: Vec<(DocId, String, Vec<f32>)> = docs
            .par_iter()
            .filter_map(|doc| {
                embedder
                    .embed_document(&doc.text_preview)
                    .ok()
                    .map(|vec| (doc.doc_id, doc.text_preview.clone(), vec))
            })
            .collect();

        let now = chrono::Utc::now().timestamp();
        for (doc_id, text, _) in &embedded {
            let meta_line = String::new();
            self.lexical.index_document(*doc_id, text, &meta_line)?;
        }
        self.lexical.commit()?;

        let upserts: Vec<(DocId, Vec<f32>)> = embedded.into_iter().map(|(id, _, v)| (id, v)).collect();
        self.vector.upsert(upserts, now).await?;

        let new_version = compute_index_version(&self.config.config_hash());
        write_index_version(&self.config.data_dir, &new_version);
        *self.index_version.write() = new_version;

        let reindex_ts = chrono::Utc::now().to_rfc3339();
        write_last_full_reindex(&self.config.data_dir, &reindex_ts);

        self.cache.invalidate(&old_namespace).await?;

        self.stats().await
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let document_count = self
            .store
            .count_documents(None, None)
            .await?;
        let indexed_expected = self
            .store
            .count_indexable(self.config.min_text_length)
            .await
            .unwrap_or(document_count);
        let lexical_count = self.lexical.count();
        let vector_count = self.vector.count().await?;
        let indexed_actual = lexical_count.min(vector_count) as i64;
        let stale_index_count = (indexed_expected - indexed_actual).max(0);
        let ingest_status = if self.reindex.is_reindexing() {
            "reindexing".to_string()
        } else {
            "idle".to_string()
        };
        Ok(EngineStats {
            document_count,
            lexical_count,
            vector_count,
            index_version: self.index_version.read().clone(),
            last_full_reindex_ts: read_last_full_reindex(&self.config.data_dir),
            stale_index_count,
            ingest_status,
            cache_hit_rate: self.cache.stats().hit_rate(),
        })
    }
}

pub struct IngestRequest<'a> {
    pub path: &'a str,
    pub filename: &'a str,
    pub title: &'a str,
    pub text: &'a str,
    pub date: Option<&'a str>,
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub doctype: Doctype,
    pub category: Option<&'a str>,
    pub drafter: Option<&'a str>,
    pub department: Option<&'a str>,
    pub claimed_total: Option<i64>,
    pub sum_match: SumMatch,
    pub page_count: Option<i32>,
    pub content_hash: &'a str,
    pub timestamp: i64,
}

pub struct IngestOutcome {
    pub doc_id: DocId,
    pub reindexed: bool,
}

/// Discovers ingestible documents under `documents_root`: each `.pdf` file
/// paired with its already-extracted sibling `.txt` file in an `extracted/`
/// directory beside it, per the Ingestion input contract in `SPEC_FULL.md`
/// §6. The extraction pipeline that produces the `.txt` bodies is out of
/// scope here; this only pairs up what already exists on disk.
pub fn discover_extracted_files(documents_root: &Path) -> Vec<(PathBuf, PathBuf)> {
    let mut pairs = Vec::new();
    for entry in walkdir::WalkDir::new(documents_root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pdf") {
            continue;
        }
        let Some(parent) = path.parent() else { continue };
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        let extracted = parent.join("extracted").join(format!("{stem}.txt"));
        if extracted.exists() {
            pairs.push((path.to_path_buf(), extracted));
        }
    }
    pairs
}

fn read_index_version(data_dir: &Path) -> String {
    std::fs::read_to_string(data_dir.join("index_version.txt"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "v0".to_string())
}

fn write_index_version(data_dir: &Path, version: &str) {
    std::fs::create_dir_all(data_dir).ok();
    std::fs::write(data_dir.join("index_version.txt"), version).ok();
}

/// `"v" + UTC-timestamp + "_" + short-config-hash`, per the `IndexVersion`
/// value contract — any index rebuild or config change produces a fresh
/// namespace so stale cached answers are never served.
fn compute_index_version(config_hash: &str) -> String {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let short_hash = &config_hash[..config_hash.len().min(8)];
    format!("v{ts}_{short_hash}")
}

fn read_last_full_reindex(data_dir: &Path) -> Option<String> {
    std::fs::read_to_string(data_dir.join("last_full_reindex.txt"))
        .ok()
        .map(|s| s.trim().to_string())
}

fn write_last_full_reindex(data_dir: &Path, ts: &str) {
    std::fs::create_dir_all(data_dir).ok();
    std::fs::write(data_dir.join("last_full_reindex.txt"), ts).ok();
}
