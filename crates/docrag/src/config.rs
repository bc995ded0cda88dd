use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::DocRagError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRagConfig {
    pub data_dir: PathBuf,
    pub documents_root: PathBuf,
    pub min_text_length: usize,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
    pub reindex: ReindexConfig,
    pub llm: LlmConfig,
    pub cors: CorsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model_dir: PathBuf,
    pub model_name: String,
    pub dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub bm25_top_k: usize,
    pub vec_top_k: usize,
    pub rrf_k: usize,
    pub final_top_k: usize,
    pub author_boost: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TtlMode {
    Sliding,
    Absolute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_seconds: u64,
    pub ttl_mode: TtlMode,
    pub max_db_mb: u64,
    pub cleanup_prob: f64,
    pub allow_ungrounded_chat: bool,
    pub inflight_wait_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexConfig {
    pub lock_timeout_secs: f64,
    pub poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub endpoint: String,
    pub max_retry: u32,
    pub max_context_tokens: usize,
    pub max_response_tokens: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub trust_proxy: bool,
    pub allowed_proxy_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl DocRagConfig {
    /// Validate config values, returning a `ConfigError` for clearly broken configurations.
    pub fn validate(&self) -> Result<(), DocRagError> {
        if self.embedding.dimension == 0 {
            return Err(DocRagError::Config("embedding.dimension must be > 0".into()));
        }
        if self.min_text_length == 0 {
            return Err(DocRagError::Config("min_text_length must be > 0".into()));
        }
        if self.retrieval.rrf_k == 0 {
            return Err(DocRagError::Config("retrieval.rrf_k must be > 0".into()));
        }
        if self.retrieval.final_top_k == 0 {
            return Err(DocRagError::Config("retrieval.final_top_k must be > 0".into()));
        }
        if !(100..=1000).contains(&self.cache.max_size) {
            return Err(DocRagError::Config("cache.max_size must be in [100, 1000]".into()));
        }
        if !(0.0..=1.0).contains(&self.cache.cleanup_prob) {
            return Err(DocRagError::Config("cache.cleanup_prob must be in [0.0, 1.0]".into()));
        }
        if self.llm.max_context_tokens == 0 {
            return Err(DocRagError::Config("llm.max_context_tokens must be > 0".into()));
        }
        if !self.documents_root.is_absolute() && self.documents_root != PathBuf::from(".") {
            tracing::warn!(
                path = %self.documents_root.display(),
                "documents_root is not absolute; path-escape checks rely on canonicalization"
            );
        }
        Ok(())
    }

    /// Load config from a JSON file, then validate.
    pub fn from_file(path: &Path) -> Result<Self, DocRagError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DocRagError::Config(format!("failed to read config file: {e}")))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| DocRagError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// A short, stable hash of the fields that affect index/cache compatibility —
    /// embedded in the cache namespace so a tokenization or dimension change
    /// invalidates cached answers without an explicit flush.
    pub fn config_hash(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        self.embedding.model_name.hash(&mut hasher);
        self.embedding.dimension.hash(&mut hasher);
        self.retrieval.rrf_k.hash(&mut hasher);
        self.retrieval.bm25_top_k.hash(&mut hasher);
        self.retrieval.vec_top_k.hash(&mut hasher);
        self.min_text_length.hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }
}

impl Default for DocRagConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docrag");

        let model_dir = if Path::new("models").exists() {
            PathBuf::from("models")
        } else if let Ok(env_path) = std::env::var("MODEL_PATH") {
            PathBuf::from(env_path)
        } else {
            data_dir.join("models")
        };

        let e5_available = model_dir.join("multilingual-e5-base").exists();
        let dimension = if e5_available { 768 } else { 384 };

        Self {
            data_dir: data_dir.clone(),
            documents_root: data_dir.join("documents"),
            min_text_length: 100,
            embedding: EmbeddingConfig {
                model_dir,
                model_name: if e5_available {
                    "multilingual-e5-base".to_string()
                } else {
                    "multilingual-e5-small".to_string()
                },
                dimension,
            },
            retrieval: RetrievalConfig {
                bm25_top_k: 20,
                vec_top_k: 20,
                rrf_k: 60,
                final_top_k: 5,
                author_boost: 2.0,
            },
            cache: CacheConfig {
                max_size: 500,
                ttl_seconds: 7200,
                ttl_mode: TtlMode::Sliding,
                max_db_mb: 256,
                cleanup_prob: 0.01,
                allow_ungrounded_chat: false,
                inflight_wait_timeout_secs: 10,
            },
            reindex: ReindexConfig {
                lock_timeout_secs: 1.5,
                poll_ms: 200,
            },
            llm: LlmConfig {
                endpoint: "http://localhost:8080/v1/chat/completions".to_string(),
                max_retry: 1,
                max_context_tokens: 2000,
                max_response_tokens: 1200,
                request_timeout_secs: 120,
            },
            cors: CorsConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        DocRagConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_dimension() {
        let mut cfg = DocRagConfig::default();
        cfg.embedding.dimension = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_cache_size() {
        let mut cfg = DocRagConfig::default();
        cfg.cache.max_size = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_hash_stable_for_same_inputs() {
        let cfg = DocRagConfig::default();
        assert_eq!(cfg.config_hash(), cfg.config_hash());
    }
}
