//! Two-tier answer cache: an in-memory LRU+TTL fast path backed by a
//! persistent SQLite tier, with single-flight de-duplication so concurrent
//! identical queries share one computation.
//!
//! Coherency policy (decided in `DESIGN.md`): the tiers are not kept
//! strictly coherent. The persistent tier is authoritative on an in-memory
//! miss; a hit there backfills tier 1. Tier 1 is a fast path only, never a
//! source of truth a caller reconciles against.

use anyhow::{Context, Result};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{CacheConfig, TtlMode};
use crate::query_router::author_query_variants;
use crate::types::QueryMode;

/// Fixed synonym table applied to the token stream before hashing, so
/// near-duplicate phrasings share a cache key.
const SYNONYMS: &[(&str, &str)] = &[
    ("합계", "총액"),
    ("가격", "금액"),
    ("찾아줘", "검색"),
    ("찾아", "검색"),
    ("얼마였지", "얼마"),
    ("알려줘", "알려"),
];

/// `namespace = index_version + "|" + config_hash`; embedded in every cache
/// key so an index rebuild or config change invalidates old answers without
/// an explicit flush.
pub fn namespace(index_version: &str, config_hash: &str) -> String {
    format!("{index_version}|{config_hash}")
}

/// Lowercase, collapse whitespace, strip punctuation, apply the synonym
/// table, and resolve relative-date tokens ("오늘"/"어제"/"이번달") to the
/// actual formatted date, the same way the reference's
/// `normalize_date_expressions` does — so a cached "오늘" answer does not
/// leak across a day boundary. `today` is threaded in by the caller rather
/// than read here, so this stays a pure function of its inputs.
fn normalize_query(query: &str, today: chrono::NaiveDate) -> String {
    let lower = query.to_lowercase();
    let yesterday = today - chrono::Duration::days(1);
    let today_str = today.format("%Y년 %m월 %d일").to_string();
    let yesterday_str = yesterday.format("%Y년 %m월 %d일").to_string();
    let this_month_str = today.format("%Y년 %m월").to_string();

    let mut tokens: Vec<String> = lower
        .split_whitespace()
        .map(|tok| {
            let cleaned: String = tok
                .chars()
                .filter(|c| c.is_alphanumeric() || *c as u32 > 0x2e80) // keep CJK
                .collect();
            cleaned
        })
        .filter(|t| !t.is_empty())
        .collect();

    for tok in &mut tokens {
        for (from, to) in SYNONYMS {
            if tok == from {
                *tok = to.to_string();
            }
        }
    }

    for tok in &mut tokens {
        *tok = match tok.as_str() {
            "오늘" => today_str.clone(),
            "어제" => yesterday_str.clone(),
            "이번달" => this_month_str.clone(),
            other => other.to_string(),
        };
    }

    tokens.join(" ")
}

/// `smart_key(query, mode)`: a hash over the normalized query plus mode tag,
/// with relative-date tokens resolved against the current UTC date.
pub fn smart_key(query: &str, mode: QueryMode) -> String {
    smart_key_as_of(query, mode, chrono::Utc::now().date_naive())
}

/// Same as [`smart_key`] but with the "current date" supplied explicitly,
/// so callers (and tests) can pin it instead of reading the wall clock.
pub fn smart_key_as_of(query: &str, mode: QueryMode, today: chrono::NaiveDate) -> String {
    let normalized = normalize_query(query, today);
    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    mode.as_str().hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

pub fn cache_key(namespace: &str, query: &str, mode: QueryMode) -> String {
    format!("{namespace}::{}", smart_key(query, mode))
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Envelope<T> {
    v: u32,
    payload: T,
}

struct MemEntry<T> {
    value: T,
    created_at: Instant,
    accessed_at: Instant,
}

/// Tier 1: an in-memory LRU with sliding or absolute TTL. All operations are
/// mutually exclusive under a single lock.
pub struct MemoryCache<T: Clone> {
    inner: Mutex<LruCache<String, MemEntry<T>>>,
    ttl: Duration,
    mode: TtlMode,
    hits: Mutex<u64>,
    misses: Mutex<u64>,
}

impl<T: Clone> MemoryCache<T> {
    pub fn new(max_size: usize, ttl: Duration, mode: TtlMode) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
            mode,
            hits: Mutex::new(0),
            misses: Mutex::new(0),
        }
    }

    fn is_expired(&self, entry: &MemEntry<T>, now: Instant) -> bool {
        let basis = match self.mode {
            TtlMode::Absolute => entry.created_at,
            TtlMode::Sliding => entry.accessed_at,
        };
        now.duration_since(basis) > self.ttl
    }

    /// Purges expired entries, then looks up `key`.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.peek(key) {
            if self.is_expired(entry, now) {
                guard.pop(key);
                *self.misses.lock() += 1;
                return None;
            }
        } else {
            *self.misses.lock() += 1;
            return None;
        }
        let value = {
            let entry = guard.get_mut(key).unwrap();
            entry.accessed_at = now;
            entry.value.clone()
        };
        *self.hits.lock() += 1;
        Some(value)
    }

    pub fn set(&self, key: String, value: T) {
        let now = Instant::now();
        self.inner.lock().put(
            key,
            MemEntry { value, created_at: now, accessed_at: now },
        );
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Remove every entry whose key starts with `prefix` (used when a
    /// reindex invalidates a stale namespace).
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut guard = self.inner.lock();
        let stale: Vec<String> = guard
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            guard.pop(&key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            len: self.inner.lock().len(),
            hits: *self.hits.lock(),
            misses: *self.misses.lock(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of `begin_inflight`.
pub enum InflightRole {
    Leader,
    Follower,
}

/// Single-flight de-duplication, guarding against cache-stampedes on a
/// concurrent miss. Bounded by a timeout so a leader that never calls
/// `end_inflight` (e.g. it panicked) cannot wedge its followers forever.
pub struct InflightTracker {
    state: Mutex<HashSet<String>>,
    condvar: Condvar,
}

impl Default for InflightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InflightTracker {
    pub fn new() -> Self {
        Self { state: Mutex::new(HashSet::new()), condvar: Condvar::new() }
    }

    pub fn begin_inflight(&self, key: &str) -> InflightRole {
        let mut guard = self.state.lock();
        if guard.insert(key.to_string()) {
            InflightRole::Leader
        } else {
            InflightRole::Follower
        }
    }

    /// Blocks the follower until the leader calls `end_inflight`, or until
    /// `timeout` elapses. The caller MUST re-check the cache after waking,
    /// regardless of which path woke it, and become its own leader on a
    /// subsequent miss.
    pub fn wait_inflight(&self, key: &str, timeout: Duration) {
        let mut guard = self.state.lock();
        let deadline = Instant::now() + timeout;
        while guard.contains(key) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            let result = self.condvar.wait_for(&mut guard, remaining);
            if result.timed_out() {
                return;
            }
        }
    }

    pub fn end_inflight(&self, key: &str) {
        self.state.lock().remove(key);
        self.condvar.notify_all();
    }
}

/// Tier 2: a persistent SQLite-backed cache, authoritative on an in-memory
/// miss. Payloads are a versioned `{v:1, payload}` JSON envelope.
pub struct PersistentCache {
    pool: SqlitePool,
    max_db_mb: u64,
    cleanup_prob: f64,
    ttl: Duration,
    ttl_mode: TtlMode,
}

impl PersistentCache {
    pub async fn open(db_path: &Path, config: &CacheConfig) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(5000));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .context("failed to open persistent cache")?;

        for pragma in [
            "PRAGMA journal_mode=WAL",
            "PRAGMA synchronous=NORMAL",
            "PRAGMA temp_store=MEMORY",
            "PRAGMA mmap_size=67108864",
            "PRAGMA busy_timeout=5000",
        ] {
            sqlx::query(pragma).execute(&pool).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                accessed_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_accessed ON cache_entries(accessed_at)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            max_db_mb: config.max_db_mb,
            cleanup_prob: config.cleanup_prob,
            ttl: Duration::from_secs(config.ttl_seconds),
            ttl_mode: config.ttl_mode,
        })
    }

    pub async fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row = sqlx::query(
            "SELECT payload, created_at, accessed_at FROM cache_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let created_at: i64 = row.get("created_at");
        let accessed_at: i64 = row.get("accessed_at");
        let now = chrono::Utc::now().timestamp();
        let basis = match self.ttl_mode {
            TtlMode::Absolute => created_at,
            TtlMode::Sliding => created_at.max(accessed_at),
        };
        if now - basis > self.ttl.as_secs() as i64 {
            sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await
                .ok();
            return Ok(None);
        }

        sqlx::query(
            "UPDATE cache_entries SET accessed_at = ?, access_count = access_count + 1 WHERE key = ?",
        )
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await
        .ok();

        let payload: String = row.get("payload");
        let envelope: Envelope<T> = serde_json::from_str(&payload)
            .context("corrupt cache envelope")?;
        Ok(Some(envelope.payload))
    }

    /// UPSERT preserving `created_at`; probabilistically triggers
    /// maintenance so the cost of cleanup/eviction is amortized.
    pub async fn set<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let envelope = Envelope { v: 1, payload: value };
        let payload = serde_json::to_string(&envelope)?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, payload, created_at, accessed_at, access_count)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                accessed_at = excluded.accessed_at,
                access_count = cache_entries.access_count + 1
            "#,
        )
        .bind(key)
        .bind(&payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("cache upsert failed")?;

        if rand_probability() < self.cleanup_prob {
            self.cleanup_expired().await.ok();
            self.enforce_size_limit().await.ok();
        }
        Ok(())
    }

    /// Removes entries past their TTL; sliding TTL uses `max(created_at, accessed_at)`.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let cutoff = now - self.ttl.as_secs() as i64;
        let result = match self.ttl_mode {
            TtlMode::Absolute => {
                sqlx::query("DELETE FROM cache_entries WHERE created_at < ?")
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await?
            }
            TtlMode::Sliding => {
                sqlx::query(
                    "DELETE FROM cache_entries WHERE MAX(created_at, accessed_at) < ?",
                )
                .bind(cutoff)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Evicts least-recently-accessed rows in bulk when the on-disk file
    /// exceeds `max_db_mb`.
    pub async fn enforce_size_limit(&self) -> Result<u64> {
        let page_count: i64 = sqlx::query("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        let page_size: i64 = sqlx::query("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        let size_mb = (page_count * page_size) as u64 / (1024 * 1024);
        if size_mb <= self.max_db_mb {
            return Ok(0);
        }

        // Evict the oldest-accessed 10% of rows, bounded to a sane batch.
        let total: i64 = sqlx::query("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        let batch = ((total / 10).max(1)).min(10_000);
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE key IN (SELECT key FROM cache_entries ORDER BY accessed_at ASC LIMIT ?)",
        )
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes every key starting with `prefix`; used to invalidate a stale
    /// namespace after a successful reindex without stopping readers.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<u64> {
        let like = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let result = sqlx::query("DELETE FROM cache_entries WHERE key LIKE ? ESCAPE '\\'")
            .bind(&like)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// `rand` is not part of this stack; a cheap time-seeded LCG is sufficient
/// here since the cleanup trigger only needs to be roughly uniform, not
/// cryptographically sound.
fn rand_probability() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1_000_000) as f64 / 1_000_000.0
}

/// The two-tier cache facade a caller actually talks to. Never calls back
/// into the retriever; recomputation is the composer's job, not the
/// cache's (breaks the cyclic "retriever -> cache -> retriever" reference
/// in the reference implementation, see `DESIGN.md`).
pub struct CacheLayer<T: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static> {
    memory: MemoryCache<T>,
    persistent: PersistentCache,
    inflight: InflightTracker,
    inflight_timeout: Duration,
}

impl<T: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static> CacheLayer<T> {
    pub async fn open(db_path: &Path, config: &CacheConfig) -> Result<Self> {
        let persistent = PersistentCache::open(db_path, config).await?;
        Ok(Self {
            memory: MemoryCache::new(config.max_size, Duration::from_secs(config.ttl_seconds), config.ttl_mode),
            persistent,
            inflight: InflightTracker::new(),
            inflight_timeout: Duration::from_secs(config.inflight_wait_timeout_secs),
        })
    }

    /// Tier 1 first; on miss, tier 2 is consulted and a hit there backfills
    /// tier 1 (see the coherency policy in the module doc).
    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        if let Some(v) = self.memory.get(key) {
            return Ok(Some(v));
        }
        if let Some(v) = self.persistent.get::<T>(key).await? {
            self.memory.set(key.to_string(), v.clone());
            return Ok(Some(v));
        }
        Ok(None)
    }

    pub async fn set(&self, key: &str, value: T) -> Result<()> {
        self.persistent.set(key, &value).await?;
        self.memory.set(key.to_string(), value);
        Ok(())
    }

    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    pub async fn invalidate(&self, prefix: &str) -> Result<u64> {
        self.memory.invalidate_prefix(prefix);
        self.persistent.invalidate_prefix(prefix).await
    }

    pub fn stats(&self) -> CacheStats {
        self.memory.stats()
    }

    pub fn begin_inflight(&self, key: &str) -> InflightRole {
        self.inflight.begin_inflight(key)
    }

    pub fn wait_inflight(&self, key: &str) {
        self.inflight.wait_inflight(key, self.inflight_timeout);
    }

    pub fn end_inflight(&self, key: &str) {
        self.inflight.end_inflight(key);
    }
}

/// Rewrite a query to the `author_query_variants` canonical form before
/// hashing when the caller already knows the extracted author, so
/// equivalent author-intent phrasings collapse to one cache key. Exposed
/// for `DocRagEngine` to call alongside the router's own expansion.
pub fn author_aware_key(namespace: &str, author: Option<&str>, query: &str, mode: QueryMode) -> String {
    match author {
        Some(name) => {
            let canonical = author_query_variants(name).join("|");
            cache_key(namespace, &canonical, mode)
        }
        None => cache_key(namespace, query, mode),
    }
}

pub type SharedCacheLayer<T> = Arc<CacheLayer<T>>;

pub type InflightMap = Mutex<HashMap<String, Arc<InflightTracker>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn memory_cache_expires_sliding() {
        let cache: MemoryCache<String> = MemoryCache::new(10, Duration::from_millis(10), TtlMode::Sliding);
        cache.set("k".to_string(), "v".to_string());
        assert_eq!(cache.get("k"), Some("v".to_string()));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn memory_cache_invalidate_prefix() {
        let cache: MemoryCache<String> = MemoryCache::new(10, Duration::from_secs(60), TtlMode::Absolute);
        cache.set("ns1::a".to_string(), "1".to_string());
        cache.set("ns2::a".to_string(), "2".to_string());
        cache.invalidate_prefix("ns1::");
        assert_eq!(cache.get("ns1::a"), None);
        assert_eq!(cache.get("ns2::a"), Some("2".to_string()));
    }

    #[test]
    fn smart_key_stable_for_synonymous_queries() {
        let a = smart_key("합계 금액이 얼마였지", QueryMode::Cost);
        let b = smart_key("총액 금액이 얼마", QueryMode::Cost);
        assert_eq!(a, b);
    }

    #[test]
    fn relative_date_token_resolves_to_absolute_date_and_moves_with_it() {
        let day1 = chrono::NaiveDate::from_ymd_opt(2024, 10, 24).unwrap();
        let day2 = chrono::NaiveDate::from_ymd_opt(2024, 10, 25).unwrap();
        let a = smart_key_as_of("오늘 보수건 얼마였지", QueryMode::Cost, day1);
        let b = smart_key_as_of("오늘 보수건 얼마였지", QueryMode::Cost, day2);
        assert_ne!(a, b, "a cached '오늘' answer must not survive a day boundary");

        let same_day_again = smart_key_as_of("오늘 보수건 얼마였지", QueryMode::Cost, day1);
        assert_eq!(a, same_day_again);
    }

    #[test]
    fn single_flight_follower_woken_by_end_inflight() {
        let tracker = Arc::new(InflightTracker::new());
        assert!(matches!(tracker.begin_inflight("k"), InflightRole::Leader));
        assert!(matches!(tracker.begin_inflight("k"), InflightRole::Follower));

        let t2 = tracker.clone();
        let handle = std::thread::spawn(move || {
            t2.wait_inflight("k", Duration::from_secs(5));
        });
        std::thread::sleep(Duration::from_millis(20));
        tracker.end_inflight("k");
        handle.join().unwrap();
    }

    #[test]
    fn single_flight_follower_times_out_and_can_become_leader() {
        let tracker = InflightTracker::new();
        assert!(matches!(tracker.begin_inflight("k"), InflightRole::Leader));
        assert!(matches!(tracker.begin_inflight("k"), InflightRole::Follower));
        tracker.wait_inflight("k", Duration::from_millis(20));
        // Leader never called end_inflight (simulated panic); the key is
        // still marked in-flight, but the follower's wait returned anyway.
        tracker.end_inflight("k");
        assert!(matches!(tracker.begin_inflight("k"), InflightRole::Leader));
    }

    #[tokio::test]
    async fn persistent_cache_roundtrip_and_namespace_invalidate() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            max_size: 100,
            ttl_seconds: 3600,
            ttl_mode: TtlMode::Absolute,
            max_db_mb: 256,
            cleanup_prob: 0.0,
            allow_ungrounded_chat: false,
            inflight_wait_timeout_secs: 5,
        };
        let cache = PersistentCache::open(&dir.path().join("cache.db"), &config).await.unwrap();
        let ns = namespace("v1", "abc");
        let key = cache_key(&ns, "테스트 쿼리", QueryMode::Qa);

        cache.set(&key, &"answer".to_string()).await.unwrap();
        let got: Option<String> = cache.get(&key).await.unwrap();
        assert_eq!(got, Some("answer".to_string()));

        let removed = cache.invalidate_prefix(&ns).await.unwrap();
        assert_eq!(removed, 1);
        let got_after: Option<String> = cache.get(&key).await.unwrap();
        assert_eq!(got_after, None);
    }

    #[tokio::test]
    async fn cache_layer_backfills_memory_from_persistent() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            max_size: 100,
            ttl_seconds: 3600,
            ttl_mode: TtlMode::Absolute,
            max_db_mb: 256,
            cleanup_prob: 0.0,
            allow_ungrounded_chat: false,
            inflight_wait_timeout_secs: 5,
        };
        let layer: CacheLayer<String> = CacheLayer::open(&dir.path().join("cache.db"), &config).await.unwrap();
        layer.set("k", "v".to_string()).await.unwrap();
        layer.clear_memory();
        // First get backfills from the persistent tier.
        assert_eq!(layer.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(layer.memory.get("k"), Some("v".to_string()));
    }
}
