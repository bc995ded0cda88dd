//! Canonical document store: the single source of truth for document text,
//! metadata, and code occurrences. Backed by SQLite in WAL mode via `sqlx`,
//! with an FTS5 shadow table kept in sync by triggers.
//!
//! Grounded in the reference metadata database's schema, pragma set, and
//! migration-with-backup behavior, with one deliberate divergence: path
//! normalization here rejects an escape rather than warning and continuing
//! (see `DESIGN.md`).

use anyhow::{Context, Result};
use lru::LruCache;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::DocRagError;
use crate::types::{DocId, Document, Doctype, SumMatch};

/// Per-document page split kept hot across repeated `get_page_text` calls
/// for the same document — pagination is derived on first access and
/// reused rather than re-split on every page turn.
const PAGE_CACHE_CAPACITY: usize = 64;

pub struct MetadataStore {
    pool: SqlitePool,
    documents_root: PathBuf,
    page_cache: Mutex<LruCache<DocId, Vec<String>>>,
}

/// Which kind of code match produced a hit, used to weight `ExactCodeIndex` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeMatchKind {
    ExactCode,
    FilenameExact,
    FilenamePartial,
}

impl MetadataStore {
    pub async fn open(db_path: &Path, documents_root: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_millis(5000));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .context("failed to open metadata store")?;

        let store = Self {
            pool,
            documents_root: documents_root.to_path_buf(),
            page_cache: Mutex::new(LruCache::new(NonZeroUsize::new(PAGE_CACHE_CAPACITY).unwrap())),
        };
        store.apply_pragmas().await?;
        store.backup_before_migration(db_path).await?;
        store.init_schema().await?;
        Ok(store)
    }

    /// Schema migrations are forward-only and applied once at startup from a
    /// recorded schema version; a physical copy of the store file is taken
    /// automatically before any migration runs. The current schema is the
    /// only version that has ever shipped (`CREATE TABLE IF NOT EXISTS`
    /// everywhere), so in practice this only fires once a future migration
    /// bumps `SCHEMA_VERSION` above 1.
    async fn backup_before_migration(&self, db_path: &Path) -> Result<()> {
        const SCHEMA_VERSION: i64 = 1;
        sqlx::query("CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&self.pool)
            .await?;
        let recorded: Option<String> = sqlx::query("SELECT value FROM meta WHERE key = 'schema_version'")
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.get("value"));
        let recorded_version: i64 = recorded.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);

        if recorded_version < SCHEMA_VERSION {
            if recorded_version > 0 && db_path.exists() {
                let backup_path = db_path.with_extension(format!(
                    "db.bak.{}",
                    chrono::Utc::now().format("%Y%m%dT%H%M%S")
                ));
                std::fs::copy(db_path, &backup_path)
                    .with_context(|| format!("backing up {} before migration", db_path.display()))?;
                tracing::info!(backup = %backup_path.display(), "backed up metadata store before migration");
            }
            sqlx::query(
                "INSERT INTO meta (key, value) VALUES ('schema_version', ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(SCHEMA_VERSION.to_string())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn apply_pragmas(&self) -> Result<()> {
        for pragma in [
            "PRAGMA journal_mode=WAL",
            "PRAGMA synchronous=NORMAL",
            "PRAGMA temp_store=MEMORY",
            "PRAGMA mmap_size=268435456",
            "PRAGMA busy_timeout=5000",
        ] {
            sqlx::query(pragma).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT UNIQUE NOT NULL,
                filename TEXT NOT NULL,
                title TEXT,
                date TEXT,
                year INTEGER,
                month INTEGER,
                doctype TEXT NOT NULL DEFAULT 'unknown',
                category TEXT,
                drafter TEXT,
                department TEXT,
                claimed_total INTEGER,
                sum_match INTEGER,
                text_preview TEXT NOT NULL DEFAULT '',
                page_count INTEGER,
                content_hash TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_year ON documents(year)",
            "CREATE INDEX IF NOT EXISTS idx_category ON documents(category)",
            "CREATE INDEX IF NOT EXISTS idx_date ON documents(date)",
            "CREATE INDEX IF NOT EXISTS idx_filename ON documents(filename COLLATE NOCASE)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_content_hash ON documents(content_hash)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
                filename, title, text_preview, drafter,
                content=documents, content_rowid=id
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON documents BEGIN
                INSERT INTO documents_fts(rowid, filename, title, text_preview, drafter)
                VALUES (new.id, new.filename, new.title, new.text_preview, new.drafter);
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS documents_ad AFTER DELETE ON documents BEGIN
                INSERT INTO documents_fts(documents_fts, rowid, filename, title, text_preview, drafter)
                VALUES ('delete', old.id, old.filename, old.title, old.text_preview, old.drafter);
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS documents_au AFTER UPDATE ON documents BEGIN
                INSERT INTO documents_fts(documents_fts, rowid, filename, title, text_preview, drafter)
                VALUES ('delete', old.id, old.filename, old.title, old.text_preview, old.drafter);
                INSERT INTO documents_fts(rowid, filename, title, text_preview, drafter)
                VALUES (new.id, new.filename, new.title, new.text_preview, new.drafter);
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                raw_code TEXT NOT NULL,
                norm_code TEXT NOT NULL,
                padded_norm TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_model_codes_norm ON model_codes(norm_code)",
            "CREATE INDEX IF NOT EXISTS idx_model_codes_padded ON model_codes(padded_norm)",
            "CREATE INDEX IF NOT EXISTS idx_model_codes_doc ON model_codes(doc_id)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Reject any path that does not resolve under `documents_root`, catching
    /// both "not a subpath" and "circular reference" failure modes.
    pub fn validate_path(&self, candidate: &Path) -> Result<PathBuf, DocRagError> {
        let root = self
            .documents_root
            .canonicalize()
            .map_err(|e| DocRagError::PathEscape(format!("documents root invalid: {e}")))?;
        let resolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.documents_root.join(candidate)
        };
        let resolved = resolved
            .canonicalize()
            .map_err(|e| DocRagError::PathEscape(format!("{}: {e}", candidate.display())))?;
        match resolved.strip_prefix(&root) {
            Ok(_) => Ok(resolved),
            Err(_) => Err(DocRagError::PathEscape(candidate.display().to_string())),
        }
    }

    /// Insert-or-update by `path`. `doc_id` is assigned on first insert and
    /// never changes. A second insert with the same `content_hash` is treated
    /// as a duplicate (caller is expected to skip re-indexing it).
    pub async fn upsert(&self, doc: &NewDocument<'_>) -> Result<(DocId, bool)> {
        if let Some(existing) = self.get_by_content_hash(doc.content_hash).await? {
            if existing.path != doc.path {
                return Ok((existing.doc_id, true));
            }
        }

        let now = doc.timestamp;
        let row = sqlx::query(
            r#"
            INSERT INTO documents (
                path, filename, title, date, year, month, doctype, category,
                drafter, department, claimed_total, sum_match, text_preview,
                page_count, content_hash, created_at, updated_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(path) DO UPDATE SET
                filename=excluded.filename, title=excluded.title, date=excluded.date,
                year=excluded.year, month=excluded.month, doctype=excluded.doctype,
                category=excluded.category, drafter=excluded.drafter,
                department=excluded.department, claimed_total=excluded.claimed_total,
                sum_match=excluded.sum_match, text_preview=excluded.text_preview,
                page_count=excluded.page_count, content_hash=excluded.content_hash,
                updated_at=excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(doc.path)
        .bind(doc.filename)
        .bind(doc.title)
        .bind(doc.date)
        .bind(doc.year)
        .bind(doc.month)
        .bind(doc.doctype.as_str())
        .bind(doc.category)
        .bind(doc.drafter)
        .bind(doc.department)
        .bind(doc.claimed_total)
        .bind(sum_match_to_i32(doc.sum_match))
        .bind(doc.text_preview)
        .bind(doc.page_count)
        .bind(doc.content_hash)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("upsert document failed")?;

        let id: i64 = row.get("id");
        Ok((DocId(id), false))
    }

    pub async fn replace_codes(&self, doc_id: DocId, codes: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM model_codes WHERE doc_id = ?")
            .bind(doc_id.0)
            .execute(&mut *tx)
            .await?;
        for raw in codes {
            let norm = crate::code_normalizer::normalize_code(raw, true);
            let padded = crate::code_normalizer::padded_norm(&norm);
            sqlx::query(
                "INSERT INTO model_codes (doc_id, raw_code, norm_code, padded_norm) VALUES (?,?,?,?)",
            )
            .bind(doc_id.0)
            .bind(raw)
            .bind(norm)
            .bind(padded)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, doc_id: DocId) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(doc_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_document))
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_document))
    }

    async fn get_by_content_hash(&self, hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE content_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_document))
    }

    pub async fn get_by_filename(&self, filename: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE filename = ? COLLATE NOCASE")
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_document))
    }

    /// Fuzzy filename lookup: normalize both the query and stored filenames
    /// (lowercase, strip `.pdf`, strip separators), substring-match, and
    /// tie-break on closest normalized length.
    pub async fn get_by_filename_fuzzy(&self, name: &str) -> Result<Option<Document>> {
        if let Some(exact) = self.get_by_filename(name).await? {
            return Ok(Some(exact));
        }

        let needle = normalize_filename_for_fuzzy(name);
        if needle.is_empty() {
            return Ok(None);
        }

        let rows = sqlx::query("SELECT * FROM documents")
            .fetch_all(&self.pool)
            .await?;

        let mut best: Option<(usize, Document)> = None;
        for row in rows {
            let doc = row_to_document(row);
            let candidate = normalize_filename_for_fuzzy(&doc.filename);
            if candidate.contains(&needle) || needle.contains(&candidate) {
                let diff = candidate.len().abs_diff(needle.len());
                match &best {
                    Some((best_diff, _)) if *best_diff <= diff => {}
                    _ => best = Some((diff, doc)),
                }
            }
        }
        Ok(best.map(|(_, doc)| doc))
    }

    /// Extracts a single page of a document's body, splitting on on-disk
    /// form-feed page breaks when present and falling back to an even split
    /// over `page_count`. The split is cached in-process per `doc_id` so
    /// repeated page turns over the same document don't re-split the body.
    pub async fn get_page_text(&self, doc_id: DocId, page: usize) -> Result<Option<String>> {
        if let Some(pages) = self.page_cache.lock().get(&doc_id) {
            return Ok(pages.get(page.saturating_sub(1)).cloned());
        }

        let Some(doc) = self.get(doc_id).await? else {
            return Ok(None);
        };
        let pages = split_into_pages(&doc.text_preview, doc.page_count);
        let result = pages.get(page.saturating_sub(1)).cloned();
        self.page_cache.lock().put(doc_id, pages);
        Ok(result)
    }

    /// Updates `text_preview` for the document at `path` (later OCR pass or
    /// reclassification); never changes `doc_id`. Invalidates the in-process
    /// page cache for that document since its body changed.
    pub async fn update_text_preview(&self, path: &str, text: &str) -> Result<()> {
        let row = sqlx::query("UPDATE documents SET text_preview = ?, updated_at = ? WHERE path = ? RETURNING id")
            .bind(text)
            .bind(chrono::Utc::now().timestamp())
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            let doc_id = DocId(row.get("id"));
            self.page_cache.lock().pop(&doc_id);
        }
        Ok(())
    }

    /// Partial field update keyed by `filename`, used for later
    /// reclassification passes (`doctype`, `drafter`, `claimed_total`, ...).
    /// Unset fields are left unchanged.
    pub async fn update_document(&self, filename: &str, fields: DocumentUpdate<'_>) -> Result<bool> {
        let mut sets = vec!["updated_at = ?".to_string()];
        if fields.title.is_some() {
            sets.push("title = ?".to_string());
        }
        if fields.doctype.is_some() {
            sets.push("doctype = ?".to_string());
        }
        if fields.category.is_some() {
            sets.push("category = ?".to_string());
        }
        if fields.drafter.is_some() {
            sets.push("drafter = ?".to_string());
        }
        if fields.department.is_some() {
            sets.push("department = ?".to_string());
        }
        if fields.claimed_total.is_some() {
            sets.push("claimed_total = ?".to_string());
        }
        if fields.sum_match.is_some() {
            sets.push("sum_match = ?".to_string());
        }

        let sql = format!(
            "UPDATE documents SET {} WHERE filename = ? COLLATE NOCASE",
            sets.join(", ")
        );
        let mut q = sqlx::query(&sql).bind(chrono::Utc::now().timestamp());
        if let Some(v) = fields.title {
            q = q.bind(v);
        }
        if let Some(v) = fields.doctype {
            q = q.bind(v.as_str());
        }
        if let Some(v) = fields.category {
            q = q.bind(v);
        }
        if let Some(v) = fields.drafter {
            q = q.bind(v);
        }
        if let Some(v) = fields.department {
            q = q.bind(v);
        }
        if let Some(v) = fields.claimed_total {
            q = q.bind(v);
        }
        if let Some(v) = fields.sum_match {
            q = q.bind(sum_match_to_i32(v));
        }
        q = q.bind(filename);
        let result = q.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deterministic id-ascending pagination, filtering out documents whose
    /// body is too short to be usefully indexed.
    pub async fn list(&self, offset: i64, limit: i64, min_text_length: usize) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE length(text_preview) >= ? ORDER BY id ASC LIMIT ? OFFSET ?",
        )
        .bind(min_text_length as i64)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_document).collect())
    }

    /// Count of documents eligible for indexing (`text_preview` at least
    /// `min_text_length` long) — the expected size of `LexicalIndex` and
    /// `VectorIndex` after a successful reindex.
    pub async fn count_indexable(&self, min_text_length: usize) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM documents WHERE length(text_preview) >= ?")
            .bind(min_text_length as i64)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("c"))
    }

    pub async fn count_documents(&self, drafter: Option<&str>, year: Option<i32>) -> Result<i64> {
        let mut sql = String::from("SELECT COUNT(*) as c FROM documents WHERE 1=1");
        if drafter.is_some() {
            sql.push_str(" AND drafter = ?");
        }
        if year.is_some() {
            sql.push_str(" AND year = ?");
        }
        let mut q = sqlx::query(&sql);
        if let Some(d) = drafter {
            q = q.bind(d);
        }
        if let Some(y) = year {
            q = q.bind(y);
        }
        let row = q.fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("c"))
    }

    pub async fn search_documents(
        &self,
        drafter: Option<&str>,
        year: Option<i32>,
        limit: i64,
    ) -> Result<Vec<Document>> {
        let mut sql = String::from("SELECT * FROM documents WHERE 1=1");
        if drafter.is_some() {
            sql.push_str(" AND drafter = ?");
        }
        if year.is_some() {
            sql.push_str(" AND year = ?");
        }
        sql.push_str(" ORDER BY date DESC, id ASC LIMIT ?");
        let mut q = sqlx::query(&sql);
        if let Some(d) = drafter {
            q = q.bind(d);
        }
        if let Some(y) = year {
            q = q.bind(y);
        }
        q = q.bind(limit);
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_document).collect())
    }

    pub async fn list_unique_drafters(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT drafter FROM documents WHERE drafter IS NOT NULL AND drafter != '' \
             AND drafter NOT IN ('미상', '작성자 미상') ORDER BY drafter",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("drafter")).collect())
    }

    /// Two-pass lookup against `model_codes`: exact match on `norm_code`,
    /// then boundary-safe `LIKE` on `padded_norm` for codes embedded in
    /// longer strings.
    pub async fn list_codes(&self, norm_codes: &[String]) -> Result<Vec<(DocId, String, CodeMatchKind)>> {
        if norm_codes.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();

        let placeholders = norm_codes.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT doc_id, norm_code FROM model_codes WHERE norm_code IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql);
        for c in norm_codes {
            q = q.bind(c);
        }
        for row in q.fetch_all(&self.pool).await? {
            out.push((DocId(row.get("doc_id")), row.get("norm_code"), CodeMatchKind::ExactCode));
        }

        for code in norm_codes {
            let padded = crate::code_normalizer::padded_norm(code);
            let like = format!("%{}%", padded.replace('%', "\\%").replace('_', "\\_"));
            let rows = sqlx::query(
                "SELECT doc_id, norm_code FROM model_codes WHERE padded_norm LIKE ? ESCAPE '\\'",
            )
            .bind(&like)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                out.push((DocId(row.get("doc_id")), row.get("norm_code"), CodeMatchKind::ExactCode));
            }
        }

        // Filename pass, split into exact-token vs partial.
        for code in norm_codes {
            let like = format!("%{}%", code.replace('%', "\\%").replace('_', "\\_"));
            let rows = sqlx::query(
                "SELECT id, filename FROM documents WHERE filename LIKE ? ESCAPE '\\' COLLATE NOCASE",
            )
            .bind(&like)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                let filename: String = row.get("filename");
                let tokens: Vec<String> = filename
                    .split(|c: char| c == '-' || c == '_' || c == ' ' || c == '.')
                    .map(|t| t.to_uppercase())
                    .collect();
                let kind = if tokens.iter().any(|t| t == code) {
                    CodeMatchKind::FilenameExact
                } else {
                    CodeMatchKind::FilenamePartial
                };
                out.push((DocId(row.get("id")), code.clone(), kind));
            }
        }

        Ok(out)
    }

    pub async fn get_statistics(&self) -> Result<StoreStatistics> {
        let total: i64 = sqlx::query("SELECT COUNT(*) as c FROM documents")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let by_year = sqlx::query(
            "SELECT year, COUNT(*) as c FROM documents WHERE year IS NOT NULL GROUP BY year ORDER BY year",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| (r.get::<i32, _>("year"), r.get::<i64, _>("c")))
        .collect();
        let by_category = sqlx::query(
            "SELECT category, COUNT(*) as c FROM documents WHERE category IS NOT NULL GROUP BY category",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| (r.get::<String, _>("category"), r.get::<i64, _>("c")))
        .collect();
        Ok(StoreStatistics { total, by_year, by_category })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub struct NewDocument<'a> {
    pub path: &'a str,
    pub filename: &'a str,
    pub title: &'a str,
    pub date: Option<&'a str>,
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub doctype: Doctype,
    pub category: Option<&'a str>,
    pub drafter: Option<&'a str>,
    pub department: Option<&'a str>,
    pub claimed_total: Option<i64>,
    pub sum_match: SumMatch,
    pub text_preview: &'a str,
    pub page_count: Option<i32>,
    pub content_hash: &'a str,
    pub timestamp: i64,
}

pub struct StoreStatistics {
    pub total: i64,
    pub by_year: Vec<(i32, i64)>,
    pub by_category: Vec<(String, i64)>,
}

#[derive(Debug, Default)]
pub struct DocumentUpdate<'a> {
    pub title: Option<&'a str>,
    pub doctype: Option<Doctype>,
    pub category: Option<&'a str>,
    pub drafter: Option<&'a str>,
    pub department: Option<&'a str>,
    pub claimed_total: Option<i64>,
    pub sum_match: Option<SumMatch>,
}

/// Lowercase, strip `.pdf`, strip `-`/`_`/` `/`.` separators — the
/// normalization `get_by_filename_fuzzy` compares on both sides.
fn normalize_filename_for_fuzzy(name: &str) -> String {
    let lower = name.to_lowercase();
    let stripped = lower.strip_suffix(".pdf").unwrap_or(&lower);
    stripped
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' ' | '.'))
        .collect()
}

/// Splits a document body into pages. Prefers explicit form-feed (`\x0c`)
/// page breaks when the extracted text carries them; otherwise divides the
/// body evenly across the recorded `page_count`.
fn split_into_pages(text: &str, page_count: Option<i32>) -> Vec<String> {
    if text.contains('\x0c') {
        return text.split('\x0c').map(|s| s.to_string()).collect();
    }
    let pages = page_count.filter(|p| *p > 0).unwrap_or(1) as usize;
    if pages <= 1 {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    let chunk_size = chars.len().div_ceil(pages).max(1);
    chars
        .chunks(chunk_size)
        .map(|c| c.iter().collect())
        .collect()
}

fn sum_match_to_i32(v: SumMatch) -> Option<i32> {
    match v {
        SumMatch::True => Some(1),
        SumMatch::False => Some(0),
        SumMatch::Unknown => None,
    }
}

fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Document {
    let sum_match = match row.try_get::<Option<i32>, _>("sum_match").ok().flatten() {
        Some(1) => SumMatch::True,
        Some(0) => SumMatch::False,
        _ => SumMatch::Unknown,
    };
    Document {
        doc_id: DocId(row.get("id")),
        filename: row.get("filename"),
        path: row.get("path"),
        title: row.try_get("title").unwrap_or_default(),
        date: row.try_get("date").ok(),
        year: row.try_get("year").ok(),
        month: row.try_get("month").ok(),
        doctype: Doctype::from_str(&row.get::<String, _>("doctype")),
        drafter: row.try_get("drafter").ok(),
        department: row.try_get("department").ok(),
        category: row.try_get("category").ok(),
        claimed_total: row.try_get("claimed_total").ok(),
        sum_match,
        text_preview: row.try_get("text_preview").unwrap_or_default(),
        page_count: row.try_get("page_count").ok(),
        content_hash: row.try_get("content_hash").unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (MetadataStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let docs_root = dir.path().join("docs");
        std::fs::create_dir_all(&docs_root).unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.db"), &docs_root)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn upsert_assigns_stable_id() {
        let (store, dir) = open_store().await;
        let doc = NewDocument {
            path: "a.pdf",
            filename: "a.pdf",
            title: "A",
            date: None,
            year: Some(2024),
            month: None,
            doctype: Doctype::Generic,
            category: None,
            drafter: Some("홍길동"),
            department: None,
            claimed_total: None,
            sum_match: SumMatch::Unknown,
            text_preview: "some body text",
            page_count: Some(1),
            content_hash: "hash-a",
            timestamp: 1,
        };
        let (id1, dup1) = store.upsert(&doc).await.unwrap();
        assert!(!dup1);
        let (id2, _) = store.upsert(&doc).await.unwrap();
        assert_eq!(id1, id2);
        drop(dir);
    }

    #[tokio::test]
    async fn path_escape_rejected() {
        let (store, _dir) = open_store().await;
        let escaped = Path::new("../../etc/passwd");
        assert!(store.validate_path(escaped).is_err());
    }

    #[tokio::test]
    async fn list_codes_finds_exact_and_padded() {
        let (store, dir) = open_store().await;
        let doc = NewDocument {
            path: "b.pdf",
            filename: "b.pdf",
            title: "B",
            date: None,
            year: None,
            month: None,
            doctype: Doctype::Generic,
            category: None,
            drafter: None,
            department: None,
            claimed_total: None,
            sum_match: SumMatch::Unknown,
            text_preview: "contains XRN1620B2 inline",
            page_count: None,
            content_hash: "hash-b",
            timestamp: 1,
        };
        let (doc_id, _) = store.upsert(&doc).await.unwrap();
        store
            .replace_codes(doc_id, &["XRN-1620B2".to_string()])
            .await
            .unwrap();
        let hits = store.list_codes(&["XRN1620B2".to_string()]).await.unwrap();
        assert!(hits.iter().any(|(id, _, _)| *id == doc_id));
        drop(dir);
    }

    fn sample_doc<'a>(path: &'a str, filename: &'a str, hash: &'a str) -> NewDocument<'a> {
        NewDocument {
            path,
            filename,
            title: "T",
            date: None,
            year: None,
            month: None,
            doctype: Doctype::Generic,
            category: None,
            drafter: None,
            department: None,
            claimed_total: None,
            sum_match: SumMatch::Unknown,
            text_preview: "0123456789abcdefghij",
            page_count: Some(2),
            content_hash: hash,
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn fuzzy_filename_matches_despite_separators() {
        let (store, dir) = open_store().await;
        let doc = sample_doc("c.pdf", "2024-10-24_채널에이_보수건.pdf", "hash-c");
        store.upsert(&doc).await.unwrap();
        let found = store
            .get_by_filename_fuzzy("채널에이 보수건")
            .await
            .unwrap();
        assert!(found.is_some());
        drop(dir);
    }

    #[tokio::test]
    async fn page_text_splits_evenly_and_caches() {
        let (store, dir) = open_store().await;
        let doc = sample_doc("d.pdf", "d.pdf", "hash-d");
        let (doc_id, _) = store.upsert(&doc).await.unwrap();

        let page1 = store.get_page_text(doc_id, 1).await.unwrap().unwrap();
        let page2 = store.get_page_text(doc_id, 2).await.unwrap().unwrap();
        assert_eq!(format!("{page1}{page2}"), "0123456789abcdefghij");
        assert!(store.page_cache.lock().contains(&doc_id));
        drop(dir);
    }

    #[tokio::test]
    async fn update_text_preview_invalidates_page_cache() {
        let (store, dir) = open_store().await;
        let doc = sample_doc("e.pdf", "e.pdf", "hash-e");
        let (doc_id, _) = store.upsert(&doc).await.unwrap();

        let _ = store.get_page_text(doc_id, 1).await.unwrap();
        assert!(store.page_cache.lock().contains(&doc_id));

        store.update_text_preview("e.pdf", "brand new body text").await.unwrap();
        assert!(!store.page_cache.lock().contains(&doc_id));

        let refreshed = store.get(doc_id).await.unwrap().unwrap();
        assert_eq!(refreshed.text_preview, "brand new body text");
        drop(dir);
    }

    #[tokio::test]
    async fn update_document_sets_requested_fields_only() {
        let (store, dir) = open_store().await;
        let doc = sample_doc("f.pdf", "f.pdf", "hash-f");
        store.upsert(&doc).await.unwrap();

        let updated = store
            .update_document(
                "f.pdf",
                DocumentUpdate {
                    doctype: Some(Doctype::Repair),
                    drafter: Some("김철수"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let doc = store.get_by_filename("f.pdf").await.unwrap().unwrap();
        assert_eq!(doc.doctype.as_str(), "repair");
        assert_eq!(doc.drafter.as_deref(), Some("김철수"));
        assert_eq!(doc.title, "T");
    }
}
