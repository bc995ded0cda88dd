//! BM25 full-text index over document bodies, keyed by `doc_{int}`.
//!
//! Adapted from the reference Tantivy wrapper: the `id` field must be
//! `STRING | STORED` (indexed but not tokenized) for `delete_term` to work.

use anyhow::{Context, Result};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{self, Schema, Value as TantivyValue, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

use crate::types::DocId;

pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    id_field: schema::Field,
    text_field: schema::Field,
    meta_field: schema::Field,
}

impl LexicalIndex {
    fn build_schema() -> (Schema, schema::Field, schema::Field, schema::Field) {
        let mut sb = Schema::builder();
        let id_field = sb.add_text_field("id", STRING | STORED);
        let text_field = sb.add_text_field("text", TEXT | STORED);
        // Structured metadata line (filename keywords, drafter, category, date,
        // title) is prepended to the indexed text so filter-like intents
        // ("남준수 작성 문서") are lexically recoverable; kept separately
        // indexable for potential future field-scoped queries.
        let meta_field = sb.add_text_field("meta", TEXT);
        (sb.build(), id_field, text_field, meta_field)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let index_path = path.join("lexical_index");
        std::fs::create_dir_all(&index_path).ok();

        let (schema, id_field, text_field, meta_field) = Self::build_schema();

        let index = {
            let dir = tantivy::directory::MmapDirectory::open(&index_path)?;
            if Index::exists(&dir)? {
                Index::open_in_dir(&index_path)?
            } else {
                Index::create_in_dir(&index_path, schema.clone())?
            }
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("failed to create tantivy reader")?;

        let writer = index.writer(50_000_000).context("failed to create tantivy writer")?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            id_field,
            text_field,
            meta_field,
        })
    }

    /// `meta_line` carries filename keywords, drafter, category, date, and
    /// title; it is prepended to the augmented body before tokenization.
    pub fn index_document(&self, doc_id: DocId, text: &str, meta_line: &str) -> Result<()> {
        let writer = self.writer.lock();
        let augmented = format!("{meta_line}\n{text}");
        writer.add_document(doc!(
            self.id_field => doc_id.as_str(),
            self.text_field => augmented,
            self.meta_field => meta_line,
        ))?;
        Ok(())
    }

    pub fn delete_document(&self, doc_id: DocId) -> Result<()> {
        let writer = self.writer.lock();
        let term = tantivy::Term::from_field_text(self.id_field, &doc_id.as_str());
        writer.delete_term(term);
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.commit().context("tantivy commit failed")?;
        self.reader.reload()?;
        Ok(())
    }

    /// Returns `(DocId, rank, score)` triples, ranked best-first.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<(DocId, f32)>> {
        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field, self.meta_field]);

        let parsed_query = match query_parser.parse_query(query) {
            Ok(q) => q,
            Err(_) => {
                let escaped = query.replace('"', "");
                let fallback = QueryParser::for_index(&self.index, vec![self.text_field]);
                fallback.parse_query(&format!("\"{escaped}\""))?
            }
        };

        let top_docs = searcher.search(&parsed_query, &TopDocs::with_limit(k))?;
        let mut out = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            if let Ok(tdoc) = searcher.doc::<TantivyDocument>(addr) {
                if let Some(id_val) = tdoc.get_first(self.id_field) {
                    if let Some(id_text) = id_val.as_str() {
                        if let Some(doc_id) = DocId::parse(id_text) {
                            out.push((doc_id, score));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_all_documents()?;
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn index_and_search_roundtrip() {
        let dir = TempDir::new().unwrap();
        let idx = LexicalIndex::open(dir.path()).unwrap();
        idx.index_document(DocId(1), "채널에이 중계차 노후 보수건 견적서", "filename meta").unwrap();
        idx.index_document(DocId(2), "소모품 구매 요청서", "filename meta").unwrap();
        idx.commit().unwrap();

        let results = idx.search("중계차 보수", 10).unwrap();
        assert!(results.iter().any(|(id, _)| *id == DocId(1)));
        assert_eq!(idx.count(), 2);
    }

    #[test]
    fn delete_removes_document() {
        let dir = TempDir::new().unwrap();
        let idx = LexicalIndex::open(dir.path()).unwrap();
        idx.index_document(DocId(1), "테스트 문서", "meta").unwrap();
        idx.commit().unwrap();
        assert_eq!(idx.count(), 1);

        idx.delete_document(DocId(1)).unwrap();
        idx.commit().unwrap();
        assert_eq!(idx.count(), 0);
    }
}
