//! Dense-vector ANN index over document embeddings, keyed by `doc_{int}`.
//!
//! Adapted from the reference LanceDB wrapper. Ranking uses cosine distance
//! over L2-normalized vectors; since `cosine_distance = 1 - dot_product` for
//! unit vectors, this is equivalent to the inner-product ranking this
//! component is specified against (see `DESIGN.md`).

use anyhow::{Context, Result};
use arrow_array::{Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use lancedb::distance::DistanceType;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::path::Path;
use std::sync::Arc;

use crate::types::DocId;

pub struct VectorIndex {
    db: lancedb::Connection,
    dimension: usize,
    table_name: String,
}

impl VectorIndex {
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(&path.to_string_lossy())
            .execute()
            .await
            .context("failed to connect to LanceDB")?;

        let store = Self { db, dimension, table_name: "documents".to_string() };
        store.ensure_table().await?;
        store.verify_dimension().await?;
        Ok(store)
    }

    /// A loaded index must verify its on-disk vector dimension matches the
    /// configured embedder; a mismatch here is a hard startup abort, not a
    /// warning, since silently truncating or padding vectors would corrupt
    /// every similarity score downstream.
    async fn verify_dimension(&self) -> Result<()> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        let schema = table.schema().await.context("failed to read vector table schema")?;
        let field = schema
            .field_with_name("vector")
            .context("vector table missing 'vector' column")?;
        if let DataType::FixedSizeList(_, size) = field.data_type() {
            if *size as usize != self.dimension {
                anyhow::bail!(
                    "vector index dimension mismatch: on-disk={size} configured={}",
                    self.dimension
                );
            }
        }
        Ok(())
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("doc_id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), self.dimension as i32),
                true,
            ),
            Field::new("created_at", DataType::Int64, false),
        ]))
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if !names.contains(&self.table_name) {
            let schema = self.schema();
            let seed = vec![0.0f32; self.dimension];
            let values = Float32Array::from(seed);
            let vector_field = Field::new("item", DataType::Float32, true);
            let vector_array = FixedSizeListArray::new(
                Arc::new(vector_field),
                self.dimension as i32,
                Arc::new(values) as Arc<dyn Array>,
                None,
            );
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                    Arc::new(vector_array) as Arc<dyn Array>,
                    Arc::new(Int64Array::from(vec![0i64])),
                ],
            )
            .context("failed to build seed record batch")?;

            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            self.db
                .create_table(&self.table_name, Box::new(batches))
                .execute()
                .await
                .context("failed to create vector table")?;

            let table = self.db.open_table(&self.table_name).execute().await?;
            table.delete("doc_id = '__seed__'").await.ok();
        }
        Ok(())
    }

    /// Replace the embedding for a set of documents. Entries with the same
    /// `doc_id` as an existing row are not deduplicated here — callers must
    /// `delete_document` first when re-embedding.
    pub async fn upsert(&self, entries: Vec<(DocId, Vec<f32>)>, timestamp: i64) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let table = self.db.open_table(&self.table_name).execute().await?;
        let schema = self.schema();

        let doc_ids: Vec<String> = entries.iter().map(|(id, _)| id.as_str()).collect();
        let flat: Vec<f32> = entries.iter().flat_map(|(_, v)| v.iter().copied()).collect();
        let values = Float32Array::from(flat);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );
        let created_ats: Vec<i64> = vec![timestamp; entries.len()];

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(doc_ids)) as Arc<dyn Array>,
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(Int64Array::from(created_ats)),
            ],
        )
        .context("failed to build upsert record batch")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(batches))
            .execute()
            .await
            .context("failed to append to vector table")?;
        Ok(())
    }

    pub async fn delete_document(&self, doc_id: DocId) -> Result<()> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        table
            .delete(&format!("doc_id = '{}'", doc_id.as_str()))
            .await
            .context("failed to delete from vector table")?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        table.delete("doc_id != '__never__'").await.ok();
        Ok(())
    }

    /// Top-k nearest neighbors by cosine similarity, returned as `(DocId, score)`
    /// with `score = 1.0 - cosine_distance` (equivalent to inner-product on
    /// L2-normalized query/document vectors).
    pub async fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<(DocId, f32)>> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        let mut results = table
            .vector_search(query_vector.to_vec())
            .context("invalid query vector")?
            .distance_type(DistanceType::Cosine)
            .limit(k)
            .execute()
            .await
            .context("vector search failed")?;

        use futures_util::TryStreamExt;
        let mut out = Vec::new();
        while let Some(batch) = results.try_next().await? {
            let doc_id_col = batch
                .column_by_name("doc_id")
                .context("missing doc_id column")?
                .as_any()
                .downcast_ref::<StringArray>()
                .context("doc_id column is not Utf8")?;
            let distance_col = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>().cloned());

            for i in 0..batch.num_rows() {
                let id_str = doc_id_col.value(i);
                if id_str == "__seed__" {
                    continue;
                }
                if let Some(doc_id) = DocId::parse(id_str) {
                    let distance = distance_col.as_ref().map(|c| c.value(i)).unwrap_or(1.0);
                    out.push((doc_id, 1.0 - distance));
                }
            }
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        let total = table.count_rows(None).await?;
        // The seed row is deleted after table creation; if it somehow
        // survives (e.g. a crash mid-create), callers see it reflected here.
        Ok(total)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}
