//! Vector storage using LanceDB for semantic search

use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::connect;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::DistanceType;
use uuid::Uuid;

use crate::capability::{
    IndexEntry, VectorFilter, VectorHit, VectorIndex, VectorPayload, VectorRecord,
};
use crate::error::{Error, Result};

const PAYLOAD_COLUMNS: [&str; 7] = [
    "id",
    "user_id",
    "data",
    "hash",
    "metadata",
    "created_at",
    "updated_at",
];

/// Vector index backed by a LanceDB table
pub struct LanceDbIndex {
    db: lancedb::Connection,
    table: String,
    dimensions: usize,
}

impl LanceDbIndex {
    /// Connect to the database at `path` and make sure the table exists
    pub async fn open(path: &Path, table: &str, dimensions: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| Error::config(format!("Vector path is not UTF-8: {:?}", path)))?;
        let db = connect(uri)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        let index = Self {
            db,
            table: table.to_string(),
            dimensions,
        };

        index.ensure_collection().await?;

        Ok(index)
    }

    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("user_id", DataType::Utf8, false),
            Field::new("data", DataType::Utf8, false),
            Field::new("hash", DataType::Utf8, false),
            Field::new("metadata", DataType::Utf8, false),
            Field::new("created_at", DataType::Utf8, true),
            Field::new("updated_at", DataType::Utf8, true),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimensions as i32,
                ),
                false,
            ),
        ])
    }

    async fn open_table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(&self.table)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))
    }

    fn to_batch(&self, records: &[VectorRecord]) -> Result<RecordBatch> {
        let mut values = Vec::with_capacity(records.len() * self.dimensions);
        for record in records {
            if record.vector.len() != self.dimensions {
                return Err(Error::vector_db(format!(
                    "Embedding dimension mismatch: expected {}, got {}",
                    self.dimensions,
                    record.vector.len()
                )));
            }
            values.extend_from_slice(&record.vector);
        }

        let strings = |f: fn(&VectorRecord) -> String| {
            StringArray::from(records.iter().map(f).collect::<Vec<_>>())
        };
        let optional = |f: fn(&VectorRecord) -> Option<String>| {
            StringArray::from(records.iter().map(f).collect::<Vec<_>>())
        };

        let metadata = records
            .iter()
            .map(|r| serde_json::to_string(&r.payload.metadata))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let vector_array = FixedSizeListArray::try_new_from_values(
            Float32Array::from(values),
            self.dimensions as i32,
        )
        .map_err(|e: arrow_schema::ArrowError| Error::vector_db(e.to_string()))?;

        RecordBatch::try_new(
            Arc::new(self.schema()),
            vec![
                Arc::new(strings(|r| r.id.to_string())) as Arc<dyn Array>,
                Arc::new(strings(|r| r.payload.user_id.clone())),
                Arc::new(strings(|r| r.payload.data.clone())),
                Arc::new(strings(|r| r.payload.hash.clone())),
                Arc::new(StringArray::from(metadata)),
                Arc::new(optional(|r| r.payload.created_at.clone())),
                Arc::new(optional(|r| r.payload.updated_at.clone())),
                Arc::new(vector_array),
            ],
        )
        .map_err(|e| Error::vector_db(e.to_string()))
    }
}

/// SQL filter for a [`VectorFilter`]
fn filter_sql(filter: &VectorFilter) -> Option<String> {
    filter
        .user_id
        .as_ref()
        .map(|user| format!("user_id = '{}'", user.replace('\'', "''")))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::vector_db(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::vector_db(format!("{} column is not StringArray", name)))
}

fn optional_string(column: &StringArray, i: usize) -> Option<String> {
    (!column.is_null(i)).then(|| column.value(i).to_string())
}

/// Decode payload rows; malformed ids become `None`
fn entries_from_batch(batch: &RecordBatch) -> Result<Vec<IndexEntry>> {
    let ids = string_column(batch, "id")?;
    let users = string_column(batch, "user_id")?;
    let data = string_column(batch, "data")?;
    let hashes = string_column(batch, "hash")?;
    let metadata = string_column(batch, "metadata")?;
    let created = string_column(batch, "created_at")?;
    let updated = string_column(batch, "updated_at")?;

    let mut entries = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let id = optional_string(ids, i).and_then(|s| Uuid::parse_str(&s).ok());
        entries.push(IndexEntry {
            id,
            payload: VectorPayload {
                user_id: users.value(i).to_string(),
                data: data.value(i).to_string(),
                hash: hashes.value(i).to_string(),
                metadata: serde_json::from_str(metadata.value(i))
                    .unwrap_or(serde_json::Value::Null),
                created_at: optional_string(created, i),
                updated_at: optional_string(updated, i),
            },
        });
    }
    Ok(entries)
}

#[async_trait]
impl VectorIndex for LanceDbIndex {
    async fn ensure_collection(&self) -> Result<()> {
        let tables = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        if tables.contains(&self.table) {
            let schema = self
                .open_table()
                .await?
                .schema()
                .await
                .map_err(|e| Error::vector_db(e.to_string()))?;
            let existing = schema
                .field_with_name("vector")
                .map_err(|e| Error::vector_db(e.to_string()))?;
            if let DataType::FixedSizeList(_, size) = existing.data_type() {
                if *size as usize != self.dimensions {
                    return Err(Error::vector_db(format!(
                        "Collection {} has {}-dimensional vectors, expected {}",
                        self.table, size, self.dimensions
                    )));
                }
            }
            return Ok(());
        }

        tracing::info!(
            table = %self.table,
            dimensions = self.dimensions,
            "Creating vector collection"
        );
        let schema = Arc::new(self.schema());
        let empty_batch = RecordBatch::new_empty(schema.clone());
        let reader = RecordBatchIterator::new(vec![Ok(empty_batch)], schema);

        self.db
            .create_table(&self.table, Box::new(reader))
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        Ok(())
    }

    // Lance commits are durable when `execute` resolves, so `wait` always holds.
    async fn upsert(&self, records: Vec<VectorRecord>, _wait: bool) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let batch = self.to_batch(&records)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let table = self.open_table().await?;
        let mut merge_insert = table.merge_insert(&["id"]);
        merge_insert
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge_insert
            .execute(Box::new(reader))
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>> {
        if vector.len() != self.dimensions {
            return Err(Error::vector_db(format!(
                "Query dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }

        let table = self.open_table().await?;
        let mut query = table
            .vector_search(vector.to_vec())
            .map_err(|e| Error::vector_db(e.to_string()))?
            .distance_type(DistanceType::Cosine)
            .limit(limit);

        if let Some(sql) = filter_sql(filter) {
            query = query.only_if(sql);
        }

        let batches: Vec<RecordBatch> = query
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let mut hits = Vec::new();
        for batch in batches {
            let distances = batch
                .column_by_name("_distance")
                .ok_or_else(|| Error::vector_db("Missing _distance column"))?
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| Error::vector_db("_distance column is not Float32Array"))?;

            for (i, entry) in entries_from_batch(&batch)?.into_iter().enumerate() {
                hits.push(VectorHit {
                    id: entry.id,
                    // cosine distance -> similarity
                    score: 1.0 - distances.value(i),
                    payload: entry.payload,
                });
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(hits)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let table = self.open_table().await?;
        table
            .delete(&format!("id = '{}'", id))
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, filter: &VectorFilter, limit: usize) -> Result<Vec<IndexEntry>> {
        let table = self.open_table().await?;
        let mut query = table
            .query()
            .select(Select::columns(&PAYLOAD_COLUMNS))
            .limit(limit);

        if let Some(sql) = filter_sql(filter) {
            query = query.only_if(sql);
        }

        let batches: Vec<RecordBatch> = query
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let mut entries = Vec::new();
        for batch in &batches {
            entries.extend(entries_from_batch(batch)?);
        }
        Ok(entries)
    }
}
