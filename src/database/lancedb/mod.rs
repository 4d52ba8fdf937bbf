// LanceDB vector persistence
// One table per collection; the store keeps its own in-memory index on top

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::{
    Connection,
    query::{ExecutableQuery, QueryBase},
};
use tracing::{debug, error, info, warn};

use crate::anonymizer::Redacted;
use crate::store::{Collection, VectorBackend, VectorDocument};
use crate::{FeedbackError, Result};

/// Vector persistence in a LanceDB directory
pub struct LanceBackend {
    connection: Connection,
    dimension: usize,
}

impl std::fmt::Debug for LanceBackend {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanceBackend")
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

fn db_error(context: &str, e: impl std::fmt::Display) -> FeedbackError {
    FeedbackError::Database(format!("{context}: {e}"))
}

impl LanceBackend {
    /// Opens (or creates) the database at `path`.
    ///
    /// `dimension` is used for tables created from now on; existing tables
    /// keep theirs and are reported through `stored_dimension`.
    #[inline]
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        debug!("Opening LanceDB at path: {:?}", path);

        std::fs::create_dir_all(path)
            .map_err(|e| db_error("Failed to create vector database directory", e))?;

        let uri = format!("file://{}", path.display());

        let connection = match lancedb::connect(&uri).execute().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to connect to LanceDB: {}", e);

                let error_msg = e.to_string().to_lowercase();
                if error_msg.contains("corrupt")
                    || error_msg.contains("invalid")
                    || error_msg.contains("malformed")
                {
                    warn!("Database corruption detected, attempting recovery");
                    Self::attempt_corruption_recovery(path)?;

                    lancedb::connect(&uri)
                        .execute()
                        .await
                        .map_err(|e| db_error("Failed to connect to LanceDB after recovery", e))?
                } else {
                    return Err(db_error("Failed to connect to LanceDB", e));
                }
            }
        };

        info!("Vector database opened at {:?}", path);
        Ok(Self {
            connection,
            dimension,
        })
    }

    fn attempt_corruption_recovery(db_path: &Path) -> Result<()> {
        warn!("Attempting database corruption recovery at {:?}", db_path);

        if db_path.exists() {
            let backup_path = db_path.with_extension("corrupted_backup");
            if let Err(e) = std::fs::rename(db_path, &backup_path) {
                error!("Failed to backup corrupted database: {}", e);
            } else {
                info!("Corrupted database backed up to {:?}", backup_path);
            }
        }

        if db_path.exists() {
            std::fs::remove_dir_all(db_path)
                .map_err(|e| db_error("Failed to remove corrupted database", e))?;
        }
        std::fs::create_dir_all(db_path)
            .map_err(|e| db_error("Failed to recreate vector database directory", e))?;

        info!("Database corruption recovery completed");
        Ok(())
    }

    fn schema(vector_dim: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    vector_dim as i32,
                ),
                false,
            ),
            Field::new("text", DataType::Utf8, false),
            Field::new("metadata", DataType::Utf8, false),
            Field::new("domain_key", DataType::Utf8, true),
            Field::new("timestamp", DataType::Utf8, false),
        ]))
    }

    async fn has_table(&self, collection: Collection) -> Result<bool> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| db_error("Failed to list tables", e))?;
        Ok(table_names.iter().any(|name| name == collection.as_str()))
    }

    async fn open_table(&self, collection: Collection) -> Result<lancedb::Table> {
        self.connection
            .open_table(collection.as_str())
            .execute()
            .await
            .map_err(|e| db_error("Failed to open table", e))
    }

    async fn ensure_table(&self, collection: Collection) -> Result<lancedb::Table> {
        if !self.has_table(collection).await? {
            info!(
                "Creating {} table with {} dimensions",
                collection, self.dimension
            );
            self.connection
                .create_empty_table(collection.as_str(), Self::schema(self.dimension))
                .execute()
                .await
                .map_err(|e| db_error("Failed to create table", e))?;
        }
        self.open_table(collection).await
    }

    async fn table_dimension(&self, collection: Collection) -> Result<usize> {
        let table = self.open_table(collection).await?;
        let schema = table
            .schema()
            .await
            .map_err(|e| db_error("Failed to get table schema", e))?;

        for field in schema.fields() {
            if field.name() == "vector" {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return Ok(*size as usize);
                }
            }
        }

        Err(FeedbackError::Database(format!(
            "Could not find vector column in {collection} table"
        )))
    }

    fn record_batch(&self, document: &VectorDocument) -> Result<RecordBatch> {
        if document.embedding.len() != self.dimension {
            return Err(FeedbackError::DimensionMismatch {
                expected: self.dimension,
                actual: document.embedding.len(),
            });
        }

        let metadata = serde_json::to_string(&document.metadata)?;

        let values_array = Float32Array::from(document.embedding.clone());
        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array =
            FixedSizeListArray::try_new(field, self.dimension as i32, Arc::new(values_array), None)
                .map_err(|e| db_error("Failed to create vector array", e))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(vec![document.id.as_str()])),
            Arc::new(vector_array),
            Arc::new(StringArray::from(vec![document.text.as_str()])),
            Arc::new(StringArray::from(vec![metadata.as_str()])),
            Arc::new(StringArray::from(vec![document.domain_key()])),
            Arc::new(StringArray::from(vec![document.timestamp.to_rfc3339()])),
        ];

        RecordBatch::try_new(Self::schema(self.dimension), arrays)
            .map_err(|e| db_error("Failed to create record batch", e))
    }

    fn parse_batch(collection: Collection, batch: &RecordBatch) -> Result<Vec<VectorDocument>> {
        let ids = string_column(batch, "id")?;
        let texts = string_column(batch, "text")?;
        let metadata = string_column(batch, "metadata")?;
        let timestamps = string_column(batch, "timestamp")?;
        let vectors = batch
            .column_by_name("vector")
            .ok_or_else(|| FeedbackError::Database("Missing vector column".to_string()))?
            .as_any()
            .downcast_ref::<FixedSizeListArray>()
            .ok_or_else(|| FeedbackError::Database("Invalid vector column type".to_string()))?;

        let mut documents = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let values = vectors.value(row);
            let embedding = values
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| FeedbackError::Database("Invalid vector item type".to_string()))?
                .values()
                .to_vec();

            let metadata: BTreeMap<String, String> = serde_json::from_str(metadata.value(row))?;
            let timestamp = DateTime::parse_from_rfc3339(timestamps.value(row))
                .map_err(|e| db_error("Invalid timestamp", e))?
                .with_timezone(&Utc);

            documents.push(VectorDocument {
                id: ids.value(row).to_string(),
                collection,
                text: Redacted::from_trusted(texts.value(row)),
                embedding,
                metadata,
                timestamp,
            });
        }

        Ok(documents)
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| FeedbackError::Database(format!("Missing {name} column")))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| FeedbackError::Database(format!("Invalid {name} column type")))
}

fn id_predicate(id: &str) -> String {
    format!("id = '{}'", id.replace('\'', "''"))
}

#[async_trait]
impl VectorBackend for LanceBackend {
    async fn load(&self, collection: Collection) -> Result<Vec<VectorDocument>> {
        if !self.has_table(collection).await? {
            return Ok(Vec::new());
        }

        let table = self.open_table(collection).await?;
        let count = table
            .count_rows(None)
            .await
            .map_err(|e| db_error("Failed to count rows", e))?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut results = table
            .query()
            .limit(count)
            .execute()
            .await
            .map_err(|e| db_error("Failed to scan table", e))?;

        let mut documents = Vec::with_capacity(count);
        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| db_error("Failed to read result stream", e))?
        {
            documents.extend(Self::parse_batch(collection, &batch)?);
        }

        debug!("Loaded {} documents from {} table", documents.len(), collection);
        Ok(documents)
    }

    async fn insert(&self, document: &VectorDocument) -> Result<()> {
        let record_batch = self.record_batch(document)?;
        let table = self.ensure_table(document.collection).await?;

        table
            .delete(&id_predicate(&document.id))
            .await
            .map_err(|e| db_error("Failed to replace document", e))?;

        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| db_error("Failed to insert document", e))?;

        debug!("Stored document {} in {} table", document.id, document.collection);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        if !self.has_table(collection).await? {
            return Ok(false);
        }

        let table = self.open_table(collection).await?;
        let predicate = id_predicate(id);
        let existing = table
            .count_rows(Some(predicate.clone()))
            .await
            .map_err(|e| db_error("Failed to count rows", e))?;
        if existing == 0 {
            return Ok(false);
        }

        table
            .delete(&predicate)
            .await
            .map_err(|e| db_error("Failed to delete document", e))?;
        Ok(true)
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        if self.has_table(collection).await? {
            info!("Dropping {} table", collection);
            self.connection
                .drop_table(collection.as_str())
                .await
                .map_err(|e| db_error("Failed to drop table", e))?;
        }
        Ok(())
    }

    async fn stored_dimension(&self) -> Result<Option<usize>> {
        for collection in Collection::ALL {
            if self.has_table(collection).await? {
                return self.table_dimension(collection).await.map(Some);
            }
        }
        Ok(None)
    }
}
