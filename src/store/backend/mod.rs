
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Collection, VectorDocument};
use crate::{FeedbackError, Result};

/// Durable home for [`VectorDocument`]s, one logical table per [`Collection`].
///
/// The store keeps its own in-memory copy for search; a backend only has to
/// persist writes and hand everything back on `load`.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn load(&self, collection: Collection) -> Result<Vec<VectorDocument>>;

    async fn insert(&self, document: &VectorDocument) -> Result<()>;

    /// Returns whether a document was removed
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool>;

    async fn clear(&self, collection: Collection) -> Result<()>;

    /// Dimension of vectors already persisted, `None` when nothing has been stored yet
    async fn stored_dimension(&self) -> Result<Option<usize>>;
}

/// Process-local backend; contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    collections: Mutex<HashMap<Collection, Vec<VectorDocument>>>,
}

impl MemoryBackend {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Collection, Vec<VectorDocument>>>> {
        self.collections
            .lock()
            .map_err(|_| FeedbackError::Store("memory backend lock poisoned".to_string()))
    }
}

#[async_trait]
impl VectorBackend for MemoryBackend {
    async fn load(&self, collection: Collection) -> Result<Vec<VectorDocument>> {
        let collections = self.lock()?;
        Ok(collections.get(&collection).cloned().unwrap_or_default())
    }

    async fn insert(&self, document: &VectorDocument) -> Result<()> {
        let mut collections = self.lock()?;
        let documents = collections.entry(document.collection).or_default();
        documents.retain(|existing| existing.id != document.id);
        documents.push(document.clone());
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let mut collections = self.lock()?;
        let Some(documents) = collections.get_mut(&collection) else {
            return Ok(false);
        };
        let before = documents.len();
        documents.retain(|document| document.id != id);
        Ok(documents.len() != before)
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        self.lock()?.remove(&collection);
        Ok(())
    }

    async fn stored_dimension(&self) -> Result<Option<usize>> {
        let collections = self.lock()?;
        Ok(collections
            .values()
            .flatten()
            .map(|document| document.embedding.len())
            .next())
    }
}
