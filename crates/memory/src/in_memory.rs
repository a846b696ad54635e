//! In-memory vector store. Collections live for the process lifetime.

use async_trait::async_trait;
use rustedkernel_core::error::MemoryError;
use rustedkernel_core::memory::{CollectionSchema, MemoryRecord, SearchHit, VectorQuery, VectorStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::collection::Collection;

/// A vector store that keeps every collection in memory.
///
/// Reads take a shared lock; writes (collection creation, upserts) take an
/// exclusive one.
#[derive(Clone, Default)]
pub struct InMemoryVectorStore {
    collections: Arc<RwLock<HashMap<String, Collection>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_collections(collections: HashMap<String, Collection>) -> Self {
        Self {
            collections: Arc::new(RwLock::new(collections)),
        }
    }

    /// Clone of one collection, used by persisting stores.
    pub(crate) async fn snapshot(&self, collection: &str) -> Option<Collection> {
        self.collections.read().await.get(collection).cloned()
    }

    /// Install `staged` as the current state of `collection`.
    pub(crate) async fn commit(&self, collection: &str, staged: Collection) {
        self.collections.write().await.insert(collection.to_string(), staged);
    }
}

fn not_found(collection: &str) -> MemoryError {
    MemoryError::CollectionNotFound(collection.to_string())
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn ensure_collection(&self, collection: &str, schema: CollectionSchema) -> Result<(), MemoryError> {
        if schema.dimensions == 0 {
            return Err(MemoryError::SchemaMismatch {
                collection: collection.to_string(),
                reason: "vector dimensionality must be > 0".into(),
            });
        }

        let mut collections = self.collections.write().await;
        match collections.get(collection) {
            Some(existing) if existing.schema == schema => Ok(()),
            Some(existing) => Err(MemoryError::SchemaMismatch {
                collection: collection.to_string(),
                reason: format!(
                    "declared with {} dimensions and {:?} metric; schema cannot change",
                    existing.schema.dimensions, existing.schema.metric
                ),
            }),
            None => {
                debug!(collection, dimensions = schema.dimensions, "Creating collection");
                collections.insert(collection.to_string(), Collection::new(schema));
                Ok(())
            }
        }
    }

    async fn collection_schema(&self, collection: &str) -> Result<Option<CollectionSchema>, MemoryError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|c| c.schema.clone()))
    }

    async fn list_collections(&self) -> Result<Vec<String>, MemoryError> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_collection(&self, collection: &str) -> Result<bool, MemoryError> {
        Ok(self.collections.write().await.remove(collection).is_some())
    }

    async fn upsert(&self, collection: &str, record: MemoryRecord) -> Result<String, MemoryError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| not_found(collection))?;
        target.validate(collection, &record)?;
        Ok(target.upsert(record))
    }

    async fn upsert_batch(&self, collection: &str, records: Vec<MemoryRecord>) -> Result<Vec<String>, MemoryError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| not_found(collection))?;
        for record in &records {
            target.validate(collection, record)?;
        }
        Ok(records.into_iter().map(|r| target.upsert(r)).collect())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        let collections = self.collections.read().await;
        let target = collections.get(collection).ok_or_else(|| not_found(collection))?;
        Ok(target.get(key).cloned())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, MemoryError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| not_found(collection))?;
        Ok(target.delete(key))
    }

    async fn count(&self, collection: &str) -> Result<usize, MemoryError> {
        let collections = self.collections.read().await;
        let target = collections.get(collection).ok_or_else(|| not_found(collection))?;
        Ok(target.len())
    }

    async fn search(&self, collection: &str, query: VectorQuery) -> Result<Vec<SearchHit>, MemoryError> {
        let collections = self.collections.read().await;
        let target = collections.get(collection).ok_or_else(|| not_found(collection))?;
        target.search(collection, &query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustedkernel_core::memory::{FieldType, SimilarityMetric};

    fn schema() -> CollectionSchema {
        CollectionSchema::new(3).with_field("text", FieldType::String)
    }

    async fn store_with_three() -> InMemoryVectorStore {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("docs", schema()).await.unwrap();
        store
            .upsert_batch(
                "docs",
                vec![
                    MemoryRecord::new("a", vec![1.0, 0.0, 0.0]).with_field("text", "alpha"),
                    MemoryRecord::new("b", vec![0.0, 1.0, 0.0]).with_field("text", "beta"),
                    MemoryRecord::new("c", vec![0.7, 0.7, 0.0]).with_field("text", "gamma"),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("docs", schema()).await.unwrap();
        let record = MemoryRecord::new("k1", vec![0.1, 0.2, 0.3]).with_field("text", "same");

        store.upsert("docs", record.clone()).await.unwrap();
        store.upsert("docs", record.clone()).await.unwrap();

        assert_eq!(store.count("docs").await.unwrap(), 1);
        let stored = store.get("docs", "k1").await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn upsert_replaces_by_key() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("docs", schema()).await.unwrap();
        store
            .upsert("docs", MemoryRecord::new("k1", vec![1.0, 0.0, 0.0]).with_field("text", "old"))
            .await
            .unwrap();
        store
            .upsert("docs", MemoryRecord::new("k1", vec![0.0, 1.0, 0.0]).with_field("text", "new"))
            .await
            .unwrap();
        let stored = store.get("docs", "k1").await.unwrap().unwrap();
        assert_eq!(stored.fields["text"], "new");
        assert_eq!(store.count("docs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn search_ranks_identical_vector_first() {
        let store = store_with_three().await;
        let hits = store
            .search("docs", VectorQuery::new(vec![0.0, 1.0, 0.0]).with_top_k(3))
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].record.key, "b");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn search_rejects_wrong_query_dimension() {
        let store = store_with_three().await;
        let err = store
            .search("docs", VectorQuery::new(vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("docs", schema()).await.unwrap();
        let err = store
            .upsert_batch(
                "docs",
                vec![
                    MemoryRecord::new("ok", vec![1.0, 0.0, 0.0]),
                    MemoryRecord::new("bad", vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::DimensionMismatch { .. }));
        assert_eq!(store.count("docs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ensure_collection_is_idempotent_but_schema_is_fixed() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("docs", schema()).await.unwrap();
        store.ensure_collection("docs", schema()).await.unwrap();
        let err = store
            .ensure_collection("docs", schema().with_metric(SimilarityMetric::DotProduct))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::SchemaMismatch { .. }));
        assert_eq!(store.list_collections().await.unwrap(), ["docs"]);
    }

    #[tokio::test]
    async fn missing_collection_is_an_error() {
        let store = InMemoryVectorStore::new();
        let err = store
            .upsert("nowhere", MemoryRecord::new("k", vec![1.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::CollectionNotFound(_)));
    }

    #[tokio::test]
    async fn delete_record_and_collection() {
        let store = store_with_three().await;
        assert!(store.delete("docs", "b").await.unwrap());
        assert!(!store.delete("docs", "b").await.unwrap());
        assert_eq!(store.count("docs").await.unwrap(), 2);
        assert!(store.get("docs", "c").await.unwrap().is_some());

        assert!(store.delete_collection("docs").await.unwrap());
        assert!(store.collection_schema("docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_finite_vectors_are_rejected() {
        let store = store_with_three().await;
        for bad in [f32::NAN, f32::INFINITY] {
            let err = store
                .upsert("docs", MemoryRecord::new("bad", vec![bad, 0.0, 0.0]))
                .await
                .unwrap_err();
            assert!(matches!(err, MemoryError::InvalidRecord { ref key, .. } if key == "bad"));
        }
        assert_eq!(store.count("docs").await.unwrap(), 3);
    }
}
