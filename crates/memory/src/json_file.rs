//! JSON-file vector store: persistent collections, one file each.
//!
//! Every collection is stored as `<dir>/<collection>.json` holding its schema
//! and records in insertion order. All collections are loaded on open; each
//! mutation is applied to a staged copy of the collection, written out
//! (temporary file, then rename) and only then made visible. Reads are served
//! from memory, so they never see state that is not on disk.

use async_trait::async_trait;
use rustedkernel_core::error::MemoryError;
use rustedkernel_core::memory::{CollectionSchema, MemoryRecord, SearchHit, VectorQuery, VectorStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::collection::Collection;
use crate::in_memory::InMemoryVectorStore;

const FILE_EXTENSION: &str = "json";

pub struct JsonFileVectorStore {
    dir: PathBuf,
    inner: InMemoryVectorStore,
    /// Serializes stage-write-commit so files never go backwards.
    write_lock: Mutex<()>,
}

impl JsonFileVectorStore {
    /// Open (or create) a store rooted at `dir`.
    ///
    /// Files that fail to parse are skipped with a warning.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to create store directory: {e}")))?;

        let mut collections = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to read store directory: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to read store directory: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match load_collection(&path).await {
                Ok(collection) => {
                    collections.insert(name, collection);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable collection file"),
            }
        }

        debug!(dir = %dir.display(), collections = collections.len(), "JSON file vector store opened");
        Ok(Self {
            dir,
            inner: InMemoryVectorStore::from_collections(collections),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, collection: &str) -> Result<PathBuf, MemoryError> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(MemoryError::Storage(format!(
                "Collection name '{collection}' is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{collection}.{FILE_EXTENSION}")))
    }

    /// Copy of `collection` to apply a mutation to.
    async fn stage(&self, collection: &str) -> Result<Collection, MemoryError> {
        self.inner
            .snapshot(collection)
            .await
            .ok_or_else(|| MemoryError::CollectionNotFound(collection.to_string()))
    }

    /// Persist `staged`, then make it the visible state.
    async fn write_and_commit(&self, collection: &str, staged: Collection) -> Result<(), MemoryError> {
        self.write_file(collection, &staged).await?;
        self.inner.commit(collection, staged).await;
        Ok(())
    }

    async fn write_file(&self, collection: &str, staged: &Collection) -> Result<(), MemoryError> {
        let path = self.path_for(collection)?;
        let content = serde_json::to_vec_pretty(staged)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize collection: {e}")))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &content)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to write collection file: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to replace collection file: {e}")))?;
        Ok(())
    }
}

async fn load_collection(path: &Path) -> Result<Collection, MemoryError> {
    let content = tokio::fs::read(path)
        .await
        .map_err(|e| MemoryError::Storage(e.to_string()))?;
    let mut collection: Collection =
        serde_json::from_slice(&content).map_err(|e| MemoryError::Storage(e.to_string()))?;
    collection.reindex();
    Ok(collection)
}

#[async_trait]
impl VectorStore for JsonFileVectorStore {
    fn name(&self) -> &str {
        "json_file"
    }

    async fn ensure_collection(&self, collection: &str, schema: CollectionSchema) -> Result<(), MemoryError> {
        self.path_for(collection)?;
        let _guard = self.write_lock.lock().await;
        if self.inner.collection_schema(collection).await?.is_some() || schema.dimensions == 0 {
            // Existing collections only need the schema check.
            return self.inner.ensure_collection(collection, schema).await;
        }
        self.write_and_commit(collection, Collection::new(schema)).await
    }

    async fn collection_schema(&self, collection: &str) -> Result<Option<CollectionSchema>, MemoryError> {
        self.inner.collection_schema(collection).await
    }

    async fn list_collections(&self) -> Result<Vec<String>, MemoryError> {
        self.inner.list_collections().await
    }

    async fn delete_collection(&self, collection: &str) -> Result<bool, MemoryError> {
        let path = self.path_for(collection)?;
        let _guard = self.write_lock.lock().await;
        if self.inner.collection_schema(collection).await?.is_none() {
            return Ok(false);
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to remove collection file: {e}")))?;
        self.inner.delete_collection(collection).await
    }

    async fn upsert(&self, collection: &str, record: MemoryRecord) -> Result<String, MemoryError> {
        let _guard = self.write_lock.lock().await;
        let mut staged = self.stage(collection).await?;
        staged.validate(collection, &record)?;
        let key = staged.upsert(record);
        self.write_and_commit(collection, staged).await?;
        Ok(key)
    }

    async fn upsert_batch(&self, collection: &str, records: Vec<MemoryRecord>) -> Result<Vec<String>, MemoryError> {
        let _guard = self.write_lock.lock().await;
        let mut staged = self.stage(collection).await?;
        for record in &records {
            staged.validate(collection, record)?;
        }
        let keys = records.into_iter().map(|r| staged.upsert(r)).collect();
        self.write_and_commit(collection, staged).await?;
        Ok(keys)
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<MemoryRecord>, MemoryError> {
        self.inner.get(collection, key).await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, MemoryError> {
        let _guard = self.write_lock.lock().await;
        let mut staged = self.stage(collection).await?;
        if !staged.delete(key) {
            return Ok(false);
        }
        self.write_and_commit(collection, staged).await?;
        Ok(true)
    }

    async fn count(&self, collection: &str) -> Result<usize, MemoryError> {
        self.inner.count(collection).await
    }

    async fn search(&self, collection: &str, query: VectorQuery) -> Result<Vec<SearchHit>, MemoryError> {
        self.inner.search(collection, query).await
    }
}
