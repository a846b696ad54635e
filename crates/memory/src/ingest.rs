//! Text ingestion: embed through a completion backend, then store.
//!
//! The store never calls the backend itself. These helpers sit in between:
//! one embedding request per text, all in flight at once, and a single
//! batch upsert once every vector is back. Any failure fails the batch.

use futures::future::try_join_all;
use rustedkernel_core::backend::{CompletionBackend, EmbeddingRequest};
use rustedkernel_core::error::{Error, MemoryError, Result};
use rustedkernel_core::memory::{
    CollectionSchema, FieldType, MemoryRecord, SearchHit, SimilarityMetric, VectorQuery, VectorStore,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Field holding the original text of an ingested record.
pub const TEXT_FIELD: &str = "text";

/// A text to ingest. Records without a key get a fresh UUID.
#[derive(Debug, Clone, PartialEq)]
pub struct TextEntry {
    pub key: Option<String>,
    pub text: String,
}

impl TextEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            key: None,
            text: text.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Schema used for collections created by ingestion.
pub fn text_schema(dimensions: usize, metric: SimilarityMetric) -> CollectionSchema {
    CollectionSchema::new(dimensions)
        .with_metric(metric)
        .with_field(TEXT_FIELD, FieldType::String)
}

/// Embed every text concurrently. The first failure wins.
pub async fn embed_texts(
    backend: &dyn CompletionBackend,
    texts: &[String],
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f32>>> {
    let calls = texts.iter().map(|text| async move {
        let response = backend
            .embed(EmbeddingRequest {
                model: None,
                inputs: vec![text.clone()],
            })
            .await?;
        response.embeddings.into_iter().next().ok_or_else(|| {
            Error::from(MemoryError::EmbeddingFailed(
                "backend returned no embedding".into(),
            ))
        })
    });

    let vectors = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        result = try_join_all(calls) => result?,
    };

    if let Some(first) = vectors.first()
        && vectors.iter().any(|v| v.len() != first.len())
    {
        return Err(MemoryError::EmbeddingFailed("embeddings differ in length".into()).into());
    }
    Ok(vectors)
}

/// Embed `entries` and upsert them into `collection`, creating it on first
/// use with the embedding's dimensionality and `metric`.
///
/// Returns the stored keys in input order.
pub async fn embed_and_upsert(
    backend: &dyn CompletionBackend,
    store: &dyn VectorStore,
    collection: &str,
    entries: Vec<TextEntry>,
    metric: SimilarityMetric,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = entries.iter().map(|e| e.text.clone()).collect();
    let vectors = embed_texts(backend, &texts, cancel).await?;
    let dimensions = vectors.first().map(Vec::len).unwrap_or_default();

    if store.collection_schema(collection).await?.is_none() {
        store
            .ensure_collection(collection, text_schema(dimensions, metric))
            .await?;
    }

    let records: Vec<MemoryRecord> = entries
        .into_iter()
        .zip(vectors)
        .map(|(entry, vector)| {
            let key = entry.key.unwrap_or_else(|| Uuid::new_v4().to_string());
            MemoryRecord::new(key, vector).with_field(TEXT_FIELD, entry.text)
        })
        .collect();

    let keys = store.upsert_batch(collection, records).await?;
    debug!(collection, count = keys.len(), "Embedded and upserted texts");
    Ok(keys)
}

/// Embed `query` and search `collection`.
///
/// A collection that does not exist yet yields no hits.
pub async fn search_text(
    backend: &dyn CompletionBackend,
    store: &dyn VectorStore,
    collection: &str,
    query: &str,
    top_k: usize,
    min_score: Option<f32>,
    cancel: &CancellationToken,
) -> Result<Vec<SearchHit>> {
    if store.collection_schema(collection).await?.is_none() {
        return Ok(Vec::new());
    }
    let mut vectors = embed_texts(backend, &[query.to_string()], cancel).await?;
    let Some(vector) = vectors.pop() else {
        return Ok(Vec::new());
    };
    let mut vector_query = VectorQuery::new(vector).with_top_k(top_k);
    if let Some(min) = min_score {
        vector_query = vector_query.with_min_score(min);
    }
    Ok(store.search(collection, vector_query).await?)
}
