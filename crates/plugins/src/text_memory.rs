//! TextMemory plugin: save and recall free text through a vector store.
//!
//! Texts are embedded with the completion backend's embedding capability
//! and stored under the collection given per call (or the plugin default).

use rustedkernel_core::backend::CompletionBackend;
use rustedkernel_core::error::BoxError;
use rustedkernel_core::function::{KernelArguments, KernelFunction, ParameterSpec, ParameterType};
use rustedkernel_core::memory::{SimilarityMetric, VectorStore};
use rustedkernel_memory::{TEXT_FIELD, TextEntry, embed_and_upsert, search_text};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_COLLECTION: &str = "generic";

pub struct TextMemoryPlugin {
    backend: Arc<dyn CompletionBackend>,
    store: Arc<dyn VectorStore>,
    collection: String,
    metric: SimilarityMetric,
}

impl TextMemoryPlugin {
    pub fn new(backend: Arc<dyn CompletionBackend>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            backend,
            store,
            collection: DEFAULT_COLLECTION.to_string(),
            metric: SimilarityMetric::default(),
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_metric(mut self, metric: SimilarityMetric) -> Self {
        self.metric = metric;
        self
    }

    fn collection_for(&self, args: &KernelArguments) -> String {
        args.get_str("collection")
            .unwrap_or(&self.collection)
            .to_string()
    }

    async fn save(&self, args: KernelArguments, cancel: &CancellationToken) -> Result<serde_json::Value, BoxError> {
        let text = args.get_str("input").ok_or("'input' must be a string")?;
        let mut entry = TextEntry::new(text);
        if let Some(key) = args.get_str("key") {
            entry = entry.with_key(key);
        }
        let collection = self.collection_for(&args);
        let keys = embed_and_upsert(
            self.backend.as_ref(),
            self.store.as_ref(),
            &collection,
            vec![entry],
            self.metric,
            cancel,
        )
        .await?;
        debug!(collection = %collection, "Saved text to memory");
        Ok(keys.into_iter().next().unwrap_or_default().into())
    }

    /// One hit comes back as plain text, several as a JSON array of texts.
    async fn recall(&self, args: KernelArguments, cancel: &CancellationToken) -> Result<serde_json::Value, BoxError> {
        let query = args.get_str("input").ok_or("'input' must be a string")?;
        let limit = args
            .get("limit")
            .and_then(serde_json::Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(1);
        let min_relevance = args
            .get("min_relevance")
            .and_then(serde_json::Value::as_f64)
            .map(|n| n as f32);
        let collection = self.collection_for(&args);

        let hits = search_text(
            self.backend.as_ref(),
            self.store.as_ref(),
            &collection,
            query,
            limit,
            min_relevance,
            cancel,
        )
        .await?;

        let texts: Vec<serde_json::Value> = hits
            .into_iter()
            .filter_map(|hit| hit.record.fields.get(TEXT_FIELD).cloned())
            .collect();
        Ok(match (limit, texts.len()) {
            (_, 0) => serde_json::Value::String(String::new()),
            (1, _) => texts.into_iter().next().unwrap_or_default(),
            _ => serde_json::Value::Array(texts),
        })
    }
}

impl crate::source::NativePlugin for TextMemoryPlugin {
    fn description(&self) -> &str {
        "Save and recall text through semantic memory"
    }

    fn functions(self: Arc<Self>) -> Vec<KernelFunction> {
        let saver = Arc::clone(&self);
        let recaller = self;
        vec![
            KernelFunction::from_cancellable_fn(
                "Save",
                "Save a piece of text to semantic memory",
                vec![
                    ParameterSpec::required("input", ParameterType::String, "The text to save"),
                    ParameterSpec::optional("key", ParameterType::String, "Record key; generated when absent"),
                    ParameterSpec::optional("collection", ParameterType::String, "Memory collection"),
                ],
                move |args, cancel| {
                    let this = Arc::clone(&saver);
                    async move { this.save(args, &cancel).await }
                },
            ),
            KernelFunction::from_cancellable_fn(
                "Recall",
                "Recall the texts in semantic memory most related to the input",
                vec![
                    ParameterSpec::required("input", ParameterType::String, "What to recall"),
                    ParameterSpec::optional("limit", ParameterType::Integer, "Maximum number of texts")
                        .with_default(1),
                    ParameterSpec::optional(
                        "min_relevance",
                        ParameterType::Number,
                        "Minimum similarity score",
                    ),
                    ParameterSpec::optional("collection", ParameterType::String, "Memory collection"),
                ],
                move |args, cancel| {
                    let this = Arc::clone(&recaller);
                    async move { this.recall(args, &cancel).await }
                },
            ),
        ]
    }
}

impl std::fmt::Debug for TextMemoryPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextMemoryPlugin")
            .field("backend", &self.backend.name())
            .field("store", &self.store.name())
            .field("collection", &self.collection)
            .finish()
    }
}
