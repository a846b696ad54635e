//! Vector store trait: collections of records with embedding vectors.
//!
//! A store holds named collections. Each collection declares its schema
//! once (field list, vector dimensionality, similarity metric) and every
//! record must conform to it. The store only ever holds vectors that were
//! computed elsewhere; it never calls an embedding backend itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::MemoryError;

/// Default number of search results.
pub const DEFAULT_TOP_K: usize = 5;

/// Similarity metric, fixed per collection at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// Cosine similarity in [-1, 1]; identical directions score 1
    #[default]
    Cosine,
    /// Raw dot product
    DotProduct,
}

/// Declared type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
}

impl FieldType {
    /// Whether `value` is acceptable for a field of this type.
    pub fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Layout of a collection: declared once, invariant thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,

    pub dimensions: usize,

    #[serde(default)]
    pub metric: SimilarityMetric,
}

impl CollectionSchema {
    pub fn new(dimensions: usize) -> Self {
        Self {
            fields: Vec::new(),
            dimensions,
            metric: SimilarityMetric::default(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDefinition::new(name, field_type));
        self
    }

    pub fn with_metric(mut self, metric: SimilarityMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Check a record against this schema.
    pub fn validate(&self, collection: &str, record: &MemoryRecord) -> Result<(), MemoryError> {
        if record.key.is_empty() {
            return Err(MemoryError::InvalidRecord {
                key: record.key.clone(),
                reason: "record key must not be empty".into(),
            });
        }
        if record.vector.len() != self.dimensions {
            return Err(MemoryError::DimensionMismatch {
                collection: collection.to_string(),
                expected: self.dimensions,
                actual: record.vector.len(),
            });
        }
        if let Some(i) = record.vector.iter().position(|x| !x.is_finite()) {
            return Err(MemoryError::InvalidRecord {
                key: record.key.clone(),
                reason: format!("vector component {i} is not finite"),
            });
        }
        for (name, value) in &record.fields {
            let Some(def) = self.fields.iter().find(|f| &f.name == name) else {
                return Err(MemoryError::InvalidRecord {
                    key: record.key.clone(),
                    reason: format!("unknown field '{name}'"),
                });
            };
            if !value.is_null() && !def.field_type.accepts(value) {
                return Err(MemoryError::InvalidRecord {
                    key: record.key.clone(),
                    reason: format!("field '{name}' is not of type {:?}", def.field_type),
                });
            }
        }
        Ok(())
    }
}

/// A record: unique key, named scalar/text fields, and its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub key: String,

    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,

    pub vector: Vec<f32>,
}

impl MemoryRecord {
    pub fn new(key: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
            vector,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Equality filter over record fields; every clause must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub equals: Vec<(String, serde_json::Value)>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equal_to(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        self.equals
            .iter()
            .all(|(field, value)| record.fields.get(field) == Some(value))
    }
}

/// A similarity query against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorQuery {
    pub vector: Vec<f32>,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<SearchFilter>,

    /// Results scoring below this are dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

impl VectorQuery {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            top_k: DEFAULT_TOP_K,
            filter: None,
            min_score: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// A search result: the record and its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub record: MemoryRecord,
    pub score: f32,
}

/// The core VectorStore trait.
///
/// Implementations: in-memory, JSON-file persisted.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The store name (e.g., "in_memory", "json_file").
    fn name(&self) -> &str;

    /// Create the collection if it does not exist.
    ///
    /// Idempotent for an identical schema; a different schema for an
    /// existing collection is a [`MemoryError::SchemaMismatch`].
    async fn ensure_collection(&self, collection: &str, schema: CollectionSchema) -> Result<(), MemoryError>;

    /// The schema of a collection, if it exists.
    async fn collection_schema(&self, collection: &str) -> Result<Option<CollectionSchema>, MemoryError>;

    /// Names of all collections.
    async fn list_collections(&self) -> Result<Vec<String>, MemoryError>;

    /// Drop a collection and its records.
    async fn delete_collection(&self, collection: &str) -> Result<bool, MemoryError>;

    /// Insert or replace a record by key. Returns the key.
    async fn upsert(&self, collection: &str, record: MemoryRecord) -> Result<String, MemoryError>;

    /// Upsert many records; nothing is written unless every record is valid.
    async fn upsert_batch(&self, collection: &str, records: Vec<MemoryRecord>) -> Result<Vec<String>, MemoryError>;

    /// Get a record by key.
    async fn get(&self, collection: &str, key: &str) -> Result<Option<MemoryRecord>, MemoryError>;

    /// Delete a record by key.
    async fn delete(&self, collection: &str, key: &str) -> Result<bool, MemoryError>;

    /// Number of records in a collection.
    async fn count(&self, collection: &str) -> Result<usize, MemoryError>;

    /// Rank records by similarity, best first; ties keep insertion order.
    async fn search(&self, collection: &str, query: VectorQuery) -> Result<Vec<SearchHit>, MemoryError>;
}
