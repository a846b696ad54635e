//! A single collection: schema plus records in insertion order.

use rustedkernel_core::error::MemoryError;
use rustedkernel_core::memory::{CollectionSchema, MemoryRecord, SearchHit, VectorQuery};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::vector;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Collection {
    pub schema: CollectionSchema,
    records: Vec<MemoryRecord>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Collection {
    pub fn new(schema: CollectionSchema) -> Self {
        Self {
            schema,
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuild the key index after deserialization.
    pub fn reindex(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key.clone(), i))
            .collect();
    }

    pub fn validate(&self, name: &str, record: &MemoryRecord) -> Result<(), MemoryError> {
        self.schema.validate(name, record)
    }

    /// Insert or replace. A replaced record keeps its original position.
    pub fn upsert(&mut self, record: MemoryRecord) -> String {
        let key = record.key.clone();
        match self.index.get(&key) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(key.clone(), self.records.len());
                self.records.push(record);
            }
        }
        key
    }

    pub fn get(&self, key: &str) -> Option<&MemoryRecord> {
        self.index.get(key).map(|&i| &self.records[i])
    }

    pub fn delete(&mut self, key: &str) -> bool {
        if self.index.remove(key).is_none() {
            return false;
        }
        self.records.retain(|r| r.key != key);
        self.reindex();
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn search(&self, name: &str, query: &VectorQuery) -> Result<Vec<SearchHit>, MemoryError> {
        if query.vector.len() != self.schema.dimensions {
            return Err(MemoryError::DimensionMismatch {
                collection: name.to_string(),
                expected: self.schema.dimensions,
                actual: query.vector.len(),
            });
        }
        Ok(vector::rank(
            &self.records,
            &query.vector,
            self.schema.metric,
            query.top_k,
            query.filter.as_ref(),
            query.min_score,
        ))
    }
}
