//! Vector store implementations for RustedKernel.
//!
//! - [`InMemoryVectorStore`]: process-lifetime collections
//! - [`JsonFileVectorStore`]: one JSON file per collection
//! - [`ingest`]: embed texts through a backend and upsert them

mod collection;
pub mod in_memory;
pub mod ingest;
pub mod json_file;
pub mod vector;

pub use in_memory::InMemoryVectorStore;
pub use ingest::{TEXT_FIELD, TextEntry, embed_and_upsert, embed_texts, search_text, text_schema};
pub use json_file::JsonFileVectorStore;
pub use vector::{cosine_similarity, dot_product, rank, similarity};
