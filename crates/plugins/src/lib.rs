//! Plugin sources and built-in plugins for RustedKernel.
//!
//! A [`PluginSource`] produces a [`Plugin`](rustedkernel_core::Plugin) from a
//! native type, a live object, a directory of prompt templates, or a set of
//! OpenAPI operations. The built-ins give a kernel something useful out of
//! the box: the clock, arithmetic, and semantic text memory.

pub mod math;
pub mod openapi;
pub mod prompt_dir;
pub mod source;
pub mod text_memory;
pub mod time;

pub use math::MathPlugin;
pub use openapi::{
    HttpMethod, HttpOperationRunner, OperationCatalog, OperationDescriptor, OperationParameter,
    OperationRunner, StaticCatalog,
};
pub use source::{NativePlugin, PluginSource};
pub use text_memory::TextMemoryPlugin;
pub use time::TimePlugin;
