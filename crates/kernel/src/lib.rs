//! The function-calling kernel.
//!
//! An invocation moves through four stages:
//!
//! 1. **Render** the prompt template (variables and inline function calls)
//! 2. **Filter** the rendered prompt through the prompt filters
//! 3. **Dispatch** the conversation to the completion backend
//! 4. **If tool calls**: invoke them through the function filters, append
//!    the results, and dispatch again
//!
//! The loop ends on a reply without tool calls or fails once the round cap
//! is exceeded.

pub mod filter;
pub mod kernel;
pub mod stream;
pub mod template;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use filter::{
    Filter, FilterChain, FunctionInvocationContext, FunctionInvocationFilter, Next,
    PromptRenderContext, PromptRenderFilter, Terminal,
};
pub use kernel::{Kernel, KernelBuilder, PromptResult, open_store};
pub use stream::{ChatStream, StreamEvent};
pub use template::PromptTemplate;
