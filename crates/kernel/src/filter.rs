//! Onion-model filter chain.
//!
//! Filters wrap one pipeline stage: prompt rendering or function
//! invocation. Each filter gets the stage context and a [`Next`]
//! continuation. Work done before `next.run(..)` happens in registration
//! order; work done after it happens in reverse order. `Next` is consumed
//! by `run`, so a filter calls it at most once; not calling it
//! short-circuits the stage and the filter is then responsible for the
//! context's output (`rendered_prompt` or `result`).
//!
//! An error a filter raises itself becomes [`Error::Filter`] and aborts the
//! invocation. Errors that come back out of `next` pass through unchanged.

use async_trait::async_trait;
use rustedkernel_core::error::{Error, Result};
use rustedkernel_core::function::{FunctionMetadata, FunctionResult, KernelArguments};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Context of one render call.
#[derive(Debug, Clone)]
pub struct PromptRenderContext {
    pub template: String,
    pub arguments: KernelArguments,
    /// Set once by the renderer; filters may rewrite it after `next`
    pub rendered_prompt: Option<String>,
    pub cancellation: CancellationToken,
}

/// Context of one function invocation.
#[derive(Debug, Clone)]
pub struct FunctionInvocationContext {
    pub function: FunctionMetadata,
    pub arguments: KernelArguments,
    /// Set by the function; filters may rewrite it after `next`
    pub result: Option<FunctionResult>,
    pub cancellation: CancellationToken,
}

#[async_trait]
pub trait Filter<C: Send>: Send + Sync {
    /// Name reported in [`Error::Filter`].
    fn name(&self) -> &str;

    async fn intercept(&self, context: &mut C, next: Next<'_, C>) -> Result<()>;
}

/// The innermost stage a chain wraps.
#[async_trait]
pub trait Terminal<C: Send>: Send + Sync {
    async fn run(&self, context: &mut C) -> Result<()>;
}

pub type PromptRenderFilter = dyn Filter<PromptRenderContext>;
pub type FunctionInvocationFilter = dyn Filter<FunctionInvocationContext>;

/// Continuation handed to a filter: the rest of the chain plus the terminal.
pub struct Next<'a, C> {
    filters: &'a [Arc<dyn Filter<C>>],
    terminal: &'a dyn Terminal<C>,
    failed: &'a AtomicBool,
}

impl<C: Send> Next<'_, C> {
    /// Run the remaining filters and the terminal stage.
    pub async fn run(self, context: &mut C) -> Result<()> {
        let result = match self.filters.split_first() {
            None => self.terminal.run(context).await,
            Some((filter, rest)) => {
                let inner_failed = AtomicBool::new(false);
                let next = Next {
                    filters: rest,
                    terminal: self.terminal,
                    failed: &inner_failed,
                };
                match filter.intercept(context, next).await {
                    Err(e) if !inner_failed.load(Ordering::SeqCst) => Err(own_error(filter.name(), e)),
                    other => other,
                }
            }
        };
        if result.is_err() {
            self.failed.store(true, Ordering::SeqCst);
        }
        result
    }
}

/// An error raised by the filter itself, as opposed to one from downstream.
fn own_error(filter: &str, error: Error) -> Error {
    match error {
        Error::Filter { .. } | Error::Cancelled => error,
        other => {
            warn!(filter, error = %other, "Filter failed");
            Error::Filter {
                filter: filter.to_string(),
                reason: other.to_string(),
            }
        }
    }
}

/// An ordered list of filters around one kind of stage.
pub struct FilterChain<C> {
    filters: Vec<Arc<dyn Filter<C>>>,
}

impl<C> Default for FilterChain<C> {
    fn default() -> Self {
        Self { filters: Vec::new() }
    }
}

impl<C> Clone for FilterChain<C> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
        }
    }
}

impl<C: Send> FilterChain<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Arc<dyn Filter<C>>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Run `terminal` wrapped in every filter.
    pub async fn run(&self, context: &mut C, terminal: &dyn Terminal<C>) -> Result<()> {
        let failed = AtomicBool::new(false);
        Next {
            filters: &self.filters,
            terminal,
            failed: &failed,
        }
        .run(context)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Trace {
        context: Vec<String>,
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Filter<Trace> for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn intercept(&self, context: &mut Trace, next: Next<'_, Trace>) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:pre", self.name));
            context.context.push(self.name.to_string());
            next.run(context).await?;
            self.log.lock().unwrap().push(format!("{}:post", self.name));
            Ok(())
        }
    }

    struct Stage {
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Terminal<Trace> for Stage {
        async fn run(&self, _context: &mut Trace) -> Result<()> {
            self.log.lock().unwrap().push("terminal".into());
            if self.fail {
                return Err(Error::Internal("stage broke".into()));
            }
            Ok(())
        }
    }

    struct Refuse;

    #[async_trait]
    impl Filter<Trace> for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        async fn intercept(&self, _context: &mut Trace, _next: Next<'_, Trace>) -> Result<()> {
            Err(Error::Internal("not allowed".into()))
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Filter<Trace> for ShortCircuit {
        fn name(&self) -> &str {
            "short"
        }

        async fn intercept(&self, context: &mut Trace, _next: Next<'_, Trace>) -> Result<()> {
            context.context.push("cached".into());
            Ok(())
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>) -> FilterChain<Trace> {
        let mut chain = FilterChain::new();
        for name in ["outer", "inner"] {
            chain.push(Arc::new(Recorder {
                name,
                log: Arc::clone(log),
            }));
        }
        chain
    }

    #[tokio::test]
    async fn pre_in_order_post_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stage = Stage {
            log: Arc::clone(&log),
            fail: false,
        };
        let mut trace = Trace::default();
        chain(&log).run(&mut trace, &stage).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            ["outer:pre", "inner:pre", "terminal", "inner:post", "outer:post"]
        );
        assert_eq!(trace.context, ["outer", "inner"]);
    }

    #[tokio::test]
    async fn downstream_errors_pass_through_unwrapped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stage = Stage {
            log: Arc::clone(&log),
            fail: true,
        };
        let err = chain(&log).run(&mut Trace::default(), &stage).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(*log.lock().unwrap(), ["outer:pre", "inner:pre", "terminal"]);
    }

    #[tokio::test]
    async fn own_errors_become_filter_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain(&log);
        chain.push(Arc::new(Refuse));
        let stage = Stage {
            log: Arc::clone(&log),
            fail: false,
        };
        let err = chain.run(&mut Trace::default(), &stage).await.unwrap_err();
        match err {
            Error::Filter { filter, reason } => {
                assert_eq!(filter, "refuse");
                assert!(reason.contains("not allowed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!log.lock().unwrap().contains(&"terminal".to_string()));
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = FilterChain::new();
        chain.push(Arc::new(ShortCircuit) as Arc<dyn Filter<Trace>>);
        let stage = Stage {
            log: Arc::clone(&log),
            fail: false,
        };
        let mut trace = Trace::default();
        chain.run(&mut trace, &stage).await.unwrap();
        assert_eq!(trace.context, ["cached"]);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(chain.names(), ["short"]);
    }
}
