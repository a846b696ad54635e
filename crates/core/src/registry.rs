//! Function registry: the source-agnostic catalogue of invocable functions.
//!
//! The kernel uses the registry to:
//! 1. Offer function descriptors to the model (`list_for_model`)
//! 2. Resolve and execute functions requested inline or by the model

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::ToolDefinition;
use crate::error::{Error, FunctionError, Result};
use crate::function::{
    FunctionBody, FunctionResult, KernelArguments, KernelFunction, Plugin, split_function_name,
    validate_name,
};

/// Anything that can execute a function by name.
///
/// Implemented by [`FunctionRegistry`] (native functions only) and by the
/// kernel (native and prompt functions, wrapped in invocation filters).
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke_function(
        &self,
        name: &str,
        arguments: KernelArguments,
        cancel: &CancellationToken,
    ) -> Result<FunctionResult>;
}

/// Mapping from qualified name (`Plugin.Function`) to function.
///
/// Names are unique across all plugins. Descriptors are listed in
/// registration order so backend prompts are reproducible.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, KernelFunction>,
    order: Vec<String>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every function of a plugin.
    ///
    /// Fails without modifying the registry if any qualified name is taken.
    pub fn register(&mut self, plugin: Plugin) -> std::result::Result<(), FunctionError> {
        validate_name(plugin.name())?;
        for function in plugin.functions() {
            let qualified = function.qualified_name();
            if self.functions.contains_key(&qualified) {
                return Err(FunctionError::DuplicateName(qualified));
            }
        }

        let plugin_name = plugin.name().to_string();
        let count = plugin.len();
        for function in plugin.into_functions() {
            let qualified = function.qualified_name();
            self.order.push(qualified.clone());
            self.functions.insert(qualified, function);
        }
        debug!(plugin = %plugin_name, functions = count, "Registered plugin");
        Ok(())
    }

    /// Look up a function by `Plugin.Function` or `Plugin-Function`.
    pub fn resolve(&self, name: &str) -> std::result::Result<&KernelFunction, FunctionError> {
        let key = match split_function_name(name) {
            Some((plugin, function)) => format!("{plugin}.{function}"),
            None => name.to_string(),
        };
        self.functions
            .get(&key)
            .ok_or_else(|| FunctionError::UnknownFunction(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Function descriptors offered to the model, in registration order.
    pub fn list_for_model(&self) -> Vec<ToolDefinition> {
        self.iter()
            .map(|f| ToolDefinition {
                name: f.metadata().model_name(),
                description: f.metadata().description.clone(),
                parameters: f.metadata().parameters_schema(),
            })
            .collect()
    }

    /// All functions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &KernelFunction> {
        self.order.iter().filter_map(|name| self.functions.get(name))
    }

    /// Qualified names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Execute a native function after coercing its arguments.
    ///
    /// Prompt functions need a completion backend and must be invoked
    /// through the kernel instead.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: KernelArguments,
        cancel: &CancellationToken,
    ) -> Result<FunctionResult> {
        let function = self.resolve(name)?;
        let qualified = function.qualified_name();
        let arguments = function.coerce_arguments(arguments)?;

        let FunctionBody::Native(body) = function.body() else {
            return Err(FunctionError::execution(
                qualified,
                "prompt functions must be invoked through a kernel",
            )
            .into());
        };

        let value = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = body.invoke(arguments, cancel) => {
                result.map_err(|e| FunctionError::execution(qualified.clone(), e))?
            }
        };
        Ok(FunctionResult::new(qualified, value))
    }
}

#[async_trait]
impl FunctionInvoker for FunctionRegistry {
    async fn invoke_function(
        &self,
        name: &str,
        arguments: KernelArguments,
        cancel: &CancellationToken,
    ) -> Result<FunctionResult> {
        self.invoke(name, arguments, cancel).await
    }
}
