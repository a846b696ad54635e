//! Kernel functions and plugins.
//!
//! A [`KernelFunction`] pairs an explicit schema ([`FunctionMetadata`]) with
//! a body: either native code or a prompt template. Functions are grouped
//! into named [`Plugin`]s, which are registered in the
//! [`FunctionRegistry`](crate::registry::FunctionRegistry).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, FunctionError};
use crate::settings::ExecutionSettings;

/// Named argument values passed to a function or a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelArguments(HashMap<String, serde_json::Value>);

impl KernelArguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    /// Get an argument as a string slice, if it is a JSON string.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<serde_json::Value> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// Build arguments from a JSON object; any other JSON value is rejected.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) => Some(map.into_iter().collect()),
            serde_json::Value::Null => Some(Self::new()),
            _ => None,
        }
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for KernelArguments {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Declared type of a function parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    /// JSON Schema type keyword.
    pub fn as_schema_type(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// One entry of a function's parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,

    #[serde(default, rename = "type")]
    pub param_type: ParameterType,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub description: String,

    /// Value used when the argument is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ParameterSpec {
    /// A required parameter.
    pub fn required(name: impl Into<String>, param_type: ParameterType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            description: description.into(),
            default: None,
        }
    }

    /// An optional parameter.
    pub fn optional(name: impl Into<String>, param_type: ParameterType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.default = Some(value.into());
        self.required = false;
        self
    }
}

/// The explicit descriptor of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    /// Owning plugin; set when the function is added to a plugin
    #[serde(default)]
    pub plugin_name: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Ordered parameter schema
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl FunctionMetadata {
    /// `Plugin.Function`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.plugin_name, self.name)
    }

    /// `Plugin-Function`, the form offered to models that reject dots.
    pub fn model_name(&self) -> String {
        format!("{}-{}", self.plugin_name, self.name)
    }

    /// JSON Schema object describing the parameters.
    pub fn parameters_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = serde_json::json!({
                "type": param.param_type.as_schema_type(),
            });
            if !param.description.is_empty() {
                prop["description"] = param.description.clone().into();
            }
            if let Some(default) = &param.default {
                prop["default"] = default.clone();
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(serde_json::Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Native code behind a function.
#[async_trait]
pub trait NativeFunction: Send + Sync {
    /// Run with arguments already coerced against the declared schema.
    /// Long-running bodies should watch `cancel`.
    async fn invoke(
        &self,
        arguments: KernelArguments,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, BoxError>;
}

/// Adapter turning an async closure into a [`NativeFunction`].
pub struct FnFunction<F>(F);

#[async_trait]
impl<F, Fut> NativeFunction for FnFunction<F>
where
    F: Fn(KernelArguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send,
{
    async fn invoke(
        &self,
        arguments: KernelArguments,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, BoxError> {
        (self.0)(arguments).await
    }
}

/// Adapter for closures that also take the invocation's cancellation token.
pub struct CancellableFnFunction<F>(F);

#[async_trait]
impl<F, Fut> NativeFunction for CancellableFnFunction<F>
where
    F: Fn(KernelArguments, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send,
{
    async fn invoke(
        &self,
        arguments: KernelArguments,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, BoxError> {
        (self.0)(arguments, cancel.clone()).await
    }
}

/// A template input variable with an optional default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputVariable {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl InputVariable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            default: None,
            required: true,
        }
    }

    pub fn with_default(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.default = Some(value.into());
        self.required = false;
        self
    }
}

/// A function whose body is a prompt template rendered and sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptFunction {
    pub template: String,

    #[serde(default)]
    pub input_variables: Vec<InputVariable>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_settings: Option<ExecutionSettings>,
}

impl PromptFunction {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            input_variables: Vec::new(),
            execution_settings: None,
        }
    }

    pub fn with_input_variable(mut self, variable: InputVariable) -> Self {
        self.input_variables.push(variable);
        self
    }

    pub fn with_execution_settings(mut self, settings: ExecutionSettings) -> Self {
        self.execution_settings = Some(settings);
        self
    }
}

#[derive(Clone)]
pub enum FunctionBody {
    Native(Arc<dyn NativeFunction>),
    Prompt(Arc<PromptFunction>),
}

/// An invocable function: schema plus body. Immutable once registered.
#[derive(Clone)]
pub struct KernelFunction {
    metadata: FunctionMetadata,
    body: FunctionBody,
}

impl std::fmt::Debug for KernelFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.body {
            FunctionBody::Native(_) => "native",
            FunctionBody::Prompt(_) => "prompt",
        };
        f.debug_struct("KernelFunction")
            .field("metadata", &self.metadata)
            .field("kind", &kind)
            .finish()
    }
}

impl KernelFunction {
    /// A function backed by a [`NativeFunction`] implementation.
    pub fn native(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ParameterSpec>,
        body: Arc<dyn NativeFunction>,
    ) -> Self {
        Self {
            metadata: FunctionMetadata {
                plugin_name: String::new(),
                name: name.into(),
                description: description.into(),
                parameters,
            },
            body: FunctionBody::Native(body),
        }
    }

    /// A function backed by an async closure.
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ParameterSpec>,
        f: F,
    ) -> Self
    where
        F: Fn(KernelArguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
    {
        Self::native(name, description, parameters, Arc::new(FnFunction(f)))
    }

    /// Like [`from_fn`](Self::from_fn), for closures that forward the
    /// invocation's cancellation token to their own async work.
    pub fn from_cancellable_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ParameterSpec>,
        f: F,
    ) -> Self
    where
        F: Fn(KernelArguments, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
    {
        Self::native(name, description, parameters, Arc::new(CancellableFnFunction(f)))
    }

    /// A prompt-template function. Its parameters mirror the input variables.
    pub fn prompt(name: impl Into<String>, description: impl Into<String>, prompt: PromptFunction) -> Self {
        let parameters = prompt
            .input_variables
            .iter()
            .map(|v| ParameterSpec {
                name: v.name.clone(),
                param_type: ParameterType::String,
                required: v.required && v.default.is_none(),
                description: v.description.clone(),
                default: v.default.clone(),
            })
            .collect();
        Self {
            metadata: FunctionMetadata {
                plugin_name: String::new(),
                name: name.into(),
                description: description.into(),
                parameters,
            },
            body: FunctionBody::Prompt(Arc::new(prompt)),
        }
    }

    pub fn metadata(&self) -> &FunctionMetadata {
        &self.metadata
    }

    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn qualified_name(&self) -> String {
        self.metadata.qualified_name()
    }

    /// Coerce `arguments` against the declared schema.
    pub fn coerce_arguments(&self, arguments: KernelArguments) -> Result<KernelArguments, FunctionError> {
        coerce_arguments(&self.metadata, arguments)
    }
}

/// A named, ordered group of functions with unique names.
#[derive(Debug, Clone)]
pub struct Plugin {
    name: String,
    description: String,
    functions: Vec<KernelFunction>,
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            functions: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Build a plugin from a list of functions.
    pub fn from_functions(
        name: impl Into<String>,
        description: impl Into<String>,
        functions: impl IntoIterator<Item = KernelFunction>,
    ) -> Result<Self, FunctionError> {
        let mut plugin = Self::new(name).with_description(description);
        for function in functions {
            plugin.add_function(function)?;
        }
        Ok(plugin)
    }

    /// Add a function, binding it to this plugin's name.
    pub fn add_function(&mut self, mut function: KernelFunction) -> Result<&mut Self, FunctionError> {
        validate_name(&self.name)?;
        validate_name(&function.metadata.name)?;
        function.metadata.plugin_name = self.name.clone();
        if self.get(&function.metadata.name).is_some() {
            return Err(FunctionError::DuplicateName(function.qualified_name()));
        }
        self.functions.push(function);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn functions(&self) -> &[KernelFunction] {
        &self.functions
    }

    pub fn get(&self, name: &str) -> Option<&KernelFunction> {
        self.functions.iter().find(|f| f.metadata.name == name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub(crate) fn into_functions(self) -> Vec<KernelFunction> {
        self.functions
    }
}

/// The result of invoking a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResult {
    /// Qualified name of the function that produced this value
    pub function: String,

    pub value: serde_json::Value,
}

impl FunctionResult {
    pub fn new(function: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            function: function.into(),
            value: value.into(),
        }
    }

    /// The value as template/prompt text.
    pub fn as_text(&self) -> String {
        value_to_text(&self.value)
    }
}

impl std::fmt::Display for FunctionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// Stringify a JSON value for substitution into text.
///
/// Strings are inserted raw, `null` becomes empty, everything else is JSON.
pub fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Plugin and function names: non-empty ASCII alphanumerics and `_`.
pub fn validate_name(name: &str) -> Result<(), FunctionError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(FunctionError::InvalidName(name.to_string()))
    }
}

/// Split `Plugin.Function` or `Plugin-Function` into its parts.
pub fn split_function_name(name: &str) -> Option<(&str, &str)> {
    let idx = name.find(['.', '-'])?;
    let (plugin, rest) = name.split_at(idx);
    let function = &rest[1..];
    if plugin.is_empty() || function.is_empty() {
        return None;
    }
    Some((plugin, function))
}

/// Coerce arguments against a function's parameter schema.
///
/// Missing optional parameters receive their declared default. Arguments
/// not named in the schema pass through unchanged.
pub fn coerce_arguments(
    metadata: &FunctionMetadata,
    mut arguments: KernelArguments,
) -> Result<KernelArguments, FunctionError> {
    for param in &metadata.parameters {
        let supplied = arguments.remove(&param.name).filter(|v| !v.is_null());
        match supplied {
            Some(value) => {
                let coerced = coerce_value(param.param_type, value).map_err(|reason| {
                    FunctionError::Argument {
                        function: metadata.qualified_name(),
                        parameter: param.name.clone(),
                        reason,
                    }
                })?;
                arguments.insert(param.name.clone(), coerced);
            }
            None => match &param.default {
                Some(default) => arguments.insert(param.name.clone(), default.clone()),
                None if param.required => {
                    return Err(FunctionError::Argument {
                        function: metadata.qualified_name(),
                        parameter: param.name.clone(),
                        reason: "missing required argument".into(),
                    });
                }
                None => {}
            },
        }
    }
    Ok(arguments)
}

fn coerce_value(ty: ParameterType, value: serde_json::Value) -> Result<serde_json::Value, String> {
    use serde_json::Value;

    match (ty, value) {
        (ParameterType::String, Value::String(s)) => Ok(Value::String(s)),
        (ParameterType::String, other) => Ok(Value::String(other.to_string())),

        (ParameterType::Integer, Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                Ok(Value::Number(n))
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Ok(Value::from(f as i64))
                    }
                    _ => Err(format!("expected an integer, got {n}")),
                }
            }
        }
        (ParameterType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("expected an integer, got '{s}'")),

        (ParameterType::Number, Value::Number(n)) => Ok(Value::Number(n)),
        (ParameterType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("expected a number, got '{s}'")),

        (ParameterType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (ParameterType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("expected a boolean, got '{s}'")),
        },

        (ParameterType::Array, Value::Array(a)) => Ok(Value::Array(a)),
        (ParameterType::Object, Value::Object(o)) => Ok(Value::Object(o)),
        (ParameterType::Array | ParameterType::Object, Value::String(s)) => {
            let parsed: Value = serde_json::from_str(&s)
                .map_err(|e| format!("expected JSON {}, got '{s}': {e}", ty.as_schema_type()))?;
            match (&parsed, ty) {
                (Value::Array(_), ParameterType::Array) | (Value::Object(_), ParameterType::Object) => {
                    Ok(parsed)
                }
                _ => Err(format!("expected JSON {}, got '{s}'", ty.as_schema_type())),
            }
        }

        (ty, other) => Err(format!(
            "expected {}, got {}",
            ty.as_schema_type(),
            json_kind(&other)
        )),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
