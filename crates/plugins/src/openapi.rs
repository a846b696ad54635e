//! OpenAPI-derived plugins.
//!
//! Document parsing stays outside this crate: an [`OperationCatalog`]
//! hands over already-parsed operation descriptors, and each becomes one
//! function executed through an [`OperationRunner`]. [`HttpOperationRunner`]
//! is the stock runner: it fills `{param}` path segments, then sends the
//! remaining arguments as query parameters (GET, DELETE) or as a JSON
//! object body (POST, PUT, PATCH).

use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use rustedkernel_core::error::{BoxError, Error, Result};
use rustedkernel_core::function::{KernelArguments, KernelFunction, ParameterSpec, ParameterType, Plugin};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    fn has_body(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }

    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationParameter {
    pub name: String,

    #[serde(default, rename = "type")]
    pub param_type: ParameterType,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub description: String,
}

/// One operation of an API document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub operation_id: String,
    pub method: HttpMethod,
    /// Path relative to the server URL, e.g. `/pets/{petId}`
    pub path: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub parameters: Vec<OperationParameter>,
}

impl OperationDescriptor {
    /// Function name: the operation id with anything outside `[A-Za-z0-9_]` replaced by `_`.
    pub fn function_name(&self) -> String {
        self.operation_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect()
    }

    fn path_parameters(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut rest = self.path.as_str();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else { break };
            names.push(&rest[start + 1..start + len]);
            rest = &rest[start + len + 1..];
        }
        names
    }
}

/// Source of operation descriptors (a parsed document, a fixture, ...).
#[async_trait]
pub trait OperationCatalog: Send + Sync {
    async fn operations(&self) -> Result<Vec<OperationDescriptor>>;
}

/// A fixed list of operations.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    operations: Vec<OperationDescriptor>,
}

impl StaticCatalog {
    pub fn new(operations: Vec<OperationDescriptor>) -> Self {
        Self { operations }
    }

    /// Parse a JSON array of descriptors.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }
}

#[async_trait]
impl OperationCatalog for StaticCatalog {
    async fn operations(&self) -> Result<Vec<OperationDescriptor>> {
        Ok(self.operations.clone())
    }
}

/// Executes an operation with already-coerced arguments.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    async fn run(
        &self,
        operation: &OperationDescriptor,
        arguments: KernelArguments,
    ) -> std::result::Result<serde_json::Value, BoxError>;
}

/// A fully resolved HTTP request for one operation call.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

/// Characters that would end or restructure a path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

fn query_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve `operation` against `base_url` with `arguments`.
pub fn prepare_request(
    base_url: &str,
    operation: &OperationDescriptor,
    mut arguments: KernelArguments,
) -> std::result::Result<PreparedRequest, String> {
    let mut path = operation.path.clone();
    for name in operation.path_parameters() {
        let value = arguments
            .remove(name)
            .ok_or_else(|| format!("missing path parameter '{name}'"))?;
        let segment = utf8_percent_encode(&query_value(&value), PATH_SEGMENT).to_string();
        path = path.replace(&format!("{{{name}}}"), &segment);
    }
    let url = format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'));

    let mut remaining: Vec<(String, serde_json::Value)> = arguments
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    remaining.sort_by(|a, b| a.0.cmp(&b.0));

    if operation.method.has_body() {
        let body = (!remaining.is_empty())
            .then(|| serde_json::Value::Object(remaining.into_iter().collect()));
        Ok(PreparedRequest {
            method: operation.method,
            url,
            query: Vec::new(),
            body,
        })
    } else {
        Ok(PreparedRequest {
            method: operation.method,
            url,
            query: remaining
                .into_iter()
                .map(|(k, v)| (k, query_value(&v)))
                .collect(),
            body: None,
        })
    }
}

/// Runs operations over HTTP against one server.
pub struct HttpOperationRunner {
    base_url: String,
    client: reqwest::Client,
}

impl HttpOperationRunner {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config {
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl OperationRunner for HttpOperationRunner {
    async fn run(
        &self,
        operation: &OperationDescriptor,
        arguments: KernelArguments,
    ) -> std::result::Result<serde_json::Value, BoxError> {
        let prepared = prepare_request(&self.base_url, operation, arguments)?;
        debug!(operation = %operation.operation_id, url = %prepared.url, "Running API operation");

        let mut request = self
            .client
            .request(prepared.method.as_reqwest(), &prepared.url)
            .query(&prepared.query);
        if let Some(body) = &prepared.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        if !(200..300).contains(&status) {
            warn!(operation = %operation.operation_id, status, "API operation failed");
            return Err(format!("HTTP {status}: {text}").into());
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }
}

fn to_function(operation: OperationDescriptor, runner: Arc<dyn OperationRunner>) -> KernelFunction {
    let parameters = operation
        .parameters
        .iter()
        .map(|p| {
            if p.required {
                ParameterSpec::required(&p.name, p.param_type, &p.description)
            } else {
                ParameterSpec::optional(&p.name, p.param_type, &p.description)
            }
        })
        .collect();
    let name = operation.function_name();
    let description = operation.description.clone();
    let operation = Arc::new(operation);

    KernelFunction::from_fn(name, description, parameters, move |args| {
        let runner = Arc::clone(&runner);
        let operation = Arc::clone(&operation);
        async move { runner.run(&operation, args).await }
    })
}

/// Build a plugin from every operation in `catalog`.
pub async fn load(name: &str, catalog: &dyn OperationCatalog, runner: Arc<dyn OperationRunner>) -> Result<Plugin> {
    let operations = catalog.operations().await?;
    let mut plugin = Plugin::new(name);
    for operation in operations {
        plugin.add_function(to_function(operation, Arc::clone(&runner)))?;
    }
    Ok(plugin)
}
