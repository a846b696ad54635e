//! Plugin sources: adapters that produce a [`Plugin`].
//!
//! The registry never knows where a plugin came from. Each source kind
//! turns its input into the same value:
//!
//! | Kind              | Input                                         |
//! |-------------------|-----------------------------------------------|
//! | `NativeType`      | a [`NativePlugin`] type, instantiated fresh   |
//! | `Object`          | an existing [`NativePlugin`] instance         |
//! | `PromptDirectory` | a directory of prompt template files          |
//! | `OpenApi`         | operation descriptors plus a runner           |

use rustedkernel_core::error::Result;
use rustedkernel_core::function::{KernelFunction, Plugin};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::openapi::{self, OperationCatalog, OperationRunner};
use crate::prompt_dir;

/// A type that declares its functions explicitly.
///
/// Functions receive `self` as an `Arc` so their bodies can hold on to the
/// instance state they are bound to.
pub trait NativePlugin: Send + Sync + 'static {
    fn description(&self) -> &str {
        ""
    }

    fn functions(self: Arc<Self>) -> Vec<KernelFunction>;
}

type Factory = Box<dyn Fn() -> Arc<dyn NativePlugin> + Send + Sync>;

pub enum PluginSource {
    NativeType { name: String, factory: Factory },
    Object { name: String, instance: Arc<dyn NativePlugin> },
    PromptDirectory { name: String, path: PathBuf },
    OpenApi {
        name: String,
        catalog: Arc<dyn OperationCatalog>,
        runner: Arc<dyn OperationRunner>,
    },
}

impl fmt::Debug for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, name) = match self {
            Self::NativeType { name, .. } => ("native_type", name),
            Self::Object { name, .. } => ("object", name),
            Self::PromptDirectory { name, .. } => ("prompt_directory", name),
            Self::OpenApi { name, .. } => ("open_api", name),
        };
        f.debug_struct("PluginSource")
            .field("kind", &kind)
            .field("name", name)
            .finish()
    }
}

impl PluginSource {
    /// A fresh `T::default()` is created on every load.
    pub fn native_type<T: NativePlugin + Default>(name: impl Into<String>) -> Self {
        Self::NativeType {
            name: name.into(),
            factory: Box::new(|| Arc::new(T::default()) as Arc<dyn NativePlugin>),
        }
    }

    pub fn object(name: impl Into<String>, instance: Arc<dyn NativePlugin>) -> Self {
        Self::Object {
            name: name.into(),
            instance,
        }
    }

    pub fn prompt_directory(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::PromptDirectory {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn open_api(
        name: impl Into<String>,
        catalog: Arc<dyn OperationCatalog>,
        runner: Arc<dyn OperationRunner>,
    ) -> Self {
        Self::OpenApi {
            name: name.into(),
            catalog,
            runner,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::NativeType { name, .. }
            | Self::Object { name, .. }
            | Self::PromptDirectory { name, .. }
            | Self::OpenApi { name, .. } => name,
        }
    }

    /// Produce the plugin.
    pub async fn load(&self) -> Result<Plugin> {
        let plugin = match self {
            Self::NativeType { name, factory } => from_native(name, factory()),
            Self::Object { name, instance } => from_native(name, Arc::clone(instance)),
            Self::PromptDirectory { name, path } => prompt_dir::load(name, path).await,
            Self::OpenApi { name, catalog, runner } => {
                openapi::load(name, catalog.as_ref(), Arc::clone(runner)).await
            }
        }?;
        debug!(plugin = %plugin.name(), functions = plugin.len(), source = ?self, "Plugin loaded");
        Ok(plugin)
    }
}

fn from_native(name: &str, instance: Arc<dyn NativePlugin>) -> Result<Plugin> {
    let description = instance.description().to_string();
    let functions = instance.functions();
    Ok(Plugin::from_functions(name, description, functions)?)
}
