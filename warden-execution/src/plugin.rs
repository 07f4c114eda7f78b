//! Plugin trait and registry

use crate::error::{ExecutionError, ExecutionResult};
use crate::proxy::ReplyProxy;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A test or report unit that can be invoked by method name.
///
/// A fresh instance is built for every call. The proxy is attached before
/// `invoke`; every value `invoke` returns is reported as one result.
pub trait Plugin: Send {
    fn attach(&mut self, proxy: ReplyProxy);

    fn invoke(
        &mut self,
        method: &str,
        args: &[JsonValue],
        kwargs: &Map<String, JsonValue>,
    ) -> Result<Vec<JsonValue>, PluginError>;
}

/// Failure reported by a plugin method
#[derive(Debug, Clone, PartialEq)]
pub struct PluginError {
    pub message: String,
    /// Optional detail appended to the error report, such as a call chain
    pub trace: Option<String>,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(format!("Unknown method: {}", method))
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PluginError {}

impl From<String> for PluginError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for PluginError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

#[derive(Clone)]
struct RegisteredPlugin {
    description: String,
    factory: PluginFactory,
}

/// Maps plugin ids to factories.
///
/// Discovery lives outside the core: whoever builds the process fills the
/// registry before handing it to the pool.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, RegisteredPlugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the plugins shipped with Warden
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // Fresh registry, the id is valid and unused.
        let _ = registry.register(
            EchoPlugin::ID,
            "Logs its call and reports each argument back as a result",
            || Box::new(EchoPlugin::default()),
        );
        registry
    }

    pub fn register<F>(
        &mut self,
        id: impl Into<String>,
        description: impl Into<String>,
        factory: F,
    ) -> ExecutionResult<()>
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        let id = id.into();
        match id.split_once(':') {
            Some((module, class)) if !module.is_empty() && !class.is_empty() => {}
            _ => return Err(ExecutionError::InvalidPluginId(id)),
        }
        if self.plugins.contains_key(&id) {
            return Err(ExecutionError::DuplicatePlugin(id));
        }
        self.plugins.insert(
            id,
            RegisteredPlugin {
                description: description.into(),
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    pub fn instantiate(&self, id: &str) -> ExecutionResult<Box<dyn Plugin>> {
        self.plugins
            .get(id)
            .map(|plugin| (plugin.factory)())
            .ok_or_else(|| ExecutionError::PluginNotFound(id.to_string()))
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn describe(&self, id: &str) -> Option<&str> {
        self.plugins.get(id).map(|p| p.description.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.ids())
            .finish()
    }
}

/// Built-in diagnostic plugin.
///
/// Any method echoes its positional arguments back as results, plus the
/// keyword arguments as one object when there are any. The methods `fail`
/// and `panic` exercise the error paths.
#[derive(Default)]
pub struct EchoPlugin {
    proxy: Option<ReplyProxy>,
}

impl EchoPlugin {
    pub const ID: &'static str = "builtin:echo";
}

impl Plugin for EchoPlugin {
    fn attach(&mut self, proxy: ReplyProxy) {
        self.proxy = Some(proxy);
    }

    fn invoke(
        &mut self,
        method: &str,
        args: &[JsonValue],
        kwargs: &Map<String, JsonValue>,
    ) -> Result<Vec<JsonValue>, PluginError> {
        if let Some(proxy) = &self.proxy {
            proxy.log(
                format!("{} called with {} argument(s)", method, args.len()),
                warden_messaging::LogRecord::VERBOSE,
            );
        }

        match method {
            "fail" => Err(PluginError::new("echo asked to fail")),
            "panic" => panic!("echo asked to panic"),
            _ => {
                let mut results = args.to_vec();
                if !kwargs.is_empty() {
                    results.push(JsonValue::Object(kwargs.clone()));
                }
                if let Some(proxy) = &self.proxy {
                    proxy.progress(100.0);
                }
                Ok(results)
            }
        }
    }
}
