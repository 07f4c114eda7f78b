//! Audit configuration

use crate::error::{AuditError, AuditResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// What an audit runs, and against what
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Audit name; generated from a timestamp when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub targets: Vec<String>,

    /// Plugin ids, `module:class`
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Plugin method to call; the orchestrator default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Passed to every plugin call as its configuration
    #[serde(default)]
    pub settings: Map<String, JsonValue>,
}

impl AuditConfig {
    pub fn new<T, P>(targets: T, plugins: P) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            plugins: plugins.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> AuditResult<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(AuditError::InvalidConfig("name cannot be empty".to_string()));
            }
            if name.contains('/') {
                return Err(AuditError::InvalidConfig(format!(
                    "name '{}' cannot contain '/'",
                    name
                )));
            }
        }

        if self.targets.is_empty() {
            return Err(AuditError::InvalidConfig(
                "at least one target is required".to_string(),
            ));
        }

        for plugin in &self.plugins {
            match plugin.split_once(':') {
                Some((module, class)) if !module.is_empty() && !class.is_empty() => {}
                _ => {
                    return Err(AuditError::InvalidConfig(format!(
                        "plugin id '{}' must be 'module:class'",
                        plugin
                    )))
                }
            }
        }

        if matches!(&self.method, Some(m) if m.trim().is_empty()) {
            return Err(AuditError::InvalidConfig("method cannot be empty".to_string()));
        }

        Ok(())
    }
}
