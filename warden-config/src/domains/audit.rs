//! Audit defaults

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};
use serde::{Deserialize, Serialize};

/// Defaults applied to every audit the orchestrator creates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditDefaults {
    /// Prefix used when an audit name is generated from a timestamp
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Plugin method invoked for each target when the audit names none
    #[serde(default = "default_method")]
    pub default_method: String,
}

impl Default for AuditDefaults {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            default_method: default_method(),
        }
    }
}

impl Validatable for AuditDefaults {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.name_prefix, "name_prefix", self.domain_name())?;
        validate_required_string(&self.default_method, "default_method", self.domain_name())?;

        if self.name_prefix.contains('/') {
            return Err(self.validation_error("name_prefix cannot contain '/'"));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "audit"
    }
}

fn default_name_prefix() -> String {
    "warden".to_string()
}

fn default_method() -> String {
    "run".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_defaults() {
        let config = AuditDefaults::default();
        assert_eq!(config.name_prefix, "warden");
        assert_eq!(config.default_method, "run");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_prefix_with_slash_is_rejected() {
        let config = AuditDefaults {
            name_prefix: "a/b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
