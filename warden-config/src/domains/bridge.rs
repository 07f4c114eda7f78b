//! RPC bridge configuration

use crate::error::ConfigResult;
use crate::validation::{
    validate_http_url, validate_positive, validate_required_string, warn_reserved_port, Validatable,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the bridge server child and its outward push sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Whether `serve` launches the bridge server at all
    #[serde(default = "crate::domains::utils::default_false")]
    pub enabled: bool,

    /// Address the RPC endpoint binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Port the RPC endpoint binds to (0 picks a free port)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// HTTP path of the RPC endpoint
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,

    /// Base URL events are pushed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_url: Option<String>,

    /// Timeout for a single push request
    #[serde(
        with = "crate::domains::utils::serde_duration",
        default = "default_push_timeout"
    )]
    pub push_timeout: Duration,

    /// How long the parent waits for the server's status packet
    #[serde(
        with = "crate::domains::utils::serde_duration",
        default = "default_bootstrap_timeout"
    )]
    pub bootstrap_timeout: Duration,

    /// Bridge server executable (defaults to the current executable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_program: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            rpc_path: default_rpc_path(),
            push_url: None,
            push_timeout: default_push_timeout(),
            bootstrap_timeout: default_bootstrap_timeout(),
            server_program: None,
        }
    }
}

impl BridgeConfig {
    /// `host:port` the RPC endpoint binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }
}

impl Validatable for BridgeConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.listen_address, "listen_address", self.domain_name())?;
        warn_reserved_port(self.listen_port, "listen_port");

        if !self.rpc_path.starts_with('/') {
            return Err(self.validation_error(format!(
                "rpc_path must start with '/', got '{}'",
                self.rpc_path
            )));
        }

        if let Some(push_url) = &self.push_url {
            validate_http_url(push_url, "push_url", self.domain_name())?;
        }

        validate_positive(self.push_timeout.as_secs_f64(), "push_timeout", self.domain_name())?;
        validate_positive(
            self.bootstrap_timeout.as_secs_f64(),
            "bootstrap_timeout",
            self.domain_name(),
        )?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "bridge"
    }
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    9000
}

fn default_rpc_path() -> String {
    "/RPC2".to_string()
}

fn default_push_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_bootstrap_timeout() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_defaults() {
        let config = BridgeConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
        assert_eq!(config.rpc_path, "/RPC2");
        assert_eq!(config.bootstrap_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rpc_path_must_be_absolute() {
        let config = BridgeConfig {
            rpc_path: "RPC2".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_push_url_validation() {
        let mut config = BridgeConfig {
            push_url: Some("http://localhost:8080/events".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.push_url = Some("file:///tmp/events".to_string());
        assert!(config.validate().is_err());
    }
}
