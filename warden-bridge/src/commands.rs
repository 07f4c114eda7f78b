//! The command set served to the bridge peer

use crate::error::RemoteError;
use crate::service::CommandHandler;
use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use warden_audit::{Audit, AuditConfig, AuditOrchestrator};

type CommandResult = Result<JsonValue, RemoteError>;

/// Serves `audit/*`, `plugin/*` and `admin/*` commands from an orchestrator
#[derive(Clone)]
pub struct AuditCommands {
    orchestrator: AuditOrchestrator,
    config: JsonValue,
    shutdown: Arc<Notify>,
}

impl AuditCommands {
    pub fn new(orchestrator: AuditOrchestrator) -> Self {
        Self {
            orchestrator,
            config: JsonValue::Null,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Configuration returned by `admin/config/details`
    pub fn with_config(mut self, config: JsonValue) -> Self {
        self.config = config;
        self
    }

    /// Notified once `admin/service/stop` is received
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    async fn create(&self, args: &[JsonValue]) -> CommandResult {
        let raw = args
            .first()
            .cloned()
            .ok_or_else(|| RemoteError::invalid_arguments("audit/create expects a configuration"))?;
        let config: AuditConfig = serde_json::from_value(raw)
            .map_err(|e| {
                RemoteError::invalid_arguments(format!("bad audit configuration: {}", e))
            })?;
        let name = self.orchestrator.new_audit(config).await?;
        Ok(json!(name))
    }

    fn list(&self) -> CommandResult {
        let mut audits = Map::new();
        for name in self.orchestrator.audit_names() {
            if let Ok(config) = self.orchestrator.with_audit(&name, |a| a.config().clone()) {
                audits.insert(name, json!(config));
            }
        }
        Ok(JsonValue::Object(audits))
    }

    fn read<F>(&self, args: &[JsonValue], f: F) -> CommandResult
    where
        F: FnOnce(&Audit) -> CommandResult,
    {
        let name = string_arg(args, 0, "audit name")?;
        self.orchestrator.with_audit(name, f)?
    }

    fn state(&self, args: &[JsonValue]) -> CommandResult {
        self.read(args, |audit| {
            let progress: Vec<JsonValue> = audit
                .progress()
                .map(|(plugin, identity, pct)| json!([plugin, identity, pct]))
                .collect();
            Ok(json!({
                "state": audit.state().as_str(),
                "stage": audit.stage().as_str(),
                "pending": audit.pending(),
                "progress": progress,
            }))
        })
    }

    fn log(&self, args: &[JsonValue]) -> CommandResult {
        self.read(args, |audit| {
            let lines: Vec<JsonValue> = audit
                .log()
                .iter()
                .map(|line| {
                    json!([
                        line.plugin_id,
                        line.identity,
                        line.text,
                        line.level,
                        line.is_error,
                        line.timestamp.to_rfc3339(),
                    ])
                })
                .collect();
            Ok(JsonValue::Array(lines))
        })
    }

    fn results(&self, args: &[JsonValue]) -> CommandResult {
        self.read(args, |audit| {
            Ok(json!(audit
                .results()
                .iter()
                .map(|r| r.id.to_string())
                .collect::<Vec<_>>()))
        })
    }

    fn details(&self, args: &[JsonValue]) -> CommandResult {
        let ids: Vec<String> = match args.get(1) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|_| {
                    RemoteError::invalid_arguments("result ids must be a list of strings")
                })?,
            None => return Err(RemoteError::invalid_arguments("audit/details expects result ids")),
        };

        self.read(args, |audit| {
            let mut details = Map::new();
            for id in ids {
                let found = audit
                    .results()
                    .iter()
                    .find(|r| r.id.to_string() == id)
                    .ok_or_else(|| RemoteError::not_found(format!("Result not found: {}", id)))?;
                details.insert(
                    id,
                    json!({ "plugin_id": found.plugin_id, "payload": found.payload }),
                );
            }
            Ok(JsonValue::Object(details))
        })
    }

    fn summary(&self, args: &[JsonValue]) -> CommandResult {
        self.read(args, |audit| {
            Ok(json!({
                "state": audit.state().as_str(),
                "results": audit.results().len(),
                "log_lines": audit.log().len(),
                "warnings": audit.warning_count(),
                "errors": audit.error_count(),
            }))
        })
    }

    fn plugin_details(&self, args: &[JsonValue]) -> CommandResult {
        let id = string_arg(args, 0, "plugin id")?;
        let registry = self.orchestrator.pool().registry();
        let description = registry
            .describe(id)
            .ok_or_else(|| RemoteError::not_found(format!("Plugin not found: {}", id)))?;
        Ok(json!({ "id": id, "description": description }))
    }
}

#[async_trait]
impl CommandHandler for AuditCommands {
    async fn handle(&self, command: &str, args: Vec<JsonValue>) -> CommandResult {
        let orchestrator = &self.orchestrator;
        match command {
            "audit/create" => self.create(&args).await,
            "audit/cancel" => done(orchestrator.cancel_audit(string_arg(&args, 0, "audit name")?)),
            "audit/stop" => done(orchestrator.stop_audit(string_arg(&args, 0, "audit name")?)),
            "audit/pause" => done(orchestrator.pause_audit(string_arg(&args, 0, "audit name")?)),
            "audit/resume" => done(orchestrator.resume_audit(string_arg(&args, 0, "audit name")?)),
            "audit/delete" => {
                orchestrator.remove_audit(string_arg(&args, 0, "audit name")?)?;
                Ok(JsonValue::Null)
            }
            "audit/list" => self.list(),
            "audit/state" => self.state(&args),
            "audit/log" => self.log(&args),
            "audit/results" => self.results(&args),
            "audit/details" => self.details(&args),
            "audit/summary" => self.summary(&args),
            "plugin/list" => Ok(json!(orchestrator.pool().registry().ids())),
            "plugin/details" => self.plugin_details(&args),
            "admin/service/stop" => {
                info!("Service stop requested over the bridge");
                self.shutdown.notify_one();
                Ok(JsonValue::Null)
            }
            "admin/config/details" => Ok(self.config.clone()),
            other => Err(RemoteError::not_implemented(other)),
        }
    }
}

fn done(result: warden_audit::AuditResult<()>) -> CommandResult {
    result.map(|()| JsonValue::Null).map_err(RemoteError::from)
}

fn string_arg<'a>(args: &'a [JsonValue], index: usize, what: &str) -> Result<&'a str, RemoteError> {
    args.get(index)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| {
            RemoteError::invalid_arguments(format!("expected {} as argument {}", what, index + 1))
        })
}
