//! Registry of audits and the router between them, the pool and receivers

use crate::audit::{Audit, AuditState};
use crate::config::AuditConfig;
use crate::error::{AuditError, AuditResult};
use chrono::Utc;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use warden_config::AuditDefaults;
use warden_execution::ProcessPool;
use warden_ipc::ExecutionContext;
use warden_messaging::{AuditStage, Dispatcher, LogRecord, Message};

#[derive(Debug, Default)]
struct Registry {
    audits: HashMap<String, Audit>,
    order: Vec<String>,
}

impl Registry {
    fn get_mut(&mut self, name: &str) -> AuditResult<&mut Audit> {
        self.audits
            .get_mut(name)
            .ok_or_else(|| AuditError::NotFound(name.to_string()))
    }

    fn generate_name(&self, prefix: &str) -> String {
        let base = format!("{}-{}", prefix, Utc::now().format("%Y-%m-%d-%H_%M"));
        if !self.audits.contains_key(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !self.audits.contains_key(candidate))
            .unwrap_or(base)
    }
}

struct Inner {
    registry: Mutex<Registry>,
    dispatcher: Arc<Dispatcher>,
    pool: ProcessPool,
    defaults: AuditDefaults,
}

/// Owns every audit.
///
/// Registry access is serialized behind one lock. Messages for external
/// receivers are delivered through the dispatcher only after the lock has
/// been released, so a receiver may call back into the orchestrator.
#[derive(Clone)]
pub struct AuditOrchestrator {
    inner: Arc<Inner>,
}

impl AuditOrchestrator {
    pub fn new(dispatcher: Arc<Dispatcher>, pool: ProcessPool, defaults: AuditDefaults) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                dispatcher,
                pool,
                defaults,
            }),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.inner.pool
    }

    pub fn defaults(&self) -> &AuditDefaults {
        &self.inner.defaults
    }

    /// Validate and register an audit without starting it.
    ///
    /// Returns the audit name, generated from the current time when the
    /// configuration has none.
    pub fn add_audit(&self, mut config: AuditConfig) -> AuditResult<String> {
        config.validate()?;

        let mut registry = self.inner.lock();
        let name = match &config.name {
            Some(name) if registry.audits.contains_key(name) => {
                return Err(AuditError::AlreadyExists(name.clone()))
            }
            Some(name) => name.clone(),
            None => registry.generate_name(&self.inner.defaults.name_prefix),
        };
        config.name = Some(name.clone());

        registry.audits.insert(name.clone(), Audit::new(name.clone(), config));
        registry.order.push(name.clone());
        info!(audit = %name, "Audit created");
        Ok(name)
    }

    /// Register an audit and start it
    pub async fn new_audit(&self, config: AuditConfig) -> AuditResult<String> {
        let name = self.add_audit(config)?;
        self.start_audit(&name).await?;
        Ok(name)
    }

    /// Start a new audit: one plugin call per (plugin, target) pair.
    ///
    /// Calls are submitted on a background task; their messages are routed
    /// back to the audit as they arrive.
    pub async fn start_audit(&self, name: &str) -> AuditResult<()> {
        let (config, stages) = {
            let mut registry = self.inner.lock();
            let audit = registry.get_mut(name)?;
            let calls = audit.config().plugins.len() * audit.config().targets.len();
            let mut stages = vec![audit.start(calls)?];
            stages.extend(audit.finish_if_idle());
            (audit.config().clone(), stages)
        };
        self.inner.emit_stages(name, stages);

        if !config.plugins.is_empty() {
            let inner = Arc::clone(&self.inner);
            let name = name.to_string();
            tokio::spawn(async move { inner.launch(name, config).await });
        }
        Ok(())
    }

    pub fn pause_audit(&self, name: &str) -> AuditResult<()> {
        self.inner.transition(name, |audit| Ok(vec![audit.pause()?]))
    }

    /// Resume a paused audit; it finishes at once if nothing is pending
    pub fn resume_audit(&self, name: &str) -> AuditResult<()> {
        self.inner.transition(name, |audit| {
            let mut stages = vec![audit.resume()?];
            stages.extend(audit.finish_if_idle());
            Ok(stages)
        })
    }

    /// Stop an audit. Calls already running complete; no new ones start.
    pub fn stop_audit(&self, name: &str) -> AuditResult<()> {
        self.inner.transition(name, |audit| Ok(vec![audit.stop()?]))
    }

    pub fn cancel_audit(&self, name: &str) -> AuditResult<()> {
        self.inner.transition(name, |audit| Ok(vec![audit.cancel()?]))
    }

    /// Delete an audit that is new or has ended
    pub fn remove_audit(&self, name: &str) -> AuditResult<Audit> {
        let mut registry = self.inner.lock();
        let audit = registry.get_mut(name)?;
        if !audit.is_removable() {
            return Err(AuditError::InvalidState {
                name: name.to_string(),
                state: audit.state(),
                operation: "delete",
            });
        }

        registry.order.retain(|n| n != name);
        let audit = registry
            .audits
            .remove(name)
            .ok_or_else(|| AuditError::NotFound(name.to_string()))?;
        info!(audit = %name, "Audit removed");
        Ok(audit)
    }

    /// Stop every audit that has not ended yet
    pub fn stop_all(&self) {
        for name in self.audit_names() {
            match self.stop_audit(&name) {
                Ok(()) | Err(AuditError::InvalidState { .. }) | Err(AuditError::NotFound(_)) => {}
                Err(e) => warn!(audit = %name, error = %e, "Failed to stop audit"),
            }
        }
    }

    /// Names in creation order
    pub fn audit_names(&self) -> Vec<String> {
        self.inner.lock().order.clone()
    }

    pub fn has_audits(&self) -> bool {
        !self.inner.lock().audits.is_empty()
    }

    pub fn has_audit(&self, name: &str) -> bool {
        self.inner.lock().audits.contains_key(name)
    }

    /// Read access to one audit.
    ///
    /// `f` runs under the registry lock and must not call back into the
    /// orchestrator.
    pub fn with_audit<R>(&self, name: &str, f: impl FnOnce(&Audit) -> R) -> AuditResult<R> {
        let registry = self.inner.lock();
        let audit = registry
            .audits
            .get(name)
            .ok_or_else(|| AuditError::NotFound(name.to_string()))?;
        Ok(f(audit))
    }

    pub fn audit_state(&self, name: &str) -> AuditResult<AuditState> {
        self.with_audit(name, Audit::state)
    }

    /// Route a message to the audit named by its audit id, then to the
    /// external receivers
    pub fn dispatch_msg(&self, message: Message) -> AuditResult<()> {
        let name = message
            .audit_id()
            .map(str::to_string)
            .ok_or_else(|| AuditError::NotFound("message carries no audit id".to_string()))?;
        self.inner.route(&name, None, message)
    }
}

impl std::fmt::Debug for AuditOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.lock();
        f.debug_struct("AuditOrchestrator")
            .field("audits", &registry.order)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition<F>(&self, name: &str, f: F) -> AuditResult<()>
    where
        F: FnOnce(&mut Audit) -> AuditResult<Vec<AuditStage>>,
    {
        let stages = {
            let mut registry = self.lock();
            f(registry.get_mut(name)?)?
        };
        self.emit_stages(name, stages);
        Ok(())
    }

    fn emit_stages(&self, name: &str, stages: Vec<AuditStage>) {
        for stage in stages {
            info!(audit = %name, %stage, "Audit stage");
            match Message::stage(stage).with_audit_id(name) {
                Ok(message) => self.dispatcher.send_message(&message),
                Err(e) => warn!(audit = %name, error = %e, "Failed to build stage message"),
            }
        }
    }

    fn route(&self, name: &str, plugin_id: Option<&str>, mut message: Message) -> AuditResult<()> {
        let stage = {
            let mut registry = self.lock();
            let audit = registry.get_mut(name)?;
            audit.recv_msg(plugin_id, &message)
        };

        if message.audit_id().is_none() {
            // Unset, so the assignment cannot fail.
            let _ = message.set_audit_id(name);
        }
        self.dispatcher.send_message(&message);
        self.emit_stages(name, stage.into_iter().collect());
        Ok(())
    }

    fn is_live(&self, name: &str) -> bool {
        self.lock()
            .audits
            .get(name)
            .is_some_and(|audit| !audit.state().is_terminal())
    }

    async fn launch(self: Arc<Self>, name: String, config: AuditConfig) {
        let method = config
            .method
            .clone()
            .unwrap_or_else(|| self.defaults.default_method.clone());
        let settings: BTreeMap<String, JsonValue> = config.settings.clone().into_iter().collect();

        for plugin in &config.plugins {
            for target in &config.targets {
                if !self.is_live(&name) {
                    debug!(audit = %name, "Audit ended, not submitting further calls");
                    return;
                }

                let context = match ExecutionContext::for_plugin(plugin, &name, settings.clone()) {
                    Ok(context) => context,
                    Err(e) => {
                        self.fail_call(&name, plugin, target, e.to_string());
                        continue;
                    }
                };

                let submitted = self
                    .pool
                    .submit(context, method.clone(), vec![json!(target)], Map::new())
                    .await;
                match submitted {
                    Ok(mut handle) => {
                        let inner = Arc::clone(&self);
                        let name = name.clone();
                        let plugin = plugin.clone();
                        tokio::spawn(async move {
                            while let Some(message) = handle.next().await {
                                if let Err(e) = inner.route(&name, Some(&plugin), message) {
                                    debug!(
                                        audit = %name,
                                        error = %e,
                                        "Dropping message for removed audit"
                                    );
                                    break;
                                }
                            }
                        });
                    }
                    Err(e) => self.fail_call(&name, plugin, target, e.to_string()),
                }
            }
        }
    }

    /// Close out a call that could not be started
    fn fail_call(&self, name: &str, plugin: &str, target: &str, reason: String) {
        warn!(audit = %name, plugin, target, error = %reason, "Failed to start plugin call");
        let error = Message::error(LogRecord::new(
            plugin,
            target,
            format!("Cannot run {} against {}: {}", plugin, target, reason),
            LogRecord::STANDARD,
        ));
        for message in [error, Message::ack()] {
            if self.route(name, Some(plugin), message).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_config::ProcessPoolConfig;
    use warden_execution::{LocalSpawner, PluginRegistry};

    fn orchestrator() -> AuditOrchestrator {
        let registry = Arc::new(PluginRegistry::with_builtins());
        let spawner = Arc::new(LocalSpawner::new(Arc::clone(&registry)));
        let pool = ProcessPool::new(ProcessPoolConfig::in_process(), registry, spawner);
        AuditOrchestrator::new(Arc::new(Dispatcher::new()), pool, AuditDefaults::default())
    }

    #[test]
    fn test_generated_names_get_suffixes() {
        let orchestrator = orchestrator();
        let first = orchestrator.add_audit(AuditConfig::new(["a"], ["builtin:echo"])).unwrap();
        let second = orchestrator.add_audit(AuditConfig::new(["a"], ["builtin:echo"])).unwrap();

        assert!(first.starts_with("warden-"));
        assert_ne!(first, second);
        assert_eq!(orchestrator.audit_names(), vec![first, second]);
    }

    #[test]
    fn test_duplicate_explicit_name() {
        let orchestrator = orchestrator();
        let config = AuditConfig::new(["a"], ["builtin:echo"]).with_name("nightly");
        orchestrator.add_audit(config.clone()).unwrap();

        let err = orchestrator.add_audit(config).unwrap_err();
        assert!(matches!(err, AuditError::AlreadyExists(ref n) if n == "nightly"));
        assert_eq!(orchestrator.audit_names(), vec!["nightly".to_string()]);
    }

    #[test]
    fn test_invalid_config_is_not_registered() {
        let orchestrator = orchestrator();
        let err = orchestrator
            .add_audit(AuditConfig::new(Vec::<String>::new(), ["builtin:echo"]))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
        assert!(!orchestrator.has_audits());
    }

    #[test]
    fn test_unknown_audit() {
        let orchestrator = orchestrator();
        assert!(matches!(orchestrator.pause_audit("nope"), Err(AuditError::NotFound(_))));
        assert!(matches!(orchestrator.remove_audit("nope"), Err(AuditError::NotFound(_))));
        assert!(matches!(
            orchestrator.dispatch_msg(Message::ack()),
            Err(AuditError::NotFound(_))
        ));
    }
}
