//! Running one plugin call to completion

use crate::plugin::{PluginError, PluginRegistry};
use crate::proxy::ReplyProxy;
use serde_json::{Map, Value as JsonValue};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};
use warden_ipc::ExecutionContext;
use warden_messaging::Message;
use warden_tasks::panic_message;

/// Instantiate the plugin named by `context`, attach `proxy` and run `method`.
///
/// Each returned value is sent as a result. Any failure, including a panic
/// inside the plugin, is reported as an error message carrying the trace.
/// The call is bracketed by plugin begin and end notifications, and exactly
/// one Ack is emitted, always last. Returns whether the call succeeded.
pub fn invoke_plugin(
    registry: &PluginRegistry,
    context: &ExecutionContext,
    method: &str,
    args: &[JsonValue],
    kwargs: &Map<String, JsonValue>,
    proxy: ReplyProxy,
) -> bool {
    let plugin_id = context.plugin_id();
    debug!(plugin_id = %plugin_id, method, audit = %context.audit_id, "Invoking plugin");
    proxy.emit(Message::plugin_begin(&plugin_id, proxy.identity()));

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut plugin = registry
            .instantiate(&plugin_id)
            .map_err(|e| PluginError::new(e.to_string()))?;
        plugin.attach(proxy.clone());
        plugin.invoke(method, args, kwargs)
    }));

    let success = match outcome {
        Ok(Ok(results)) => {
            for value in results {
                proxy.send_info(value);
            }
            true
        }
        Ok(Err(error)) => {
            warn!(plugin_id = %plugin_id, method, error = %error, "Plugin call failed");
            proxy.error(format_failure(&plugin_id, method, &error));
            false
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(plugin_id = %plugin_id, method, panic = %message, "Plugin panicked");
            let error = PluginError::new(format!("panicked: {}", message));
            proxy.error(format_failure(&plugin_id, method, &error));
            false
        }
    };

    proxy.emit(Message::plugin_end(&plugin_id, proxy.identity()));
    proxy.emit(Message::ack());
    success
}

/// Render a failure the way it appears in the audit log
pub(crate) fn format_failure(plugin_id: &str, method: &str, error: &PluginError) -> String {
    let mut text = format!("Error executing {}.{}: {}", plugin_id, method, error.message);
    if let Some(trace) = &error.trace {
        text.push('\n');
        text.push_str(trace);
    }
    text
}
