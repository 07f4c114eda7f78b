//! Outward-only event push over HTTP

use crate::error::{BridgeError, BridgeResult};
use crate::events::event_packet;
use crate::packet::Packet;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use warden_messaging::{Message, Receiver};

/// POSTs events as JSON to `<push_url><command>`.
///
/// Sends are fire-and-forget on background tasks; failures are logged and
/// never reach the caller. Must be used within a Tokio runtime.
#[derive(Debug, Clone)]
pub struct PushSink {
    client: Client,
    base: Url,
}

impl PushSink {
    pub fn new(push_url: &str, timeout: Duration) -> BridgeResult<Self> {
        let mut base = push_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .map_err(|e| BridgeError::Http(format!("invalid push url '{}': {}", push_url, e)))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Queue a POST of `args` to `<push_url><command>`
    pub fn push(&self, command: &str, args: Vec<JsonValue>) {
        let url = match self.base.join(command.trim_start_matches('/')) {
            Ok(url) => url,
            Err(e) => {
                warn!(command, error = %e, "Cannot build push url");
                return;
            }
        };

        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(url.clone()).json(&args).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(%url, "Pushed event");
                }
                Ok(response) => {
                    warn!(%url, status = %response.status(), "Push endpoint rejected event");
                }
                Err(e) => warn!(%url, error = %e, "Failed to push event"),
            }
        });
    }

    pub fn push_packet(&self, packet: Packet) {
        self.push(&packet.command, packet.args);
    }
}

impl Receiver for PushSink {
    fn recv_msg(&self, message: &Message) {
        if let Some(packet) = event_packet(message) {
            self.push_packet(packet);
        }
    }
}
