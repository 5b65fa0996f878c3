//! Leader side of the coordination channel: accepts follower connections,
//! answers `ping`/`switch_provider`, and fire-and-forget broadcasts
//! `provider_changed`/`server_stopping` to everyone currently connected
//! (spec §4.8).
//!
//! Grounded on the workspace's existing admin-metrics WebSocket handler
//! (`actix_ws::handle` + a periodic push) for the per-connection shape, and
//! on its config hot-reload watcher (`tokio::sync::broadcast` +
//! `Arc`-snapshot reads) for the fan-out broadcast itself.

use super::message::{Envelope, MessageType};
use crate::classify::CurrentProvider;
use crate::config::Provider;
use actix_ws::Message;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// At-most-once fan-out: a follower that was disconnected during a
/// broadcast never receives it on reconnect (spec §4.8 "Delivery
/// guarantees"). A bounded channel is enough; a slow/dead follower that
/// falls behind gets `Lagged` and should simply re-fetch state, which the
/// follower's reconnect path already does.
const BROADCAST_CAPACITY: usize = 256;

pub struct Leader {
    instance_id: String,
    current_provider: CurrentProvider,
    broadcast_tx: broadcast::Sender<Envelope>,
}

impl Leader {
    pub fn new(instance_id: String, current_provider: CurrentProvider) -> Self {
        let (broadcast_tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            instance_id,
            current_provider,
            broadcast_tx,
        }
    }

    fn broadcast(&self, message: MessageType) {
        // No receivers is not an error: it just means no follower is
        // currently connected to hear it.
        let _ = self.broadcast_tx.send(Envelope::new(message));
    }

    /// Best-effort notice that the process is going down. Followers must
    /// treat this as intentional and not reconnect until restarted.
    pub fn broadcast_server_stopping(&self) {
        self.broadcast(MessageType::ServerStopping);
    }

    /// Drive one accepted follower connection to completion. Returns once
    /// the follower disconnects or the session errors.
    pub async fn handle_connection(
        &self,
        mut session: actix_ws::Session,
        mut msg_stream: actix_ws::MessageStream,
        providers: Arc<HashMap<String, Provider>>,
    ) {
        let hello = Envelope::new(MessageType::Connected {
            instance_id: self.instance_id.clone(),
        });
        if session.text(hello.encode().unwrap_or_default()).await.is_err() {
            return;
        }

        let mut broadcasts = self.broadcast_tx.subscribe();
        loop {
            tokio::select! {
                incoming = broadcasts.recv() => {
                    match incoming {
                        Ok(envelope) => {
                            if let Ok(text) = envelope.encode() {
                                if session.text(text).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                incoming = msg_stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.on_message(&mut session, &text, &providers).await;
                        }
                        Some(Ok(Message::Ping(bytes))) => {
                            let _ = session.pong(&bytes).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
            }
        }
        let _ = session.close(None).await;
    }

    async fn on_message(
        &self,
        session: &mut actix_ws::Session,
        raw: &str,
        providers: &HashMap<String, Provider>,
    ) {
        let Ok(envelope) = Envelope::decode(raw) else {
            return;
        };
        match envelope.message {
            MessageType::Ping => {
                let pong = Envelope::new(MessageType::Pong);
                if let Ok(text) = pong.encode() {
                    let _ = session.text(text).await;
                }
            }
            MessageType::SwitchProvider { provider_id } => {
                let (reply, changed) = self.switch_provider(&provider_id, providers);
                if let Ok(text) = reply.encode() {
                    let _ = session.text(text).await;
                }
                if changed {
                    if let Some(p) = providers.get(&provider_id) {
                        self.broadcast(MessageType::ProviderChanged {
                            provider_id: provider_id.clone(),
                            provider_name: p.name.clone(),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    /// Returns the reply envelope and whether the current provider
    /// actually changed. `switch_provider` on the already-current id is
    /// idempotent: it replies success with no broadcast (testable
    /// property 7).
    fn switch_provider(
        &self,
        provider_id: &str,
        providers: &HashMap<String, Provider>,
    ) -> (Envelope, bool) {
        if self.current_provider.get().as_str() == provider_id {
            return (
                Envelope::new(MessageType::SwitchResult {
                    success: true,
                    provider_id: Some(provider_id.to_string()),
                    provider_name: providers.get(provider_id).map(|p| p.name.clone()),
                    error: None,
                }),
                false,
            );
        }
        match providers.get(provider_id) {
            Some(p) if p.enabled => {
                self.current_provider.set(provider_id.to_string());
                (
                    Envelope::new(MessageType::SwitchResult {
                        success: true,
                        provider_id: Some(provider_id.to_string()),
                        provider_name: Some(p.name.clone()),
                        error: None,
                    }),
                    true,
                )
            }
            Some(_) => (
                Envelope::new(MessageType::SwitchResult {
                    success: false,
                    provider_id: None,
                    provider_name: None,
                    error: Some("provider is disabled".to_string()),
                }),
                false,
            ),
            None => (
                Envelope::new(MessageType::SwitchResult {
                    success: false,
                    provider_id: None,
                    provider_name: None,
                    error: Some("unknown provider".to_string()),
                }),
                false,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderMode, ProviderType};

    fn sample_providers() -> HashMap<String, Provider> {
        let mut map = HashMap::new();
        map.insert(
            "openai".to_string(),
            Provider {
                id: "openai".to_string(),
                name: "OpenAI".to_string(),
                base_url: "https://api.openai.com".to_string(),
                mode: ProviderMode::Passthrough,
                provider_type: ProviderType::Openai,
                api_key: None,
                auth_header: None,
                model_map: vec![],
                vl_model_map: vec![],
                extra_headers: HashMap::new(),
                enabled: true,
            },
        );
        map
    }

    #[test]
    fn switch_to_already_current_does_not_mark_changed() {
        let current = CurrentProvider::new("openai".to_string());
        let leader = Leader::new("leader-1".to_string(), current);
        let (reply, changed) = leader.switch_provider("openai", &sample_providers());
        assert!(!changed);
        assert!(matches!(
            reply.message,
            MessageType::SwitchResult { success: true, .. }
        ));
    }

    #[test]
    fn switch_to_unknown_provider_fails() {
        let current = CurrentProvider::new("openai".to_string());
        let leader = Leader::new("leader-1".to_string(), current);
        let (reply, changed) = leader.switch_provider("does-not-exist", &sample_providers());
        assert!(!changed);
        assert!(matches!(
            reply.message,
            MessageType::SwitchResult { success: false, .. }
        ));
    }
}
