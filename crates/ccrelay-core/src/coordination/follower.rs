//! Follower side of the coordination channel: connects to a leader's
//! `/ccrelay/ws` endpoint, sends periodic pings, reacts to
//! `provider_changed`/`server_stopping`, and can ask the leader to switch
//! providers. Reconnects with exponential backoff on an unintentional
//! close (spec §4.8).
//!
//! Grounded on the workspace's existing WebSocket proxy service
//! (`tokio_tungstenite::connect_async` + split read/write halves) for the
//! outbound-connection shape.

use super::message::{Envelope, MessageType};
use crate::error::CoordinationError;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_FACTOR: u32 = 2;
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const SWITCH_RESULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Observable state of a follower's connection to its leader, plus the
/// bits its reconnect loop needs.
pub struct FollowerState {
    pub conn: ConnState,
    pub reconnect_attempts: u32,
    pub last_ping_mono: Option<std::time::Instant>,
}

impl Default for FollowerState {
    fn default() -> Self {
        Self {
            conn: ConnState::Disconnected,
            reconnect_attempts: 0,
            last_ping_mono: None,
        }
    }
}

/// A handle the rest of the process uses to watch state and request a
/// provider switch. Cheap to clone.
#[derive(Clone)]
pub struct Follower {
    url: Arc<str>,
    state: Arc<RwLock<FollowerState>>,
    intentional_close: Arc<std::sync::atomic::AtomicBool>,
    pending_switch: Arc<RwLock<Option<oneshot::Sender<Envelope>>>>,
    /// Live connection's outbound sender, set for the duration of
    /// `connect_and_serve` and cleared when that connection ends, so
    /// `request_switch` can reach whichever socket happens to be up
    /// without depending on its loop's local state.
    outbound: Arc<RwLock<Option<mpsc::Sender<WsMessage>>>>,
    on_provider_changed: Arc<dyn Fn(String, String) + Send + Sync>,
}

impl Follower {
    pub fn new(url: impl Into<Arc<str>>, on_provider_changed: impl Fn(String, String) + Send + Sync + 'static) -> Self {
        Self {
            url: url.into(),
            state: Arc::new(RwLock::new(FollowerState::default())),
            intentional_close: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            pending_switch: Arc::new(RwLock::new(None)),
            outbound: Arc::new(RwLock::new(None)),
            on_provider_changed: Arc::new(on_provider_changed),
        }
    }

    pub async fn conn_state(&self) -> ConnState {
        self.state.read().await.conn
    }

    /// Tell the reconnect loop to stop once the current connection ends —
    /// used both for caller-initiated shutdown and on receiving
    /// `server_stopping`.
    pub fn mark_intentional_close(&self) {
        self.intentional_close.store(true, Ordering::Release);
    }

    /// Run the connect/reconnect loop until an intentional close or the
    /// backoff budget is exhausted. Intended to be spawned as a background
    /// task.
    pub async fn run(self) {
        let attempts = Arc::new(AtomicU32::new(0));
        loop {
            {
                let mut state = self.state.write().await;
                state.conn = ConnState::Connecting;
            }
            match self.connect_and_serve().await {
                Ok(()) => {
                    // Clean close from the remote side.
                }
                Err(e) => {
                    log::warn!("coordination channel error: {e}");
                    let mut state = self.state.write().await;
                    state.conn = ConnState::Error;
                }
            }

            if self.intentional_close.load(Ordering::Acquire) {
                let mut state = self.state.write().await;
                state.conn = ConnState::Disconnected;
                return;
            }

            let attempt = attempts.fetch_add(1, Ordering::AcqRel) + 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                log::error!("coordination channel: giving up after {attempt} reconnect attempts");
                let mut state = self.state.write().await;
                state.conn = ConnState::Error;
                return;
            }
            let backoff = exponential_backoff(attempt);
            {
                let mut state = self.state.write().await;
                state.conn = ConnState::Disconnected;
                state.reconnect_attempts = attempt;
            }
            log::info!("coordination channel: reconnecting in {backoff:?} (attempt {attempt})");
            tokio::time::sleep(backoff).await;
        }
    }

    async fn connect_and_serve(&self) -> Result<(), CoordinationError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_ref())
            .await
            .map_err(|e| CoordinationError::Transport(e.to_string()))?;
        {
            let mut state = self.state.write().await;
            state.conn = ConnState::Connected;
            state.reconnect_attempts = 0;
        }

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(32);
        *self.outbound.write().await = Some(outbound_tx.clone());

        let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
        ping_ticker.tick().await; // first tick fires immediately; discard

        let result: Result<(), CoordinationError> = loop {
            tokio::select! {
                _ = ping_ticker.tick() => {
                    let ping = Envelope::new(MessageType::Ping).encode().unwrap_or_default();
                    if outbound_tx.send(WsMessage::Text(ping)).await.is_err() {
                        break Ok(());
                    }
                    self.state.write().await.last_ping_mono = Some(std::time::Instant::now());
                }
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(msg) => {
                            if let Err(e) = write.send(msg).await {
                                break Err(CoordinationError::Transport(e.to_string()));
                            }
                        }
                        None => break Ok(()),
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.on_text(&text).await;
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = outbound_tx.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(CoordinationError::Transport(e.to_string())),
                    }
                }
            }
        };
        *self.outbound.write().await = None;
        result
    }

    async fn on_text(&self, text: &str) {
        let Ok(envelope) = Envelope::decode(text) else {
            log::warn!("coordination channel: malformed envelope {text:?}");
            return;
        };
        match envelope.message {
            MessageType::Connected { instance_id } => {
                log::info!("coordination channel: connected to leader {instance_id}");
            }
            MessageType::ProviderChanged {
                provider_id,
                provider_name,
            } => {
                (self.on_provider_changed)(provider_id, provider_name);
            }
            MessageType::ServerStopping => {
                log::info!("coordination channel: leader is stopping, will not reconnect");
                self.mark_intentional_close();
            }
            MessageType::SwitchResult { .. } => {
                if let Some(tx) = self.pending_switch.write().await.take() {
                    let _ = tx.send(envelope);
                }
            }
            MessageType::Pong => {}
            _ => {}
        }
    }

    /// Request the leader switch to `provider_id`; resolves once a
    /// correlated `switch_result` arrives or after a 5s timeout. This
    /// implementation supports one in-flight switch request at a time.
    pub async fn request_switch(&self, provider_id: String) -> Result<Envelope, CoordinationError> {
        let sender = self.outbound.read().await.clone();
        let Some(sender) = sender else {
            return Err(CoordinationError::Transport("not connected".to_string()));
        };

        let (tx, rx) = oneshot::channel();
        *self.pending_switch.write().await = Some(tx);

        let request = Envelope::new(MessageType::SwitchProvider { provider_id })
            .encode()
            .map_err(|e| CoordinationError::Envelope(e.to_string()))?;
        if sender.send(WsMessage::Text(request)).await.is_err() {
            self.pending_switch.write().await.take();
            return Err(CoordinationError::Transport("send failed".to_string()));
        }

        match tokio::time::timeout(SWITCH_RESULT_TIMEOUT, rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(CoordinationError::Transport("channel closed".to_string())),
            Err(_) => {
                self.pending_switch.write().await.take();
                Err(CoordinationError::SwitchResultTimeout)
            }
        }
    }
}

fn exponential_backoff(attempt: u32) -> Duration {
    let millis = INITIAL_BACKOFF.as_millis() as u64 * BACKOFF_FACTOR.pow(attempt.saturating_sub(1)) as u64;
    Duration::from_millis(millis).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_30s() {
        assert_eq!(exponential_backoff(1), Duration::from_secs(1));
        assert_eq!(exponential_backoff(2), Duration::from_secs(2));
        assert_eq!(exponential_backoff(3), Duration::from_secs(4));
        assert_eq!(exponential_backoff(6), Duration::from_secs(30));
        assert_eq!(exponential_backoff(10), Duration::from_secs(30));
    }
}
