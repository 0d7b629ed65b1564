//! Subscription tasks and reconnect backoff

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelEvent, ChannelState, Connector};
use crate::config::ChannelConfig;
use crate::request::exponential_delay;

const EVENT_BUFFER: usize = 256;

/// Reconnect backoff and attempt ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_delay(self.base_delay, self.max_delay, attempt.saturating_sub(1))
    }
}

/// Receiving end of one subscription
#[derive(Debug)]
pub struct Subscription {
    key: String,
    events: mpsc::Receiver<ChannelEvent>,
    state: watch::Receiver<ChannelState>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next event; `None` once the subscription task has stopped
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }
}

struct Handle {
    token: CancellationToken,
    state: watch::Receiver<ChannelState>,
    task: JoinHandle<()>,
}

/// Keyed push subscriptions that reconnect with exponential backoff
pub struct ReconnectingChannel {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    subscriptions: Mutex<HashMap<String, Handle>>,
}

impl std::fmt::Debug for ReconnectingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingChannel")
            .field("policy", &self.policy)
            .field("subscriptions", &self.keys())
            .finish()
    }
}

impl ReconnectingChannel {
    pub fn new(connector: impl Connector, policy: ReconnectPolicy) -> Self {
        Self::with_shared(Arc::new(connector), policy)
    }

    pub fn with_shared(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Start a subscription for `key`, replacing any existing one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, key: &str) -> Subscription {
        self.disconnect(key);

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let token = CancellationToken::new();

        let task = tokio::spawn(run_subscription(
            self.connector.clone(),
            self.policy,
            key.to_string(),
            event_tx,
            state_tx,
            token.clone(),
        ));

        self.lock_subscriptions().insert(
            key.to_string(),
            Handle {
                token,
                state: state_rx.clone(),
                task,
            },
        );

        Subscription {
            key: key.to_string(),
            events: event_rx,
            state: state_rx,
        }
    }

    /// Tear down the subscription for `key` and cancel any pending reconnect
    pub fn disconnect(&self, key: &str) -> bool {
        let removed = self.lock_subscriptions().remove(key);
        match removed {
            Some(handle) => {
                handle.token.cancel();
                debug!(key = %key, "Subscription disconnected");
                true
            }
            None => false,
        }
    }

    /// Tear down every subscription; returns how many were active
    pub fn disconnect_all(&self) -> usize {
        let drained: Vec<Handle> = self
            .lock_subscriptions()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &drained {
            handle.token.cancel();
        }
        drained.len()
    }

    pub fn state(&self, key: &str) -> Option<ChannelState> {
        self.lock_subscriptions()
            .get(key)
            .map(|handle| *handle.state.borrow())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock_subscriptions().keys().cloned().collect()
    }

    /// Whether the task for `key` is still running
    pub fn is_active(&self, key: &str) -> bool {
        self.lock_subscriptions()
            .get(key)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<String, Handle>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ReconnectingChannel {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

/// Decode one raw payload; malformed payloads are reported, never fatal
fn decode_payload(key: &str, raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %key, error = %e, "Dropping malformed push payload");
            None
        }
    }
}

async fn run_subscription(
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    key: String,
    events: mpsc::Sender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    token: CancellationToken,
) {
    let mut attempts: u32 = 0;

    loop {
        state.send_replace(ChannelState::Connecting);

        let connected = tokio::select! {
            _ = token.cancelled() => break,
            result = connector.connect(&key) => result,
        };

        let reason = match connected {
            Ok(mut stream) => {
                attempts = 0;
                state.send_replace(ChannelState::Open);
                info!(key = %key, "Push channel open");
                if events.send(ChannelEvent::Opened).await.is_err() {
                    break;
                }

                let closed = loop {
                    let item = tokio::select! {
                        _ = token.cancelled() => None,
                        item = stream.next() => Some(item),
                    };
                    match item {
                        None => break None,
                        Some(Some(Ok(raw))) => {
                            if let Some(value) = decode_payload(&key, &raw)
                                && events.send(ChannelEvent::Message(value)).await.is_err()
                            {
                                break None;
                            }
                        }
                        Some(Some(Err(e))) => break Some(e.to_string()),
                        Some(None) => break Some("connection closed by server".to_string()),
                    }
                };
                match closed {
                    Some(reason) => reason,
                    None => break,
                }
            }
            Err(e) => e.to_string(),
        };

        if events
            .send(ChannelEvent::Interrupted {
                reason: reason.clone(),
            })
            .await
            .is_err()
        {
            break;
        }

        if attempts >= policy.max_attempts {
            warn!(key = %key, attempts, "Reconnect attempts exhausted, giving up");
            state.send_replace(ChannelState::Terminated);
            let _ = events
                .send(ChannelEvent::MaxReconnectAttemptsReached { attempts })
                .await;
            return;
        }

        attempts += 1;
        let delay = policy.delay_for(attempts);
        state.send_replace(ChannelState::Reconnecting {
            attempt: attempts,
            delay,
        });
        warn!(
            key = %key,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Push channel interrupted, scheduling reconnect"
        );

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state.send_replace(ChannelState::Closed);
    debug!(key = %key, "Subscription task stopped");
}
