//! Generic publish/subscribe message relay.
//!
//! The relay is the only transport this core needs: one channel per call for
//! negotiation/candidate/hangup traffic, one inbox channel per user for
//! incoming-call notification. The contract is deliberately weak — at-least-
//! once delivery to *currently active* subscribers, no ordering across
//! independent publishers, no acknowledgment. A subscriber that joins after a
//! publish misses that message, which is why the call service always
//! subscribes to a call channel before publishing on it.
//!
//! Production deployments back [`MessageRelay`] with a message broker,
//! WebSocket fan-out, or a storage change feed; [`InMemoryRelay`] covers
//! tests and single-process use.

use crate::types::call::CallId;
use async_trait::async_trait;
use dashmap::DashMap;
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Opaque relay payload. Each channel has a single producer-defined schema.
pub type RelayPayload = serde_json::Value;

/// Callback invoked for each message delivered on a subscribed channel.
pub type RelayCallback = Arc<dyn Fn(RelayPayload) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay channel closed: {0}")]
    ChannelClosed(String),

    #[error("relay backend error: {0}")]
    Backend(String),
}

/// Negotiation/candidate/hangup traffic channel for one call.
pub fn call_channel(call_id: &CallId) -> String {
    format!("call:{call_id}")
}

/// Incoming-call notification channel for one user.
pub fn inbox_channel(user_id: &str) -> String {
    format!("inbox:{user_id}")
}

#[async_trait]
pub trait MessageRelay: Send + Sync {
    /// Deliver `payload` to all current subscribers of `channel`.
    async fn publish(&self, channel: &str, payload: RelayPayload) -> Result<(), RelayError>;

    /// Register `on_message` for `channel`. Delivery stops when the returned
    /// handle is dropped or explicitly unsubscribed.
    async fn subscribe(
        &self,
        channel: &str,
        on_message: RelayCallback,
    ) -> Result<RelaySubscription, RelayError>;
}

/// Handle for one active subscription; unsubscribes on drop.
pub struct RelaySubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RelaySubscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for RelaySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

type SubscriberList = Vec<(u64, RelayCallback)>;

/// In-process relay: a channel-keyed subscriber registry with synchronous
/// fan-out at publish time.
#[derive(Default)]
pub struct InMemoryRelay {
    channels: Arc<DashMap<String, SubscriberList>>,
    next_id: AtomicU64,
}

impl InMemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of active subscribers on a channel (test visibility).
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageRelay for InMemoryRelay {
    async fn publish(&self, channel: &str, payload: RelayPayload) -> Result<(), RelayError> {
        // snapshot the callbacks so a subscriber that unsubscribes from
        // inside its own callback cannot deadlock the map shard
        let subscribers: SubscriberList = self
            .channels
            .get(channel)
            .map(|entry| entry.clone())
            .unwrap_or_default();

        trace!(
            "relay publish on {channel} to {} subscriber(s)",
            subscribers.len()
        );

        for (_, callback) in subscribers {
            callback(payload.clone());
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        on_message: RelayCallback,
    ) -> Result<RelaySubscription, RelayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push((id, on_message));

        let channels = Arc::clone(&self.channels);
        let channel = channel.to_string();
        Ok(RelaySubscription::new(move || {
            if let Some(mut entry) = channels.get_mut(&channel) {
                entry.retain(|(sub_id, _)| *sub_id != id);
            }
        }))
    }
}
