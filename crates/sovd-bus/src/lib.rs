//! Topic-based publish/subscribe over `response:{command_id}` channels.
//!
//! The bus is a latency optimisation, not a transport of record: delivery is
//! best-effort, at-most-once, to subscribers that were live at publish time.
//! Durable state lives in the store; the stream gateway reconciles the two
//! via catch-up. Messages published before `subscribe` returns are never
//! observed by that subscriber.

use dashmap::DashMap;
use sovd_schemas::StreamEvent;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

/// Default capacity of each per-channel broadcast buffer. A subscriber that
/// falls this far behind is lagged out and must re-sync from the store.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// Central hub for all response-stream fan-out. Channels are created lazily
/// on first subscribe or publish and reaped by [`EventBus::purge_empty_channels`].
#[derive(Debug)]
pub struct EventBus {
    channels: DashMap<String, Arc<Sender<StreamEvent>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Default::default()
    }

    /// Bus with a custom per-channel buffer capacity. This bounds per-socket
    /// send buffering: a subscriber more than `capacity` events behind is
    /// lagged out instead of growing the buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a channel, creating it if absent. The returned receiver
    /// observes only events published after this call.
    pub fn subscribe(&self, channel: &str) -> Receiver<StreamEvent> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(broadcast::channel(self.capacity).0))
            .value()
            .subscribe()
    }

    /// Publish an event to a channel. Non-blocking; returns the number of
    /// live subscribers the event was handed to (0 when nobody listens,
    /// which is not an error).
    pub fn publish(&self, channel: &str, event: StreamEvent) -> usize {
        match self.channels.get(channel) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |s| s.receiver_count())
    }

    /// Remove channels with no remaining subscribers. Command streams are
    /// short-lived, so this keeps the registry from accumulating one entry
    /// per historical command.
    pub fn purge_empty_channels(&self) -> usize {
        let mut purged = 0;
        self.channels.retain(|_name, sender| {
            if sender.receiver_count() == 0 {
                purged += 1;
                false
            } else {
                true
            }
        });
        if purged > 0 {
            debug!(purged, "purged empty stream channels");
        }
        purged
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
