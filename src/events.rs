//! Lifecycle event bus
//!
//! [`EventBus`] is a thin wrapper around [`tokio::sync::broadcast`] that the
//! backend pool uses to announce backend lifecycle changes.
//!
//! - [`EventBus::publish`] never blocks and never applies backpressure; it is
//!   safe to call from any context, including code running outside a task.
//! - [`EventBus::subscribe`] opens an independent cursor that only sees events
//!   published after the call.
//! - [`EventBus::close`] ends every stream: current subscribers drain what is
//!   buffered and then receive `None`, later subscriptions end immediately.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

/// Default number of events buffered per subscriber before it starts lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A backend lifecycle change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LifecycleEvent {
    /// The backend for `key` accepted its first connection on `port`
    Started { key: String, port: u16 },
    /// The backend for `key` is gone and its record has been removed
    Stopped { key: String },
    /// The backend for `key` failed to start, crashed, or failed to close
    Error { key: String, message: String },
}

impl LifecycleEvent {
    pub fn started(key: impl Into<String>, port: u16) -> Self {
        LifecycleEvent::Started {
            key: key.into(),
            port,
        }
    }

    pub fn stopped(key: impl Into<String>) -> Self {
        LifecycleEvent::Stopped { key: key.into() }
    }

    pub fn error(key: impl Into<String>, message: impl Into<String>) -> Self {
        LifecycleEvent::Error {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Routing key the event refers to
    pub fn key(&self) -> &str {
        match self {
            LifecycleEvent::Started { key, .. }
            | LifecycleEvent::Stopped { key }
            | LifecycleEvent::Error { key, .. } => key,
        }
    }

    /// Serialize to the wire-independent JSON shape
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"type\":\"unknown\",\"key\":\"{}\"}}", self.key()))
    }
}

/// Broadcast channel for lifecycle events.
///
/// Cloning is cheap and every clone publishes into the same stream.
#[derive(Clone)]
pub struct EventBus {
    /// `None` once the bus has been closed
    tx: Arc<RwLock<Option<broadcast::Sender<LifecycleEvent>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a new bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx: Arc::new(RwLock::new(Some(tx))),
        }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Events published with no subscribers, or after the bus was closed,
    /// are dropped.
    pub fn publish(&self, event: LifecycleEvent) {
        if let Some(tx) = self.tx.read().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Opens a new subscription starting at the current point of the stream.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.read().as_ref().map(|tx| tx.subscribe()),
        }
    }

    /// Closes the bus. Idempotent.
    pub fn close(&self) {
        // Dropping the only sender is what delivers `Closed` to receivers
        self.tx.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.tx
            .read()
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// An independent cursor over the event stream
pub struct Subscription {
    rx: Option<broadcast::Receiver<LifecycleEvent>>,
}

impl Subscription {
    /// Waits for the next event. `None` means the bus was closed.
    ///
    /// A subscriber that falls more than the channel capacity behind skips
    /// the events it missed.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, skipping events");
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, skipping events");
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Drains everything currently buffered.
    pub fn drain(&mut self) -> Vec<LifecycleEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
