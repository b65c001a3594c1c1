//! Backend registry
//!
//! [`BackendPool`] maps routing keys to backends and creates them on demand.
//!
//! # Guarantees
//!
//! - At most one backend and at most one provisioning attempt exist per key.
//!   Concurrent [`get_or_create`](BackendPool::get_or_create) calls for a key
//!   that is still starting share the same attempt and see the same outcome.
//! - The number of registered backends (ready or starting) never exceeds
//!   `max_servers`. The capacity check, port assignment and registration run
//!   inside one critical section that never awaits.
//! - Ports are handed out from a counter that only moves forward, so a port is
//!   never reused within the lifetime of the pool.
//! - Every backend runs in its own lifecycle task (see
//!   [`provisioner`](crate::provisioner)) tied to a child of the pool's root
//!   cancellation token. [`close`](BackendPool::close) cancels the root and
//!   waits for every teardown to finish.
//!
//! Lifecycle changes are published on the pool's [`EventBus`].

use crate::backend::{BackendLauncher, BackendService};
use crate::config::PoolSettings;
use crate::error::PoolError;
use crate::events::{EventBus, LifecycleEvent};
use crate::provisioner;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one provisioning attempt, shared by every caller waiting on it
pub(crate) type PendingCreation = Shared<BoxFuture<'static, Result<BackendRecord, PoolError>>>;

/// Resolves once a lifecycle task has finished its teardown
pub(crate) type TaskDone = Shared<BoxFuture<'static, ()>>;

/// Configuration for the backend pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// First port handed to a backend
    pub base_port: u16,
    /// Maximum number of registered backends
    pub max_servers: usize,
    /// Max time a backend may take to become ready
    pub startup_timeout: Duration,
    /// Max time to wait for a backend to confirm it closed
    pub shutdown_timeout: Duration,
}

impl PoolConfig {
    pub fn new(base_port: u16) -> Self {
        Self::from(&PoolSettings::new(base_port))
    }

    pub fn with_max_servers(mut self, max_servers: usize) -> Self {
        self.max_servers = max_servers;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            base_port: settings.base_port,
            max_servers: settings.max_servers,
            startup_timeout: settings.startup_timeout(),
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }
}

/// Snapshot of one registered backend
#[derive(Clone)]
pub struct BackendRecord {
    key: String,
    port: u16,
    service: Option<Arc<dyn BackendService>>,
    created_at: DateTime<Utc>,
    created: Instant,
}

impl BackendRecord {
    fn new(key: &str, port: u16) -> Self {
        Self {
            key: key.to_string(),
            port,
            service: None,
            created_at: Utc::now(),
            created: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// A backend is ready once its service handle is populated
    pub fn is_ready(&self) -> bool {
        self.service.is_some()
    }

    pub fn service(&self) -> Option<&Arc<dyn BackendService>> {
        self.service.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn uptime(&self) -> Duration {
        self.created.elapsed()
    }
}

impl std::fmt::Debug for BackendRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRecord")
            .field("key", &self.key)
            .field("port", &self.port)
            .field("ready", &self.is_ready())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// A registered backend and the handle of the task that owns it
struct Entry {
    record: BackendRecord,
    cancel: CancellationToken,
    done: TaskDone,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Entry>,
    pending: HashMap<String, PendingCreation>,
    /// Ports handed out so far; never decreases
    ports_assigned: u32,
    closed: bool,
}

impl PoolState {
    fn next_port(&mut self, base_port: u16) -> Option<u16> {
        let port = u16::try_from(u32::from(base_port) + self.ports_assigned).ok()?;
        self.ports_assigned += 1;
        Some(port)
    }
}

/// State shared between the pool handle and its lifecycle tasks
pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    pub(crate) launcher: Arc<dyn BackendLauncher>,
    pub(crate) events: EventBus,
    state: Mutex<PoolState>,
    root: CancellationToken,
}

impl PoolShared {
    /// Populate the service handle, retire the pending creation and publish
    /// `started`, all in one critical section.
    ///
    /// Returns the ready record, or `None` if the entry is gone.
    pub(crate) fn mark_ready(&self, key: &str, port: u16, service: Arc<dyn BackendService>) -> Option<BackendRecord> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key).filter(|e| e.record.port == port)?;
        entry.record.service = Some(service);
        let record = entry.record.clone();
        state.pending.remove(key);
        self.events.publish(LifecycleEvent::started(key, port));
        Some(record)
    }

    /// The record for `key` if it is still the one on `port`
    pub(crate) fn record(&self, key: &str, port: u16) -> Option<BackendRecord> {
        self.state
            .lock()
            .entries
            .get(key)
            .filter(|e| e.record.port == port)
            .map(|e| e.record.clone())
    }

    /// Remove the entry for `key` if it is still the one on `port`, then
    /// publish `events` before releasing the lock.
    ///
    /// A new backend for the same key can only register after this returns,
    /// so its `started` always follows the old one's `stopped`.
    pub(crate) fn remove(&self, key: &str, port: u16, events: &[LifecycleEvent]) -> bool {
        let mut state = self.state.lock();
        let owned = state
            .entries
            .get(key)
            .map(|e| e.record.port == port)
            .unwrap_or(false);
        if owned {
            state.entries.remove(key);
            state.pending.remove(key);
            debug!(key, port, remaining = state.entries.len(), "Backend removed from registry");
            for event in events {
                self.events.publish(event.clone());
            }
        }
        owned
    }
}

/// Registry of on-demand backends keyed by routing key.
///
/// Cloning is cheap; all clones share the same registry.
#[derive(Clone)]
pub struct BackendPool {
    shared: Arc<PoolShared>,
}

impl BackendPool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn BackendLauncher>) -> Self {
        Self::with_events(config, launcher, EventBus::default())
    }

    /// Create a pool publishing into an existing event bus
    pub fn with_events(config: PoolConfig, launcher: Arc<dyn BackendLauncher>, events: EventBus) -> Self {
        info!(
            base_port = config.base_port,
            max_servers = config.max_servers,
            "Backend pool initialized"
        );
        Self {
            shared: Arc::new(PoolShared {
                config,
                launcher,
                events,
                state: Mutex::new(PoolState::default()),
                root: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// The bus lifecycle events are published on
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Return the ready backend for `key`, provisioning it if needed.
    pub async fn get_or_create(&self, key: &str) -> Result<BackendRecord, PoolError> {
        let pending = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }

            if let Some(entry) = state.entries.get(key) {
                if entry.record.is_ready() {
                    return Ok(entry.record.clone());
                }
            }

            let in_flight = state.pending.get(key).cloned();
            match in_flight {
                Some(pending) => {
                    debug!(key, "Joining in-flight provisioning");
                    pending
                }
                None => self.admit(&mut state, key)?,
            }
        };

        pending.await
    }

    /// Register a new backend and start its lifecycle task.
    ///
    /// Runs with the state lock held, so nothing here may await.
    fn admit(&self, state: &mut PoolState, key: &str) -> Result<PendingCreation, PoolError> {
        let config = &self.shared.config;
        if state.entries.len() >= config.max_servers {
            warn!(key, max_servers = config.max_servers, "Backend pool at capacity");
            return Err(PoolError::CapacityExceeded {
                key: key.to_string(),
                max_servers: config.max_servers,
            });
        }

        let port = state.next_port(config.base_port).ok_or_else(|| {
            warn!(key, base_port = config.base_port, "No ports left to assign");
            PoolError::PortsExhausted { key: key.to_string() }
        })?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let failed_key = key.to_string();
        let pending = async move {
            ready_rx.await.unwrap_or_else(|_| {
                Err(PoolError::ProvisioningFailed {
                    key: failed_key,
                    reason: "lifecycle task ended before the backend was ready".to_string(),
                })
            })
        }
        .boxed()
        .shared();

        let cancel = self.shared.root.child_token();
        let done = provisioner::spawn(
            Arc::clone(&self.shared),
            key.to_string(),
            port,
            cancel.clone(),
            ready_tx,
        );

        state.entries.insert(
            key.to_string(),
            Entry {
                record: BackendRecord::new(key, port),
                cancel,
                done,
            },
        );
        state.pending.insert(key.to_string(), pending.clone());
        info!(key, port, registered = state.entries.len(), "Provisioning backend");

        Ok(pending)
    }

    /// Look up the backend for `key` without side effects.
    ///
    /// The returned record may still be starting; check [`BackendRecord::is_ready`].
    pub fn get(&self, key: &str) -> Option<BackendRecord> {
        self.shared
            .state
            .lock()
            .entries
            .get(key)
            .map(|e| e.record.clone())
    }

    /// Snapshot of all ready backends
    pub fn list(&self) -> Vec<BackendRecord> {
        self.shared
            .state
            .lock()
            .entries
            .values()
            .filter(|e| e.record.is_ready())
            .map(|e| e.record.clone())
            .collect()
    }

    /// Number of registered backends, including ones still starting
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a provisioning attempt for `key` is in flight
    pub fn is_pending(&self, key: &str) -> bool {
        self.shared.state.lock().pending.contains_key(key)
    }

    /// Stop the backend for `key` and wait for its teardown to complete.
    ///
    /// Returns `false` if no backend is registered under `key`.
    pub async fn shutdown(&self, key: &str) -> bool {
        let task = {
            let state = self.shared.state.lock();
            state
                .entries
                .get(key)
                .map(|e| (e.cancel.clone(), e.done.clone()))
        };

        match task {
            Some((cancel, done)) => {
                info!(key, "Shutting down backend");
                cancel.cancel();
                done.await;
                true
            }
            None => false,
        }
    }

    /// Stop every backend, wait for all teardowns, then close the event bus.
    ///
    /// After this, [`get_or_create`](Self::get_or_create) fails with
    /// [`PoolError::Closed`]. Calling it again is harmless.
    pub async fn close(&self) {
        let tasks: Vec<TaskDone> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.entries.values().map(|e| e.done.clone()).collect()
        };

        info!(backends = tasks.len(), "Shutting down backend pool");
        self.shared.root.cancel();
        futures::future::join_all(tasks).await;

        self.shared.events.close();
        info!("Backend pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}
