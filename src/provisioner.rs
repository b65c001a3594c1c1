//! Backend lifecycle tasks
//!
//! Every registered backend is owned by exactly one task spawned here. The
//! task starts the backend, announces readiness, watches for unexpected
//! termination and tears the backend down when its cancellation token fires.
//!
//! Each task is its own failure boundary: an unexpected termination (or a
//! panic) ends that backend only. It is logged, the service is closed with
//! a bound, the record is removed and `error` then `stopped` are published.
//! Sibling backends keep running.
//!
//! Events are published by the registry in the same critical section that
//! changes the record, so per key they never appear out of order.

use crate::backend::BackendService;
use crate::error::PoolError;
use crate::events::LifecycleEvent;
use crate::registry::{BackendRecord, PoolShared, TaskDone};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type ReadySender = oneshot::Sender<Result<BackendRecord, PoolError>>;

/// Spawn the lifecycle task for a freshly registered backend.
///
/// `ready` receives the outcome of provisioning exactly once. The returned
/// future resolves after the task has finished its teardown.
pub(crate) fn spawn(
    shared: Arc<PoolShared>,
    key: String,
    port: u16,
    cancel: CancellationToken,
    ready: ReadySender,
) -> TaskDone {
    let handle = tokio::spawn(async move {
        let lifecycle = Lifecycle {
            shared: Arc::clone(&shared),
            key: key.clone(),
            port,
            cancel,
        };

        match AssertUnwindSafe(lifecycle.run(ready)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => {
                error!(key = %key, port, error = %failure, "Backend lifecycle ended with a failure");
            }
            Err(_) => {
                error!(key = %key, port, "Backend lifecycle task panicked");
                // The record still holds the service handle if it became ready
                let service = shared.record(&key, port).and_then(|r| r.service().cloned());
                if let Some(service) = service {
                    let _ = tokio::time::timeout(shared.config.shutdown_timeout, service.close()).await;
                }
                shared.remove(
                    &key,
                    port,
                    &[
                        LifecycleEvent::error(&key, "lifecycle task panicked"),
                        LifecycleEvent::stopped(&key),
                    ],
                );
            }
        }
    });

    handle.map(|_| ()).boxed().shared()
}

struct Lifecycle {
    shared: Arc<PoolShared>,
    key: String,
    port: u16,
    cancel: CancellationToken,
}

impl Lifecycle {
    async fn run(self, ready: ReadySender) -> Result<(), PoolError> {
        let Some(service) = self.provision(ready).await else {
            return Ok(());
        };

        let exit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            reason = service.exited() => Some(reason),
        };

        match exit {
            None => {
                self.teardown(service).await;
                Ok(())
            }
            Some(reason) => Err(self.crashed(service, reason).await),
        }
    }

    /// Start the backend. Returns the service once it is ready and announced.
    async fn provision(&self, ready: ReadySender) -> Option<Arc<dyn BackendService>> {
        let startup_timeout = self.shared.config.startup_timeout;
        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(startup_timeout, self.shared.launcher.start(&self.key, self.port)) => Some(result),
        };

        let service = match started {
            None => {
                info!(key = %self.key, port = self.port, "Backend cancelled before it became ready");
                self.shared
                    .remove(&self.key, self.port, &[LifecycleEvent::stopped(&self.key)]);
                let _ = ready.send(Err(self.provisioning_failed("shut down before the backend became ready")));
                return None;
            }
            Some(Err(_)) => {
                let reason = format!("not ready after {:?}", startup_timeout);
                self.fail_start(ready, reason);
                return None;
            }
            Some(Ok(Err(e))) => {
                self.fail_start(ready, format!("{:#}", e));
                return None;
            }
            Some(Ok(Ok(service))) => service,
        };

        match self.shared.mark_ready(&self.key, self.port, Arc::clone(&service)) {
            Some(record) => {
                info!(key = %self.key, port = self.port, "Backend is ready");
                let _ = ready.send(Ok(record));
                Some(service)
            }
            None => {
                // Only this task removes its entry, so this is unreachable in practice
                warn!(key = %self.key, port = self.port, "Backend record vanished during startup");
                let _ = ready.send(Err(self.provisioning_failed("backend record vanished during startup")));
                let _ = tokio::time::timeout(self.shared.config.shutdown_timeout, service.close()).await;
                None
            }
        }
    }

    fn fail_start(&self, ready: ReadySender, reason: String) {
        error!(key = %self.key, port = self.port, error = %reason, "Backend failed to start");
        self.shared
            .remove(&self.key, self.port, &[LifecycleEvent::error(&self.key, reason.clone())]);
        let _ = ready.send(Err(self.provisioning_failed(reason)));
    }

    fn provisioning_failed(&self, reason: impl Into<String>) -> PoolError {
        PoolError::ProvisioningFailed {
            key: self.key.clone(),
            reason: reason.into(),
        }
    }

    /// Orderly shutdown: close, wait for confirmation (bounded), announce.
    async fn teardown(&self, service: Arc<dyn BackendService>) {
        let shutdown_timeout = self.shared.config.shutdown_timeout;
        info!(key = %self.key, port = self.port, "Stopping backend");

        let close_error = match tokio::time::timeout(shutdown_timeout, service.close()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("close failed: {:#}", e)),
            Err(_) => Some(format!("close timed out after {:?}", shutdown_timeout)),
        };

        let mut events = Vec::with_capacity(2);
        if let Some(message) = close_error {
            warn!(key = %self.key, port = self.port, error = %message, "Backend did not close cleanly");
            events.push(LifecycleEvent::error(&self.key, message));
        }
        events.push(LifecycleEvent::stopped(&self.key));
        self.shared.remove(&self.key, self.port, &events);
        info!(key = %self.key, port = self.port, "Backend stopped");
    }

    /// The backend went away on its own. Not retried; the next request for
    /// the key provisions a fresh backend.
    async fn crashed(&self, service: Arc<dyn BackendService>, reason: anyhow::Error) -> PoolError {
        let reason = format!("{:#}", reason);
        error!(key = %self.key, port = self.port, error = %reason, "Backend terminated unexpectedly");

        // Release whatever the driver still holds
        let _ = tokio::time::timeout(self.shared.config.shutdown_timeout, service.close()).await;

        self.shared.remove(
            &self.key,
            self.port,
            &[
                LifecycleEvent::error(&self.key, reason.clone()),
                LifecycleEvent::stopped(&self.key),
            ],
        );

        PoolError::UnexpectedTermination {
            key: self.key.clone(),
            reason,
        }
    }
}
