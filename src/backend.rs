//! Backend service abstraction
//!
//! A backend is anything that can be started on a port and later closed.
//! [`BackendLauncher`] starts one, [`BackendService`] is the running handle.
//! The two launchers shipped with the crate are
//! [`ProcessLauncher`](crate::process::ProcessLauncher) (one local process per
//! routing key) and [`HttpAppLauncher`](crate::app::HttpAppLauncher) (an
//! in-process hyper server per routing key).
//!
//! Launchers usually spawn a driver task that owns the actual resources. The
//! driver and the handle talk through [`service_control`]: the handle asks for
//! shutdown, the driver reports when (and why) it exited.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

/// Starts backends on demand
#[async_trait]
pub trait BackendLauncher: Send + Sync + 'static {
    /// Start the backend for `key` listening on `port`.
    ///
    /// Resolves once the backend accepts connections. Dropping the returned
    /// future before it resolves must release anything it acquired.
    async fn start(&self, key: &str, port: u16) -> anyhow::Result<Arc<dyn BackendService>>;
}

/// A running backend
#[async_trait]
pub trait BackendService: Send + Sync + 'static {
    /// Port the backend listens on
    fn port(&self) -> u16;

    /// Resolves when the backend stopped without being asked to.
    ///
    /// Never resolves while the backend is healthy.
    async fn exited(&self) -> anyhow::Error;

    /// Ask the backend to stop and wait until it has fully torn down.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Handle side of a service driver: requests shutdown, observes exit
pub struct ServiceControl {
    shutdown_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<Option<String>>,
}

/// Driver side of a service: observes shutdown requests, reports exit
pub struct ServiceMonitor {
    shutdown_rx: watch::Receiver<bool>,
    exit_tx: watch::Sender<Option<String>>,
}

/// Create a connected control/monitor pair
pub fn service_control() -> (ServiceControl, ServiceMonitor) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (exit_tx, exit_rx) = watch::channel(None);
    (
        ServiceControl {
            shutdown_tx,
            exit_rx,
        },
        ServiceMonitor {
            shutdown_rx,
            exit_tx,
        },
    )
}

impl ServiceControl {
    /// Whether the driver has already reported an exit
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    async fn wait_exit(&self) -> Option<String> {
        let mut exit_rx = self.exit_rx.clone();
        let reason = match exit_rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone(),
            // Driver dropped its monitor without reporting
            Err(_) => None,
        };
        reason
    }
}

impl ServiceMonitor {
    /// Resolves once shutdown is requested or the handle is dropped
    pub async fn shutdown_requested(&mut self) {
        let _ = self.shutdown_rx.wait_for(|requested| *requested).await;
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Report that the driver is done. Consumes the monitor.
    pub fn exit(self, reason: impl Into<String>) {
        self.exit_tx.send_replace(Some(reason.into()));
    }
}

/// A [`BackendService`] backed by a [`ServiceControl`]
pub struct ControlledService {
    port: u16,
    control: ServiceControl,
}

impl ControlledService {
    pub fn new(port: u16, control: ServiceControl) -> Self {
        Self { port, control }
    }
}

#[async_trait]
impl BackendService for ControlledService {
    fn port(&self) -> u16 {
        self.port
    }

    async fn exited(&self) -> anyhow::Error {
        match self.control.wait_exit().await {
            Some(reason) => anyhow::anyhow!(reason),
            None => anyhow::anyhow!("service driver stopped without reporting"),
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.control.shutdown_tx.send_replace(true);
        self.control.wait_exit().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_waits_for_driver() {
        let (control, mut monitor) = service_control();
        let service = ControlledService::new(9000, control);

        let driver = tokio::spawn(async move {
            monitor.shutdown_requested().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            monitor.exit("closed");
        });

        service.close().await.unwrap();
        assert!(service.control.has_exited());
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_reports_reason() {
        let (control, monitor) = service_control();
        let service = ControlledService::new(9000, control);
        assert_eq!(service.port(), 9000);

        monitor.exit("process exited with status 1");
        let err = service.exited().await;
        assert_eq!(err.to_string(), "process exited with status 1");
    }

    #[tokio::test]
    async fn test_dropping_handle_requests_shutdown() {
        let (control, mut monitor) = service_control();
        drop(control);

        tokio::time::timeout(Duration::from_secs(1), monitor.shutdown_requested())
            .await
            .expect("shutdown observed after handle dropped");
    }

    #[tokio::test]
    async fn test_close_after_driver_vanished() {
        let (control, monitor) = service_control();
        drop(monitor);
        let service = ControlledService::new(9000, control);
        assert!(service.close().await.is_ok());
    }
}
