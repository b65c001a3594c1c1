//! Shared helpers for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard::backend::{service_control, BackendLauncher, BackendService, ControlledService, ServiceMonitor};
use switchboard::events::{LifecycleEvent, Subscription};
use tokio::sync::oneshot;

/// How a [`FakeLauncher`] behaves when asked to start a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reports ready (without listening) and closes when asked
    Healthy,
    /// Fails to start
    Fail,
    /// Never becomes ready
    Hang,
    /// Reports ready but never confirms a close
    Stubborn,
    /// Panics while starting
    Panic,
    /// Reports ready, then panics while being watched for an exit
    PanicAfterReady,
}

/// Launcher that fakes backends without binding ports
pub struct FakeLauncher {
    mode: Mode,
    delay: Duration,
    starts: AtomicUsize,
    closes: Arc<AtomicUsize>,
    crash_triggers: Mutex<HashMap<String, oneshot::Sender<String>>>,
    stubborn: Mutex<Vec<ServiceMonitor>>,
}

impl FakeLauncher {
    pub fn new(mode: Mode) -> Arc<Self> {
        Self::with_delay(mode, Duration::ZERO)
    }

    pub fn with_delay(mode: Mode, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode,
            delay,
            starts: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            crash_triggers: Mutex::new(HashMap::new()),
            stubborn: Mutex::new(Vec::new()),
        })
    }

    /// Number of times `start` was called
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `close` calls seen by `PanicAfterReady` services
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Make the running backend for `key` exit on its own
    pub fn crash(&self, key: &str, reason: &str) -> bool {
        match self.crash_triggers.lock().remove(key) {
            Some(trigger) => trigger.send(reason.to_string()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl BackendLauncher for FakeLauncher {
    async fn start(&self, key: &str, port: u16) -> anyhow::Result<Arc<dyn BackendService>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.mode {
            Mode::Fail => anyhow::bail!("process exited with status 1"),
            Mode::Hang => std::future::pending().await,
            Mode::Panic => panic!("launcher exploded"),
            Mode::PanicAfterReady => Ok(Arc::new(PanickingService {
                port,
                closes: Arc::clone(&self.closes),
            })),
            Mode::Stubborn => {
                let (control, monitor) = service_control();
                self.stubborn.lock().push(monitor);
                Ok(Arc::new(ControlledService::new(port, control)))
            }
            Mode::Healthy => {
                let (control, mut monitor) = service_control();
                let (crash_tx, crash_rx) = oneshot::channel::<String>();
                self.crash_triggers.lock().insert(key.to_string(), crash_tx);

                tokio::spawn(async move {
                    let reason = tokio::select! {
                        _ = monitor.shutdown_requested() => "closed".to_string(),
                        Ok(reason) = crash_rx => reason,
                    };
                    monitor.exit(reason);
                });

                Ok(Arc::new(ControlledService::new(port, control)))
            }
        }
    }
}

/// Ready service whose exit watcher panics shortly after startup
struct PanickingService {
    port: u16,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl BackendService for PanickingService {
    fn port(&self) -> u16 {
        self.port
    }

    async fn exited(&self) -> anyhow::Error {
        tokio::time::sleep(Duration::from_millis(50)).await;
        panic!("exit watcher exploded");
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wait for the next event, failing the test after a few seconds
pub async fn next_event(subscription: &mut Subscription) -> LifecycleEvent {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timed out waiting for lifecycle event")
        .expect("event bus closed")
}

/// Poll `condition` until it holds or the timeout expires
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
