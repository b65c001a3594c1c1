use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard::admin::{AdminServer, PKG_NAME, VERSION};
use switchboard::app::HttpAppLauncher;
use switchboard::backend::BackendLauncher;
use switchboard::config::Config;
use switchboard::events::{EventBus, LifecycleEvent};
use switchboard::forward::ForwarderConfig;
use switchboard::process::ProcessLauncher;
use switchboard::registry::{BackendPool, PoolConfig};
use switchboard::router::{RoutingConfig, Switchboard};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchboard=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("switchboard.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let launcher: Arc<dyn BackendLauncher> = match config.backend.clone() {
        Some(command) => Arc::new(ProcessLauncher::new(command)),
        None => {
            warn!("No [backend] configured, serving the built-in demo app");
            Arc::new(HttpAppLauncher::demo())
        }
    };

    let events = EventBus::default();
    let event_log = tokio::spawn(log_events(events.clone()));

    let pool = BackendPool::with_events(PoolConfig::from(&config.pool), launcher, events);

    let forwarder_config = ForwarderConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let routing = RoutingConfig::from_server(&config.server)?;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let switchboard = Switchboard::with_forwarder_config(
        bind_addr,
        pool.clone(),
        routing,
        shutdown_rx.clone(),
        forwarder_config,
    );
    let forward_stats = switchboard.forwarder().stats();
    let router_handle = tokio::spawn(async move {
        if let Err(e) = switchboard.run().await {
            error!(error = %e, "Switchboard error");
        }
    });

    // Admin surface is loopback-only and optional
    let admin_handle = match config.server.admin_port() {
        Some(admin_port) => {
            let admin_addr = SocketAddr::from(([127, 0, 0, 1], admin_port));
            let admin_server = AdminServer::new(admin_addr, pool.clone(), Arc::clone(&forward_stats), shutdown_rx.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = admin_server.run().await {
                    error!(error = %e, "Admin server error");
                }
            }))
        }
        None => None,
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Stop accepting new connections
    let _ = shutdown_tx.send(true);

    // Stop all backends and wait for each to confirm
    info!("Stopping all backends...");
    pool.close().await;

    // Wait for servers and the event log to finish (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = router_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
        let _ = event_log.await;
    })
    .await;

    info!(
        forwarded_requests = forward_stats.get_total_requests(),
        failed_requests = forward_stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

/// Mirror lifecycle events into the log until the bus closes
async fn log_events(events: EventBus) {
    let mut subscription = events.subscribe();
    while let Some(event) = subscription.recv().await {
        let json = event.to_json();
        match event {
            LifecycleEvent::Error { .. } => warn!(key = %event.key(), event = %json, "Lifecycle event"),
            _ => info!(key = %event.key(), event = %json, "Lifecycle event"),
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting switchboard");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port(),
        default_hostname = %config.server.default_hostname,
        override_header = %config.server.override_header,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        base_port = config.pool.base_port,
        max_servers = config.pool.max_servers,
        startup_timeout_secs = config.pool.startup_timeout_secs,
        shutdown_timeout_secs = config.pool.shutdown_timeout_secs,
        "Backend pool settings"
    );
    match config.backend {
        Some(ref backend) => info!(
            command = %backend.command,
            args = ?backend.args,
            health_path = ?backend.health_path,
            "Backend command"
        ),
        None => info!("Backend command: built-in demo app"),
    }
}
