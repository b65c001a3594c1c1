use hyper::header::HeaderName;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the switchboard
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Router (and admin surface) settings
    pub server: ServerConfig,

    /// Backend pool settings
    pub pool: PoolSettings,

    /// How to launch a backend. Absent means the built-in demo app.
    pub backend: Option<BackendCommand>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listening port for the router
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the read-only admin API (absent or 0 disables it)
    pub admin_port: Option<u16>,

    /// Routing key used when neither the Host header nor the override header yields one
    #[serde(default = "default_hostname")]
    pub default_hostname: String,

    /// Header whose value selects the backend when the Host has no subdomain
    #[serde(default = "default_override_header")]
    pub override_header: String,

    /// Max time to wait for a backend response, in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bind: default_bind_address(),
            admin_port: None,
            default_hostname: default_hostname(),
            override_header: default_override_header(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Admin port, if the admin surface is enabled
    pub fn admin_port(&self) -> Option<u16> {
        self.admin_port.filter(|port| *port > 0)
    }
}

/// Settings for the backend pool
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// First port handed to a backend
    pub base_port: u16,

    /// Hard ceiling on simultaneously registered backends (default: 100)
    #[serde(default = "default_max_servers")]
    pub max_servers: usize,

    /// Max time for a backend to become ready, in seconds (default: 30)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Max time to wait for a backend to confirm it closed, in seconds (default: 10)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl PoolSettings {
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            max_servers: default_max_servers(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Command used to launch one backend process per routing key
///
/// # Security Warning
///
/// The `command` and `args` fields allow arbitrary command execution.
/// Configuration files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendCommand {
    /// Command to execute to start a backend
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// HTTP path polled for readiness; absent means "accepts TCP connections"
    pub health_path: Option<String>,

    /// Readiness poll interval in milliseconds (default: 100)
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl BackendCommand {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            health_path: None,
            health_check_interval_ms: default_health_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }

    /// Set arguments for this command (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_hostname() -> String {
    "default".to_string()
}

fn default_override_header() -> String {
    "x-app-name".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_max_servers() -> usize {
    100
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_health_interval() -> u64 {
    100 // 100ms
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if self.server.default_hostname.is_empty() {
            errors.push("server: 'default_hostname' must not be empty".to_string());
        }
        if HeaderName::from_bytes(self.server.override_header.as_bytes()).is_err() {
            errors.push(format!(
                "server: 'override_header' is not a valid header name: {:?}",
                self.server.override_header
            ));
        }
        if self.pool.base_port == 0 {
            errors.push("pool: 'base_port' must be greater than 0".to_string());
        }
        if self.pool.max_servers == 0 {
            errors.push("pool: 'max_servers' must be greater than 0".to_string());
        }
        if let Some(ref backend) = self.backend {
            if backend.command.trim().is_empty() {
                errors.push("backend: 'command' must not be empty".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
