use crate::backend::{service_control, BackendLauncher, BackendService, ControlledService, ServiceMonitor};
use crate::config::BackendCommand;
use anyhow::Context;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Environment variable carrying the routing key to the backend process
pub const KEY_ENV: &str = "SWITCHBOARD_KEY";

/// Timeout for a single readiness check
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches one local process per routing key.
///
/// The process gets its port in `PORT` and its routing key in
/// `SWITCHBOARD_KEY`. It is ready once it accepts TCP connections, or once
/// its health path answers 2xx when one is configured.
pub struct ProcessLauncher {
    command: BackendCommand,
}

impl ProcessLauncher {
    pub fn new(command: BackendCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn start(&self, key: &str, port: u16) -> anyhow::Result<Arc<dyn BackendService>> {
        let config = &self.command;
        info!(key, port, command = %config.command, "Starting backend process");

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Abandoning startup (timeout, cancellation) drops the child
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (name, value) in &config.env {
            cmd.env(name, value);
        }
        cmd.env("PORT", port.to_string());
        cmd.env(KEY_ENV, key);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", config.command))?;
        let pid = child.id().unwrap_or(0);
        info!(key, pid, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, key.to_string(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, key.to_string(), "stderr");
        }

        wait_until_ready(&mut child, port, config).await?;
        info!(key, pid, port, "Backend process is ready");

        let (control, monitor) = service_control();
        tokio::spawn(supervise(
            child,
            key.to_string(),
            config.shutdown_grace_period(),
            monitor,
        ));

        Ok(Arc::new(ControlledService::new(port, control)))
    }
}

/// Poll the backend until it is ready or the process dies
async fn wait_until_ready(child: &mut Child, port: u16, config: &BackendCommand) -> anyhow::Result<()> {
    let interval = config.health_check_interval();
    loop {
        if let Some(status) = child.try_wait()? {
            anyhow::bail!("process exited before becoming ready ({})", status);
        }

        let ready = match config.health_path {
            Some(ref path) => check_health(port, path).await,
            None => tokio::time::timeout(HEALTH_CHECK_TIMEOUT, tokio::net::TcpStream::connect(("127.0.0.1", port)))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false),
        };
        if ready {
            return Ok(());
        }

        tokio::time::sleep(interval).await;
    }
}

/// Check the health endpoint with a raw HTTP GET
async fn check_health(port: u16, path: &str) -> bool {
    let host_port = format!("127.0.0.1:{}", port);
    let mut stream = match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, tokio::net::TcpStream::connect(&host_port)).await {
        Ok(Ok(s)) => s,
        Ok(Err(_)) | Err(_) => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host_port
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read_result = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read_result {
        // Format: "HTTP/1.1 200 OK\r\n"
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| (200..300).contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}

/// Pipe a child's output into the log
fn forward_output<R>(output: R, key: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(key = %key, stream, "{}", line);
        }
    });
}

/// Own the child process until it exits or shutdown is requested
async fn supervise(mut child: Child, key: String, grace_period: Duration, mut monitor: ServiceMonitor) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = monitor.shutdown_requested() => None,
    };

    match exited {
        Some(Ok(status)) => {
            warn!(key = %key, %status, "Backend process exited on its own");
            monitor.exit(format!("process exited with {}", status));
        }
        Some(Err(e)) => {
            warn!(key = %key, error = %e, "Lost track of backend process");
            monitor.exit(format!("failed to wait for process: {}", e));
        }
        None => {
            stop_process(&key, &mut child, grace_period).await;
            monitor.exit("closed");
        }
    }
}

/// SIGTERM, then SIGKILL once the grace period runs out
async fn stop_process(key: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(key, pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(key, ?status, "Backend process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(key, error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                key,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}
