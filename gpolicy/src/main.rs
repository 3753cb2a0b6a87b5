//! gpolicy
//!
//! Registers GPU policies through NVML and streams violations to stdout as
//! JSON lines until interrupted.

mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use gpolicy_core::metrics::MetricsRegistry;
use gpolicy_core::{PolicyWatcher, WatchConfig};
use gpolicy_nvml::NvmlBackend;

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // stdout carries the violation stream
    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Build the HTTP response for one scrape request
fn metrics_response(request: &[u8], metrics: &MetricsRegistry) -> String {
    let is_scrape = request.starts_with(b"GET /metrics ") || request.starts_with(b"GET / ");
    let (status, body) = if is_scrape {
        ("200 OK", metrics.encode())
    } else {
        ("404 Not Found", String::new())
    };

    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Serve the pipeline's Prometheus metrics until the listener fails
async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let metrics = MetricsRegistry::new();
    info!(port = port, path = "/metrics", "Metrics server listening");

    loop {
        let (mut socket, peer) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let n = socket.read(&mut buf).await.unwrap_or(0);

            let response = metrics_response(&buf[..n], &metrics);
            if let Err(e) = socket.write_all(response.as_bytes()).await {
                debug!(%peer, error = %e, "Metrics scrape aborted");
            }
        });
    }
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        cancel.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "gpolicy starting");

    let mut config = if cli.config.exists() {
        WatchConfig::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        WatchConfig::default()
    };
    if !cli.devices.is_empty() {
        config.devices = cli.devices.clone();
    }

    let thresholds = config.validate().context("Invalid configuration")?;
    info!(
        conditions = %thresholds.enabled(),
        devices = ?config.devices,
        "Configuration loaded"
    );

    if let Some(port) = cli.metrics_port {
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let backend = NvmlBackend::with_poll_interval(cli.poll_interval)
        .context("Failed to initialize NVML backend")?;
    let watcher = PolicyWatcher::new(Arc::new(backend)).with_pipeline(config.pipeline.clone());

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let mut stream = watcher
        .watch(cancel.clone(), &config)
        .await
        .context("Failed to register policy")?;

    while let Some(violation) = stream.next().await {
        info!(%violation, "Policy violation");
        match serde_json::to_string(&violation) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to encode violation"),
        }
    }

    // give the group reaper its teardown window
    tokio::time::sleep(config.pipeline.teardown_timeout).await;
    info!("gpolicy shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_response_serves_scrapes() {
        let metrics = MetricsRegistry::new();
        let response = metrics_response(b"GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n", &metrics);

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("gpolicy_active_registrations"));
    }

    #[test]
    fn test_metrics_response_rejects_other_paths() {
        let metrics = MetricsRegistry::new();

        let response = metrics_response(b"GET /healthz HTTP/1.1\r\n\r\n", &metrics);
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains("Content-Length: 0\r\n"));

        let empty = metrics_response(b"", &metrics);
        assert!(empty.starts_with("HTTP/1.1 404"));
    }
}
