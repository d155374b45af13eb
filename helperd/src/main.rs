//! helperd daemon
//!
//! Reads `START <tool> [params]` / `STOP <tool>` commands from stdin, one per
//! line, and writes every log event to stdout. Operator diagnostics go to
//! stderr through tracing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use helperd::config::{self, EventFormat, LogFormat, SystemConfig};
use helperd::{Command, LogEvent, MarkerFilePresence, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config::config_path();
    let loaded = config::load_config_from(&config_path)?;
    let found = loaded.is_some();
    let config = loaded.unwrap_or_default();
    init_logging(&config.system)?;

    info!("helperd v{} starting", env!("CARGO_PKG_VERSION"));
    if !found {
        warn!("Config file not found at {}, using defaults", config_path.display());
    }
    info!(
        "Tools from {}, elevation: {}",
        config.launcher.tools_dir.display(),
        config.launcher.elevate.join(" ")
    );

    let presence = Arc::new(MarkerFilePresence::new(&config.presence.marker_file));
    let supervisor = Supervisor::new(&config, presence);
    let printer = tokio::spawn(print_events(supervisor.subscribe(), config.events.format));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&supervisor, &line),
                Ok(None) => {
                    info!("Command input closed");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read command input: {e}");
                    break;
                }
            },
            _ = supervisor.idle_after_activity(), if config.presence.exit_when_idle => {
                info!("Last tool finished, exiting");
                break;
            }
        }
    }

    supervisor.shutdown().await;
    drop(supervisor);

    // The printer ends once every publisher is gone; don't hang on stragglers.
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("Log printer did not finish in time");
    }
    info!("helperd stopped");
    Ok(())
}

fn handle_line(supervisor: &Supervisor, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match Command::parse(line) {
        // Rejections are already reported on the log stream
        Ok(command) => {
            let _ = supervisor.dispatch(command);
        }
        Err(e) => {
            warn!("Bad command {line:?}: {e}");
            supervisor.events().publish(LogEvent::system(None, e.to_string()));
        }
    }
}

async fn print_events(rx: broadcast::Receiver<LogEvent>, format: EventFormat) {
    let mut stream = BroadcastStream::new(rx);
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => match format {
                EventFormat::Text => println!("{event}"),
                EventFormat::Json => match serde_json::to_string(&event) {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!("Failed to serialize log event: {e}"),
                },
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Log output fell behind, {skipped} events dropped");
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_logging(system: &SystemConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&system.log_level))
        .with_context(|| format!("Invalid log level {:?}", system.log_level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true);

    let installed = match system.log_format {
        LogFormat::Compact => tracing::subscriber::set_global_default(builder.compact().finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    };
    installed.context("Failed to set tracing subscriber")?;
    Ok(())
}
