//! Stop Handler — forceful, detached termination of a tool
//!
//! Never touches the registry: the tool's monitor deregisters it once its
//! exit wait returns.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::LogBroadcaster;
use crate::launcher::Launcher;
use crate::registry::Registry;

pub struct StopHandler {
    registry: Arc<Registry>,
    launcher: Arc<Launcher>,
    events: LogBroadcaster,
}

impl StopHandler {
    pub fn new(registry: Arc<Registry>, launcher: Arc<Launcher>, events: LogBroadcaster) -> Self {
        Self {
            registry,
            launcher,
            events,
        }
    }

    /// Terminate `tool` on a detached task. Awaiting the handle is optional.
    pub fn stop(&self, tool: &str) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let launcher = self.launcher.clone();
        let events = self.events.clone();
        let tool = tool.to_string();

        tokio::spawn(async move {
            let handle = registry.lookup(&tool);
            info!(tool = %tool, attached = handle.is_some(), "Stopping tool");

            // The monitor must observe the cancellation before the
            // external kill's signal reaps the process.
            if let Some(handle) = &handle {
                handle.terminate();
            }

            if let Err(e) = launcher.kill_by_name(&tool).await {
                warn!(tool = %tool, "Kill by name failed: {e}");
                events.system(&tool, format!("stop {tool} failed: {e}"));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LauncherConfig;
    use crate::presence::NoopPresence;
    use crate::registry::ProcessHandle;
    use tokio_util::sync::CancellationToken;

    fn handler(kill_command: &str) -> (StopHandler, Arc<Registry>, LogBroadcaster) {
        let events = LogBroadcaster::new(16);
        let registry = Arc::new(Registry::new(Arc::new(NoopPresence), events.clone()));
        let launcher = Arc::new(Launcher::new(&LauncherConfig {
            tools_dir: std::env::temp_dir(),
            elevate: vec!["sh".into(), "-c".into()],
            kill_command: kill_command.into(),
        }));
        (
            StopHandler::new(registry.clone(), launcher, events.clone()),
            registry,
            events,
        )
    }

    #[tokio::test]
    async fn test_stop_terminates_attached_handle() {
        let (stop, registry, events) = handler("true");
        let mut rx = events.subscribe();
        let token = CancellationToken::new();
        registry.try_register("udp2raw");
        registry.attach_handle("udp2raw", ProcessHandle::new(Some(1), token.clone()));

        stop.stop("udp2raw").await.unwrap();

        assert!(token.is_cancelled());
        // Deregistration is left to the monitor
        assert!(registry.contains("udp2raw"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_unknown_tool_logs_kill_failure() {
        let (stop, registry, events) = handler("false");
        let mut rx = events.subscribe();

        stop.stop("speederv2").await.unwrap();

        let event = rx.recv().await.unwrap();
        assert!(event.to_string().starts_with("[system] stop speederv2 failed:"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stop_placeholder_without_handle() {
        let (stop, registry, _events) = handler("true");
        registry.try_register("speederv2");

        stop.stop("speederv2").await.unwrap();
        assert!(registry.contains("speederv2"));
    }
}
