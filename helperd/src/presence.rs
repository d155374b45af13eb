//! Presence Lifecycle — Idle/Active state derived from registry occupancy
//!
//! The host keeps a "stay alive" resource exactly while at least one tool is
//! registered. The state is never set directly: the registry calls
//! [`PresenceLifecycle::sync`] from inside the same critical section as the
//! mutation that changed its size.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::events::{LogBroadcaster, LogEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Idle,
    Active,
}

impl PresenceState {
    pub fn from_occupancy(registered: usize) -> Self {
        if registered == 0 {
            PresenceState::Idle
        } else {
            PresenceState::Active
        }
    }
}

/// Host-level "stay alive" resource.
///
/// Called while the registry lock is held, so implementations must be quick
/// and must not call back into the supervisor.
pub trait PresenceHook: Send + Sync {
    fn acquire(&self) -> Result<()>;
    fn release(&self) -> Result<()>;
}

/// Hook that holds nothing. Useful for embedding without a host indicator.
pub struct NoopPresence;

impl PresenceHook for NoopPresence {
    fn acquire(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Marker file that exists while any tool is running
pub struct MarkerFilePresence {
    path: PathBuf,
}

impl MarkerFilePresence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PresenceHook for MarkerFilePresence {
    fn acquire(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = format!(
            "pid={}\nactive_since={}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write marker {}", self.path.display()))
    }

    fn release(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove marker {}", self.path.display())),
        }
    }
}

/// Two-state machine owned by the registry
pub struct PresenceLifecycle {
    state: PresenceState,
    activations: u64,
    hook: Arc<dyn PresenceHook>,
    events: LogBroadcaster,
    watch: watch::Sender<PresenceState>,
}

impl PresenceLifecycle {
    pub fn new(hook: Arc<dyn PresenceHook>, events: LogBroadcaster) -> Self {
        let (watch, _) = watch::channel(PresenceState::Idle);
        Self {
            state: PresenceState::Idle,
            activations: 0,
            hook,
            events,
            watch,
        }
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    /// Number of Idle → Active transitions so far
    pub fn activations(&self) -> u64 {
        self.activations
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceState> {
        self.watch.subscribe()
    }

    /// Recompute the state from the registry size and run transition side effects.
    pub fn sync(&mut self, registered: usize) {
        let next = PresenceState::from_occupancy(registered);
        if next == self.state {
            return;
        }

        match next {
            PresenceState::Active => {
                info!("Presence: entering Active");
                self.activations += 1;
                if let Err(e) = self.hook.acquire() {
                    warn!("Failed to acquire presence resource: {e:#}");
                }
            }
            PresenceState::Idle => {
                info!("Presence: returning to Idle");
                if let Err(e) = self.hook.release() {
                    warn!("Failed to release presence resource: {e:#}");
                }
                self.events
                    .publish(LogEvent::system(None, "all tools stopped"));
            }
        }

        self.state = next;
        self.watch.send_replace(next);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingPresence;
    use super::*;

    #[test]
    fn test_state_from_occupancy() {
        assert_eq!(PresenceState::from_occupancy(0), PresenceState::Idle);
        assert_eq!(PresenceState::from_occupancy(1), PresenceState::Active);
        assert_eq!(PresenceState::from_occupancy(7), PresenceState::Active);
    }

    #[test]
    fn test_transitions_fire_once_per_interval() {
        let hook = Arc::new(CountingPresence::default());
        let mut lifecycle = PresenceLifecycle::new(hook.clone(), LogBroadcaster::new(8));

        lifecycle.sync(1);
        lifecycle.sync(2);
        lifecycle.sync(1);
        assert_eq!(hook.counts(), (1, 0));
        assert_eq!(lifecycle.state(), PresenceState::Active);

        lifecycle.sync(0);
        lifecycle.sync(0);
        assert_eq!(hook.counts(), (1, 1));
        assert_eq!(lifecycle.state(), PresenceState::Idle);

        lifecycle.sync(1);
        lifecycle.sync(0);
        assert_eq!(lifecycle.activations(), 2);
    }

    #[tokio::test]
    async fn test_idle_announces_shutdown_and_updates_watch() {
        let events = LogBroadcaster::new(8);
        let mut rx = events.subscribe();
        let mut lifecycle = PresenceLifecycle::new(Arc::new(NoopPresence), events);
        let watch = lifecycle.subscribe();

        lifecycle.sync(1);
        assert_eq!(*watch.borrow(), PresenceState::Active);
        lifecycle.sync(0);
        assert_eq!(*watch.borrow(), PresenceState::Idle);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.to_string(), "[system] all tools stopped");
    }

    #[test]
    fn test_marker_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("active");
        let marker = MarkerFilePresence::new(&path);

        marker.acquire().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(&format!("pid={}", std::process::id())));

        marker.release().unwrap();
        assert!(!path.exists());
        // Releasing twice is harmless
        marker.release().unwrap();
    }
}
