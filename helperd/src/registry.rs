//! Process Registry — the single source of truth for what is running
//!
//! One mutex guards both the tool map and the presence lifecycle, so every
//! membership change and the Idle/Active transition it causes happen in the
//! same critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::LogBroadcaster;
use crate::presence::{PresenceHook, PresenceLifecycle, PresenceState};

/// Live handle to a launched tool.
///
/// The monitor owns the OS child; this handle lets anyone else force it down.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub run_id: Uuid,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pid,
            started_at: Utc::now(),
            cancel,
        }
    }

    /// Forcefully terminate the process. Unblocks the monitor's exit wait.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }
}

struct Inner {
    /// A reserved slot holds `None` until the process has actually spawned.
    entries: HashMap<String, Option<ProcessHandle>>,
    presence: PresenceLifecycle,
}

pub struct Registry {
    inner: Mutex<Inner>,
    presence_rx: watch::Receiver<PresenceState>,
}

impl Registry {
    pub fn new(hook: Arc<dyn PresenceHook>, events: LogBroadcaster) -> Self {
        let presence = PresenceLifecycle::new(hook, events);
        let presence_rx = presence.subscribe();
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                presence,
            }),
            presence_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking holder cannot leave the map half-updated, so keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve `tool` if nobody holds it. Returns false if it is already registered.
    pub fn try_register(&self, tool: &str) -> bool {
        let mut inner = self.lock();
        if inner.entries.contains_key(tool) {
            return false;
        }
        inner.entries.insert(tool.to_string(), None);
        let len = inner.entries.len();
        inner.presence.sync(len);
        debug!(tool, registered = len, "Registry slot reserved");
        true
    }

    /// Record the live handle for a reserved slot.
    pub fn attach_handle(&self, tool: &str, handle: ProcessHandle) {
        let mut inner = self.lock();
        match inner.entries.get_mut(tool) {
            Some(slot) => {
                debug!(tool, pid = ?handle.pid, run_id = %handle.run_id, "Handle attached");
                *slot = Some(handle);
            }
            None => warn!(tool, "Attaching handle to a slot that is not reserved"),
        }
    }

    /// Drop the entry for `tool`. Returns true if the registry is now empty.
    pub fn remove(&self, tool: &str) -> bool {
        let mut inner = self.lock();
        if inner.entries.remove(tool).is_none() {
            warn!(tool, "Removing a tool that is not registered");
        }
        let len = inner.entries.len();
        inner.presence.sync(len);
        len == 0
    }

    pub fn lookup(&self, tool: &str) -> Option<ProcessHandle> {
        self.lock()
            .entries
            .get(tool)
            .and_then(|slot| slot.clone())
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.lock().entries.contains_key(tool)
    }

    /// Sorted snapshot of registered tool identifiers
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn presence(&self) -> watch::Receiver<PresenceState> {
        self.presence_rx.clone()
    }

    pub fn presence_state(&self) -> PresenceState {
        self.lock().presence.state()
    }

    /// True once the registry has been Active at least once and is Idle now.
    pub fn idle_after_activity(&self) -> bool {
        let inner = self.lock();
        inner.presence.state() == PresenceState::Idle && inner.presence.activations() > 0
    }
}
