//! Supervisor — the START/STOP entry points
//!
//! START reserves the registry slot and spins up a monitor; STOP hands off to
//! the stop handler. Malformed or duplicate requests are rejected with a
//! `[system]` line and a [`RequestError`]; nothing else is returned to callers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::Command;
use crate::config::HelperdConfig;
use crate::error::RequestError;
use crate::events::{LogBroadcaster, LogEvent};
use crate::launcher::Launcher;
use crate::monitor::{ExitOutcome, Monitor};
use crate::presence::{PresenceHook, PresenceState};
use crate::registry::Registry;
use crate::stop::StopHandler;

pub struct Supervisor {
    registry: Arc<Registry>,
    launcher: Arc<Launcher>,
    events: LogBroadcaster,
    stopper: StopHandler,
    drain_timeout: Duration,
    /// Parent of every monitor's token; replaced after each shutdown.
    shutdown: Mutex<CancellationToken>,
}

impl Supervisor {
    pub fn new(config: &HelperdConfig, presence: Arc<dyn PresenceHook>) -> Self {
        let events = LogBroadcaster::new(config.events.channel_capacity);
        let registry = Arc::new(Registry::new(presence, events.clone()));
        let launcher = Arc::new(Launcher::new(&config.launcher));
        let stopper = StopHandler::new(registry.clone(), launcher.clone(), events.clone());

        Self {
            registry,
            launcher,
            events,
            stopper,
            drain_timeout: config.monitor.drain_timeout(),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &LogBroadcaster {
        &self.events
    }

    pub fn presence(&self) -> watch::Receiver<PresenceState> {
        self.registry.presence()
    }

    pub fn running(&self) -> Vec<String> {
        self.registry.running()
    }

    pub fn is_running(&self, tool: &str) -> bool {
        self.registry.contains(tool)
    }

    /// Resolves once every tool has finished after at least one was started.
    pub async fn idle_after_activity(&self) {
        let mut presence = self.registry.presence();
        loop {
            presence.borrow_and_update();
            if self.registry.idle_after_activity() {
                return;
            }
            if presence.changed().await.is_err() {
                return;
            }
        }
    }

    /// Start `tool` with opaque `params` unless it is already registered.
    pub fn start(&self, tool: &str, params: &str) -> Result<JoinHandle<ExitOutcome>, RequestError> {
        let tool = self.require_identifier(tool)?;

        if !self.registry.try_register(tool) {
            let err = RequestError::DuplicateStart(tool.to_string());
            warn!(tool, "Duplicate start rejected");
            self.events.system(tool, err.to_string());
            return Err(err);
        }

        info!(tool, "Start accepted");
        Ok(self.spawn_monitor(tool, params))
    }

    /// Monitor a slot that has already been reserved.
    fn spawn_monitor(&self, tool: &str, params: &str) -> JoinHandle<ExitOutcome> {
        let monitor = Monitor {
            tool: tool.to_string(),
            params: params.to_string(),
            registry: self.registry.clone(),
            launcher: self.launcher.clone(),
            events: self.events.clone(),
            drain_timeout: self.drain_timeout,
            cancel: self.shutdown_token().child_token(),
        };
        monitor.spawn()
    }

    /// Forcefully stop `tool`. Runs detached; awaiting the handle is optional.
    pub fn stop(&self, tool: &str) -> Result<JoinHandle<()>, RequestError> {
        let tool = self.require_identifier(tool)?;
        Ok(self.stopper.stop(tool))
    }

    /// Run one parsed command, discarding the task handles.
    pub fn dispatch(&self, command: Command) -> Result<(), RequestError> {
        match command {
            Command::Start { tool, params } => self.start(&tool, &params).map(drop),
            Command::Stop { tool } => self.stop(&tool).map(drop),
        }
    }

    /// Stop every tool and wait until the registry is empty.
    pub async fn shutdown(&self) {
        let running = self.registry.running();
        info!(count = running.len(), "Supervisor shutting down");

        let token = self.shutdown_token();
        let stops: Vec<JoinHandle<()>> = running.iter().map(|tool| self.stopper.stop(tool)).collect();
        token.cancel();
        for stop in stops {
            if let Err(e) = stop.await {
                warn!("Stop task failed during shutdown: {e}");
            }
        }

        let mut presence = self.registry.presence();
        let _ = presence.wait_for(|state| *state == PresenceState::Idle).await;

        // Later starts must not inherit the cancelled token
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
        info!("All tools stopped, supervisor idle");
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn require_identifier<'a>(&self, tool: &'a str) -> Result<&'a str, RequestError> {
        let tool = tool.trim();
        if tool.is_empty() {
            let err = RequestError::MissingIdentifier;
            warn!("Request without tool identifier rejected");
            self.events.publish(LogEvent::system(None, err.to_string()));
            return Err(err);
        }
        Ok(tool)
    }
}
