//! Log Broadcaster — fan-out of line-oriented log events
//!
//! Every tool output line and every lifecycle message is published here.
//! Listeners subscribe and receive events from the moment they subscribe;
//! nothing is stored, and a listener that falls behind loses events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Where a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    ToolStdout,
    ToolStderr,
    System,
}

/// One line of user-facing log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub source: LogSource,
    /// Tool the line is about. `None` for supervisor-wide messages.
    pub tool: Option<String>,
    pub text: String,
}

impl LogEvent {
    pub fn stdout(tool: &str, text: impl Into<String>) -> Self {
        Self {
            source: LogSource::ToolStdout,
            tool: Some(tool.to_string()),
            text: text.into(),
        }
    }

    pub fn stderr(tool: &str, text: impl Into<String>) -> Self {
        Self {
            source: LogSource::ToolStderr,
            tool: Some(tool.to_string()),
            text: text.into(),
        }
    }

    pub fn system(tool: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            source: LogSource::System,
            tool: tool.map(str::to_string),
            text: text.into(),
        }
    }
}

impl std::fmt::Display for LogEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tool = self.tool.as_deref().unwrap_or_default();
        match self.source {
            LogSource::ToolStdout => write!(f, "[{tool}] {}", self.text),
            LogSource::ToolStderr => write!(f, "[{tool} ERR] {}", self.text),
            LogSource::System => write!(f, "[system] {}", self.text),
        }
    }
}

/// Cloneable publisher handle over a broadcast channel
#[derive(Clone)]
pub struct LogBroadcaster {
    sender: broadcast::Sender<LogEvent>,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: LogEvent) {
        if let Err(e) = self.sender.send(event) {
            // No listeners right now; the event is simply dropped.
            debug!("Log event not delivered: {}", e.0);
        }
    }

    /// Shorthand for a `[system]` line about one tool
    pub fn system(&self, tool: &str, text: impl Into<String>) {
        self.publish(LogEvent::system(Some(tool), text));
    }
}
