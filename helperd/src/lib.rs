//! helperd — supervises privileged, long-running helper network tools
//!
//! Starts tools on demand through a privileged shell, streams their output as
//! log events, refuses duplicate runs of the same tool, and holds a host-level
//! presence resource exactly while at least one tool is running.

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod monitor;
pub mod presence;
pub mod registry;
pub mod stop;
pub mod supervisor;

pub use command::Command;
pub use config::HelperdConfig;
pub use error::RequestError;
pub use events::{LogBroadcaster, LogEvent, LogSource};
pub use monitor::ExitOutcome;
pub use presence::{MarkerFilePresence, NoopPresence, PresenceHook, PresenceState};
pub use supervisor::Supervisor;
