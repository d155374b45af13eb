//! Error taxonomy for helperd.
//!
//! Only [`RequestError`] ever reaches a caller. Everything else is handled
//! by the component that detected it and surfaced as a `[system]` log line.

use std::path::PathBuf;

use thiserror::Error;

/// Early rejection of a START/STOP request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request ignored: missing tool identifier")]
    MissingIdentifier,
    #[error("{0} is already running, ignoring duplicate start")]
    DuplicateStart(String),
}

/// The privileged command could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("binary not found at {}", .0.display())]
    BinaryMissing(PathBuf),
    #[error("binary at {} is not executable", .0.display())]
    NotExecutable(PathBuf),
    #[error("failed to spawn privileged shell {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },
    #[error("privileged shell command is empty")]
    NoShell,
}

/// One of the two termination actions of a stop request failed.
#[derive(Debug, Error)]
pub enum StopError {
    #[error("kill command could not run: {0}")]
    KillCommand(#[from] LaunchError),
    #[error("kill command failed to complete: {0}")]
    KillWait(#[source] std::io::Error),
    #[error("kill command exited with {0}")]
    KillExit(std::process::ExitStatus),
}
