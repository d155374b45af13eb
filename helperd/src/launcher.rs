//! Command Launcher — runs installed helper binaries through a privileged shell
//!
//! The command line is `<tools_dir>/<tool> <params>`, handed to the elevation
//! prefix (`su -c` by default) as a single argument. Parameters are opaque and
//! passed through verbatim.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::LauncherConfig;
use crate::error::{LaunchError, StopError};

pub struct Launcher {
    tools_dir: PathBuf,
    elevate: Vec<String>,
    kill_command: String,
}

impl Launcher {
    pub fn new(config: &LauncherConfig) -> Self {
        Self {
            tools_dir: config.tools_dir.clone(),
            elevate: config.elevate.clone(),
            kill_command: config.kill_command.clone(),
        }
    }

    /// Absolute path of the installed binary for `tool`
    pub fn binary_path(&self, tool: &str) -> PathBuf {
        let path = self.tools_dir.join(tool);
        std::path::absolute(&path).unwrap_or(path)
    }

    /// Full command line handed to the privileged shell
    pub fn command_line(&self, tool: &str, params: &str) -> String {
        let binary = self.binary_path(tool);
        if params.is_empty() {
            binary.display().to_string()
        } else {
            format!("{} {params}", binary.display())
        }
    }

    /// Spawn `tool` with piped stdout/stderr.
    pub fn launch(&self, tool: &str, params: &str) -> Result<Child, LaunchError> {
        let binary = self.binary_path(tool);
        check_executable(&binary)?;

        let command_line = self.command_line(tool, params);
        info!(tool, "Launching: {command_line}");

        let mut cmd = self.elevated(&command_line)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.spawn().map_err(|source| LaunchError::Spawn {
            shell: self.elevate.join(" "),
            source,
        })
    }

    /// Kill every process named `tool` through the privileged shell.
    pub async fn kill_by_name(&self, tool: &str) -> Result<(), StopError> {
        let command_line = format!("{} {tool}", self.kill_command);
        debug!(tool, "Running kill command: {command_line}");

        let status = self
            .elevated(&command_line)?
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(StopError::KillWait)?;

        if status.success() {
            Ok(())
        } else {
            Err(StopError::KillExit(status))
        }
    }

    fn elevated(&self, command_line: &str) -> Result<Command, LaunchError> {
        let (shell, prefix) = self.elevate.split_first().ok_or(LaunchError::NoShell)?;
        let mut cmd = Command::new(shell);
        cmd.args(prefix).arg(command_line);
        Ok(cmd)
    }
}

fn check_executable(path: &Path) -> Result<(), LaunchError> {
    let metadata =
        std::fs::metadata(path).map_err(|_| LaunchError::BinaryMissing(path.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(LaunchError::BinaryMissing(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(LaunchError::NotExecutable(path.to_path_buf()));
        }
    }

    Ok(())
}
