//! Process Monitor — owns one tool's lifecycle from launch to deregistration
//!
//! launch → attach handle → pump stdout/stderr → wait for exit or stop
//! → drain pumps → report → remove from registry.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{LogBroadcaster, LogEvent, LogSource};
use crate::launcher::Launcher;
use crate::registry::{ProcessHandle, Registry};

/// How a monitored run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own with a code
    Exited(i32),
    /// The process was killed by a signal nobody in this supervisor sent
    Signaled(i32),
    /// A stop request (or supervisor shutdown) terminated it
    Stopped,
    /// Waiting on the process failed
    Failed(String),
    /// The process never started
    LaunchFailed(String),
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signaled(signal);
            }
        }
        ExitOutcome::Failed(format!("unrecognised exit status {status}"))
    }

    pub fn describe(&self, tool: &str) -> String {
        match self {
            ExitOutcome::Exited(code) => format!("process {tool} finished, exit code: {code}"),
            ExitOutcome::Signaled(signal) => {
                format!("process {tool} finished, killed by signal {signal}")
            }
            ExitOutcome::Stopped => format!("process {tool} was stopped by user"),
            ExitOutcome::Failed(reason) => format!("process {tool} failed: {reason}"),
            ExitOutcome::LaunchFailed(reason) => format!("{tool} failed to launch: {reason}"),
        }
    }
}

pub struct Monitor {
    pub tool: String,
    pub params: String,
    pub registry: Arc<Registry>,
    pub launcher: Arc<Launcher>,
    pub events: LogBroadcaster,
    pub drain_timeout: Duration,
    /// Cancelled by [`ProcessHandle::terminate`]
    pub cancel: CancellationToken,
}

impl Monitor {
    /// Run on its own task. The slot for `tool` must already be reserved.
    pub fn spawn(self) -> JoinHandle<ExitOutcome> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> ExitOutcome {
        let outcome = self.supervise().await;
        info!(tool = %self.tool, ?outcome, "Monitor finished");
        self.events.system(&self.tool, outcome.describe(&self.tool));
        self.registry.remove(&self.tool);
        outcome
    }

    async fn supervise(&self) -> ExitOutcome {
        let mut child = match self.launcher.launch(&self.tool, &self.params) {
            Ok(child) => child,
            Err(e) => {
                warn!(tool = %self.tool, "Launch failed: {e}");
                return ExitOutcome::LaunchFailed(e.to_string());
            }
        };

        let handle = ProcessHandle::new(child.id(), self.cancel.clone());
        info!(tool = %self.tool, pid = ?handle.pid, "Tool started");
        let started_at = handle.started_at;
        self.registry.attach_handle(&self.tool, handle);

        let pumps = CancellationToken::new();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(
                stdout,
                self.tool.clone(),
                LogSource::ToolStdout,
                self.events.clone(),
                pumps.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(
                stderr,
                self.tool.clone(),
                LogSource::ToolStderr,
                self.events.clone(),
                pumps.clone(),
            )));
        }

        let waited = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };

        let outcome = match waited {
            Some(Ok(status)) => ExitOutcome::from_status(status),
            Some(Err(e)) => ExitOutcome::Failed(e.to_string()),
            None => {
                self.terminate(&mut child).await;
                ExitOutcome::Stopped
            }
        };

        let uptime = Utc::now() - started_at;
        info!(tool = %self.tool, uptime_ms = uptime.num_milliseconds(), "Tool exited");

        self.drain(readers, pumps).await;
        outcome
    }

    /// Forceful kill of the whole process group, then reap.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = child.id() {
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    debug!(tool = %self.tool, pid, "killpg failed: {e}");
                }
            }
        }
        if let Err(e) = child.start_kill() {
            debug!(tool = %self.tool, "start_kill failed: {e}");
        }
        if let Err(e) = child.wait().await {
            warn!(tool = %self.tool, "Failed to reap stopped process: {e}");
        }
    }

    /// Let pumps reach EOF, but never longer than the drain timeout.
    async fn drain(&self, readers: Vec<JoinHandle<()>>, pumps: CancellationToken) {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        for mut reader in readers {
            let joined = match tokio::time::timeout_at(deadline, &mut reader).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!(tool = %self.tool, "Output still open after exit, cancelling pumps");
                    pumps.cancel();
                    reader.await
                }
            };
            if let Err(e) = joined {
                debug!(tool = %self.tool, "Output pump ended abnormally: {e}");
            }
        }
    }
}

/// Forward lines from one stream until EOF, read error, or cancellation.
async fn pump<R>(
    reader: R,
    tool: String,
    source: LogSource,
    events: LogBroadcaster,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(text)) => events.publish(LogEvent {
                source,
                tool: Some(tool.clone()),
                text,
            }),
            Ok(None) => break,
            Err(e) => {
                debug!(tool = %tool, ?source, "Stream read ended: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LauncherConfig;
    use crate::presence::testing::CountingPresence;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tokio::sync::broadcast;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<Registry>,
        launcher: Arc<Launcher>,
        events: LogBroadcaster,
        presence: Arc<CountingPresence>,
    }

    fn fixture(tools: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in tools {
            install(dir.path(), name, body);
        }
        let events = LogBroadcaster::new(256);
        let presence = Arc::new(CountingPresence::default());
        Fixture {
            registry: Arc::new(Registry::new(presence.clone(), events.clone())),
            launcher: Arc::new(Launcher::new(&LauncherConfig {
                tools_dir: dir.path().to_path_buf(),
                elevate: vec!["sh".into(), "-c".into()],
                kill_command: "true".into(),
            })),
            events,
            presence,
            _dir: dir,
        }
    }

    fn install(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    impl Fixture {
        fn monitor(&self, tool: &str, cancel: CancellationToken) -> Monitor {
            assert!(self.registry.try_register(tool));
            Monitor {
                tool: tool.to_string(),
                params: String::new(),
                registry: self.registry.clone(),
                launcher: self.launcher.clone(),
                events: self.events.clone(),
                drain_timeout: Duration::from_millis(200),
                cancel,
            }
        }
    }

    fn collect(rx: &mut broadcast::Receiver<LogEvent>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            lines.push(event.to_string());
        }
        lines
    }

    #[test]
    fn test_outcome_descriptions() {
        assert_eq!(
            ExitOutcome::Exited(0).describe("toolA"),
            "process toolA finished, exit code: 0"
        );
        assert_eq!(
            ExitOutcome::Stopped.describe("toolA"),
            "process toolA was stopped by user"
        );
        assert!(ExitOutcome::LaunchFailed("gone".into())
            .describe("toolA")
            .contains("failed to launch"));
    }

    #[tokio::test]
    async fn test_natural_exit_reports_code_after_output() {
        let fx = fixture(&[("toolA", "echo ready\necho warn >&2\nexit 3")]);
        let mut rx = fx.events.subscribe();

        let outcome = fx.monitor("toolA", CancellationToken::new()).spawn().await.unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(3));

        let lines = collect(&mut rx);
        let ready = lines.iter().position(|l| l == "[toolA] ready").unwrap();
        let warn = lines.iter().position(|l| l == "[toolA ERR] warn").unwrap();
        let report = lines
            .iter()
            .position(|l| l == "[system] process toolA finished, exit code: 3")
            .unwrap();
        assert!(ready < report && warn < report);
        assert_eq!(lines.last().unwrap(), "[system] all tools stopped");

        assert!(fx.registry.is_empty());
        assert_eq!(fx.presence.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_stdout_order_preserved() {
        let fx = fixture(&[("counter", "for i in 1 2 3 4 5 6 7 8 9 10; do echo $i; done")]);
        let mut rx = fx.events.subscribe();

        fx.monitor("counter", CancellationToken::new()).spawn().await.unwrap();

        let numbers: Vec<String> = collect(&mut rx)
            .into_iter()
            .filter_map(|l| l.strip_prefix("[counter] ").map(str::to_string))
            .collect();
        let expected: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
        assert_eq!(numbers, expected);
    }

    #[tokio::test]
    async fn test_cancel_reports_user_stop() {
        let fx = fixture(&[("sleeper", "echo started\nexec sleep 30")]);
        let mut rx = fx.events.subscribe();
        let cancel = CancellationToken::new();

        let task = fx.monitor("sleeper", cancel.clone()).spawn();
        // Wait until the handle is attached and the tool has produced output
        let first = rx.recv().await.unwrap();
        assert_eq!(first.to_string(), "[sleeper] started");
        fx.registry.lookup("sleeper").unwrap().terminate();

        let outcome = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Stopped);
        assert!(collect(&mut rx).contains(&"[system] process sleeper was stopped by user".to_string()));
        assert!(!fx.registry.contains("sleeper"));
    }

    #[tokio::test]
    async fn test_launch_failure_releases_slot() {
        let fx = fixture(&[]);
        let mut rx = fx.events.subscribe();

        let outcome = fx.monitor("missing", CancellationToken::new()).spawn().await.unwrap();
        assert!(matches!(outcome, ExitOutcome::LaunchFailed(_)));

        let lines = collect(&mut rx);
        assert!(lines[0].starts_with("[system] missing failed to launch: binary not found"));
        assert!(fx.registry.is_empty());
        assert_eq!(fx.presence.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_inherited_pipes() {
        // The background sleep keeps stdout open after the tool itself exits
        let fx = fixture(&[("forker", "sleep 30 &\necho bye\nexit 0")]);

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            fx.monitor("forker", CancellationToken::new()).spawn(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_drain_survives_panicked_pump() {
        let fx = fixture(&[]);
        let monitor = fx.monitor("udp2raw", CancellationToken::new());

        let crashed = tokio::spawn(async { panic!("pump crashed") });
        let finished = tokio::spawn(async {});
        tokio::time::timeout(
            Duration::from_secs(5),
            monitor.drain(vec![crashed, finished], CancellationToken::new()),
        )
        .await
        .unwrap();
    }
}
