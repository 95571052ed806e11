//! Collector subprocess supervision.
//!
//! The collector runs as a child process. A background reaper task owns the
//! child, waits for it to exit and publishes the exit status on a `watch`
//! channel, so liveness is tracked without anyone blocking on `wait()`.
//!
//! Stopping is single-assignment: the first caller moves the process from
//! `Running` to `Stopping` under the state lock and is the only one that
//! signals the OS process. Later callers, and callers that find the process
//! already exited, return `Ok(())` without side effects.

use crate::error::{ExtensionError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

#[cfg(unix)]
use nix::sys::signal::{Signal, kill};
#[cfg(unix)]
use nix::unistd::Pid;

/// How long to wait for the reaper after a forced kill.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// The command used to launch the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorCommand {
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    inherit_stdio: bool,
}

impl CollectorCommand {
    /// Creates a command for the executable at `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            inherit_stdio: true,
        }
    }

    /// Adds a command-line argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds several command-line arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable on top of the inherited environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets several environment variables on top of the inherited environment.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets whether the collector writes to this process's stdout/stderr.
    #[must_use]
    pub fn inherit_stdio(mut self, inherit: bool) -> Self {
        self.inherit_stdio = inherit;
        self
    }

    /// Returns the executable path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns the arguments.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Returns the environment overrides.
    pub fn get_env(&self) -> &HashMap<String, String> {
        &self.env
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if self.inherit_stdio {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        cmd
    }
}

/// Reasons the collector could not be launched.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The executable does not exist.
    #[error("collector executable not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The OS refused to spawn the process.
    #[error("failed to spawn {}", .program.display())]
    Spawn {
        /// Executable that failed to spawn.
        program: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A collector is already running under this supervisor.
    #[error("collector already running with pid {0}")]
    AlreadyRunning(u32),
}

/// How a collector process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when the process was killed by one.
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Returns true if the process exited with code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Lifecycle state of a supervised collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawn in progress.
    Starting,
    /// Running and expected to keep running.
    Running,
    /// A stop has been requested and the process has not exited yet.
    Stopping,
    /// The process has exited and been reaped.
    Exited(ExitInfo),
}

impl ProcessState {
    /// Returns true once the process has been reaped.
    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessState::Exited(_))
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Exited(exit) => write!(f, "exited ({})", exit),
        }
    }
}

/// A running (or finished) collector process.
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: u32,
    program: PathBuf,
    started_at: Instant,
    state: Arc<Mutex<ProcessState>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl SupervisedProcess {
    fn spawn(command: &CollectorCommand) -> std::result::Result<Self, SpawnError> {
        let state = Arc::new(Mutex::new(ProcessState::Starting));

        let child = command.to_command().spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                SpawnError::NotFound(command.program.clone())
            } else {
                SpawnError::Spawn {
                    program: command.program.clone(),
                    source: e,
                }
            }
        })?;

        let pid = child.id().unwrap_or_default();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(reap(child, pid, Arc::clone(&state), exit_tx, kill_rx));
        *state.lock() = ProcessState::Running;

        tracing::info!(
            pid,
            program = %command.program.display(),
            args = ?command.args,
            "Collector started"
        );

        Ok(Self {
            pid,
            program: command.program.clone(),
            started_at: Instant::now(),
            state,
            exit_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
        })
    }

    /// Returns the OS process ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the executable path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns when the process was started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Returns the current state.
    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Returns the exit status if the process has already been reaped.
    pub fn try_exit(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Waits until the process has exited and returns how it ended.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let exit = rx
            .wait_for(Option::is_some)
            .await
            .map(|exit| (*exit).unwrap_or_default())
            .unwrap_or_default();
        exit
    }

    /// Stops the process, allowing it `grace` to exit on its own.
    ///
    /// Sends SIGTERM, waits up to `grace`, then kills the process.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::ShutdownTimeout`] if the process had to be
    /// killed, with a zero duration when SIGTERM could not be sent at all.
    /// Calling this on a process that has exited or is already being
    /// stopped returns `Ok(())`.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ProcessState::Exited(_) | ProcessState::Stopping => return Ok(()),
                ProcessState::Starting | ProcessState::Running => {
                    *state = ProcessState::Stopping;
                }
            }
        }

        tracing::debug!(pid = self.pid, grace_ms = grace.as_millis(), "Stopping collector");

        if self.try_exit().is_none() && !self.terminate() {
            tracing::warn!(pid = self.pid, "Collector could not be signalled, killing");
            self.force_kill().await;
            return Err(ExtensionError::ShutdownTimeout(Duration::ZERO));
        }

        match tokio::time::timeout(grace, self.wait_exit()).await {
            Ok(exit) => {
                tracing::info!(
                    pid = self.pid,
                    %exit,
                    uptime_ms = self.started_at.elapsed().as_millis(),
                    "Collector stopped"
                );
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    grace_ms = grace.as_millis(),
                    "Collector did not exit within grace period, killing"
                );
                self.force_kill().await;
                Err(ExtensionError::ShutdownTimeout(grace))
            }
        }
    }

    /// Asks the process to exit. Returns false if no graceful signal could be sent.
    #[cfg(unix)]
    fn terminate(&self) -> bool {
        let Ok(raw) = i32::try_from(self.pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }

        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => true,
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "Failed to send SIGTERM to collector");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        false
    }

    async fn force_kill(&self) {
        if let Some(kill_tx) = self.kill_tx.lock().take() {
            let _ = kill_tx.send(());
        }

        if tokio::time::timeout(FORCE_KILL_WAIT, self.wait_exit())
            .await
            .is_err()
        {
            tracing::error!(pid = self.pid, "Collector was not reaped after kill");
        }
    }
}

async fn reap(
    mut child: Child,
    pid: u32,
    state: Arc<Mutex<ProcessState>>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    kill_rx: oneshot::Receiver<()>,
) {
    // A dropped sender also resolves `kill_rx`, so the child never outlives
    // its SupervisedProcess.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid, error = %e, "Kill failed, process likely already exited");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to reap collector");
            ExitInfo::default()
        }
    };

    let previous = std::mem::replace(&mut *state.lock(), ProcessState::Exited(exit));
    tracing::debug!(pid, %exit, previous = %previous, "Collector exited");

    let _ = exit_tx.send(Some(exit));
}

/// Launches and stops the collector.
///
/// This is the seam the lifecycle manager is generic over.
pub trait Supervisor {
    /// Handle to a started collector.
    type Process: Send + Sync;

    /// Launches the collector.
    fn start(
        &self,
        command: &CollectorCommand,
    ) -> impl Future<Output = Result<Self::Process>> + Send;

    /// Resolves when the collector exits, for any reason.
    fn exited(&self, process: &Self::Process) -> impl Future<Output = ExitInfo> + Send;

    /// Stops the collector, waiting at most `grace` before killing it.
    fn stop(
        &self,
        process: &Self::Process,
        grace: Duration,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Supervisor for a single OS-level collector process.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    current: Mutex<Option<Arc<SupervisedProcess>>>,
}

impl ProcessSupervisor {
    /// Creates a supervisor with no process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current process, if one has been started.
    pub fn current(&self) -> Option<Arc<SupervisedProcess>> {
        self.current.lock().clone()
    }
}

impl Supervisor for ProcessSupervisor {
    type Process = Arc<SupervisedProcess>;

    async fn start(&self, command: &CollectorCommand) -> Result<Self::Process> {
        let mut current = self.current.lock();

        if let Some(existing) = current.as_ref() {
            if !existing.state().is_exited() {
                return Err(ExtensionError::Start(SpawnError::AlreadyRunning(
                    existing.pid(),
                )));
            }
        }

        let process = Arc::new(SupervisedProcess::spawn(command).map_err(ExtensionError::Start)?);
        *current = Some(Arc::clone(&process));

        Ok(process)
    }

    async fn exited(&self, process: &Self::Process) -> ExitInfo {
        process.wait_exit().await
    }

    async fn stop(&self, process: &Self::Process, grace: Duration) -> Result<()> {
        process.stop(grace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_command_builder() {
        let command = CollectorCommand::new("/opt/otelcol")
            .arg("--config")
            .args(["/opt/config.yaml"])
            .env("FOO", "bar")
            .envs([("BAZ", "qux")])
            .inherit_stdio(false);

        assert_eq!(command.program(), Path::new("/opt/otelcol"));
        assert_eq!(command.get_args(), ["--config", "/opt/config.yaml"]);
        assert_eq!(command.get_env().get("FOO"), Some(&"bar".to_string()));
        assert_eq!(command.get_env().get("BAZ"), Some(&"qux".to_string()));
        assert!(!command.inherit_stdio);
    }

    #[test]
    fn test_exit_info_display() {
        let normal = ExitInfo {
            code: Some(0),
            signal: None,
        };
        let killed = ExitInfo {
            code: None,
            signal: Some(9),
        };

        assert!(normal.success());
        assert_eq!(normal.to_string(), "exit code 0");
        assert!(!killed.success());
        assert_eq!(killed.to_string(), "killed by signal 9");
        assert_eq!(ExitInfo::default().to_string(), "unknown exit status");
    }

    #[test]
    fn test_process_state_display() {
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert!(
            ProcessState::Exited(ExitInfo::default())
                .to_string()
                .starts_with("exited")
        );
        assert!(!ProcessState::Stopping.is_exited());
    }

    #[tokio::test]
    async fn test_start_missing_executable() {
        let supervisor = ProcessSupervisor::new();
        let command = CollectorCommand::new("/nonexistent/otelcol-binary");

        let result = supervisor.start(&command).await;

        assert!(matches!(
            result,
            Err(ExtensionError::Start(SpawnError::NotFound(_)))
        ));
        assert!(supervisor.current().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unsignallable_process_is_killed_and_reported() {
        let command = CollectorCommand::new("/bin/sh")
            .args(["-c", "sleep 5"])
            .inherit_stdio(false);
        let mut process = SupervisedProcess::spawn(&command).expect("spawn failed");
        // A pid of zero makes SIGTERM delivery impossible.
        process.pid = 0;

        let result = process.stop(Duration::from_secs(2)).await;

        match result {
            Err(ExtensionError::ShutdownTimeout(grace)) => assert_eq!(grace, Duration::ZERO),
            other => panic!("expected ShutdownTimeout, got {:?}", other),
        }
        assert!(process.state().is_exited());
        assert_eq!(process.try_exit().and_then(|exit| exit.signal), Some(9));
    }
}
