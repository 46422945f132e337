//! Process handle: one spawned OS process and its output

use crate::runtime::output::{LogSink, OutputBuffer, OutputStream};
use indexmap::IndexMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Service name (for logging)
    pub name: String,
    /// Executable path or interpreter
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Overlay merged over the inherited environment
    pub env: IndexMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    /// Exit code, when the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, when killed by one
    pub signal: Option<i32>,
    /// Termination was asked for by the supervisor
    pub requested: bool,
}

impl ExitOutcome {
    fn from_status(status: &ExitStatus, requested: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            requested,
        }
    }

    /// Intentional stop: requested by the supervisor or exit code 0
    pub fn is_clean(&self) -> bool {
        self.requested || self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Resolves once the process has exited. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ExitWatch {
    /// Exit outcome if the process already exited
    pub fn try_get(&self) -> Option<ExitOutcome> {
        *self.rx.borrow()
    }

    /// Wait for the process to exit
    pub async fn wait(mut self) -> ExitOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or_default(),
            // The reaper task is gone without reporting; nothing left to wait for
            Err(_) => ExitOutcome::default(),
        }
    }
}

/// A spawned child process.
///
/// The `Child` itself is owned by a reaper task that waits for exit and
/// publishes it through [`ExitWatch`]; the handle keeps the pid, the start
/// time and the means to signal the process.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    pid: u32,
    started_at: Instant,
    exit: ExitWatch,
    kill_tx: mpsc::Sender<()>,
    requested: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// Spawn the process and start capturing its output
    pub fn spawn(
        config: &ProcessConfig,
        output: OutputBuffer,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, ProcessError> {
        log::info!(
            "[{}] Starting: {} {}",
            config.name,
            config.executable,
            config.args.join(" ")
        );

        if let Some(dir) = &config.working_dir {
            if !dir.is_dir() {
                return Err(ProcessError::InvalidWorkingDir {
                    name: config.name.clone(),
                    path: dir.clone(),
                });
            }
        }

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        // Own process group so signals reach the whole tree and a terminal
        // Ctrl+C only reaches the supervisor
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            name: config.name.clone(),
            executable: config.executable.clone(),
            source: e,
        })?;

        let Some(pid) = child.id() else {
            return Err(ProcessError::ExitedBeforeTracked(config.name.clone()));
        };
        log::info!("[{}] Process started with PID: {}", config.name, pid);

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(
                config.name.clone(),
                stdout,
                OutputStream::Stdout,
                output.clone(),
                sink.clone(),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(
                config.name.clone(),
                stderr,
                OutputStream::Stderr,
                output,
                sink,
            );
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let requested = Arc::new(AtomicBool::new(false));
        spawn_reaper(
            config.name.clone(),
            child,
            exit_tx,
            kill_rx,
            requested.clone(),
        );

        Ok(Self {
            name: config.name.clone(),
            pid,
            started_at: Instant::now(),
            exit: ExitWatch { rx: exit_rx },
            kill_tx,
            requested,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.try_get().is_some()
    }

    /// Ask the process to stop (SIGTERM to its process group)
    pub fn terminate(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if self.has_exited() {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
                log::debug!("[{}] SIGTERM failed: {}", self.name, e);
            }
        }

        // No graceful signal elsewhere
        #[cfg(not(unix))]
        self.kill();
    }

    /// Force the process to stop (SIGKILL)
    pub fn kill(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if self.has_exited() {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            // Reaches children left behind by a shell wrapper
            let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        }

        let _ = self.kill_tx.try_send(());
    }
}

/// Read lines from a pipe into the output buffer and the log sink
fn spawn_reader<R>(
    name: String,
    pipe: R,
    stream: OutputStream,
    output: OutputBuffer,
    sink: Arc<dyn LogSink>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.write_line(&name, stream, &line);
            output.push(stream, line);
        }
    });
}

/// Own the child until it exits, then publish the outcome
fn spawn_reaper(
    name: String,
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    mut kill_rx: mpsc::Receiver<()>,
    requested: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Some(()) = kill_rx.recv() => {
                if let Err(e) = child.start_kill() {
                    log::debug!("[{}] kill failed: {}", name, e);
                }
                child.wait().await
            }
        };

        let outcome = match status {
            Ok(status) => ExitOutcome::from_status(&status, requested.load(Ordering::SeqCst)),
            Err(e) => {
                log::error!("[{}] Error waiting for process: {}", name, e);
                ExitOutcome {
                    requested: requested.load(Ordering::SeqCst),
                    ..Default::default()
                }
            }
        };
        log::info!("[{}] Process exited with {}", name, outcome);
        let _ = exit_tx.send(Some(outcome));
    });
}

/// Errors that can occur when spawning a process
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{executable}' for '{name}': {source}")]
    SpawnFailed {
        name: String,
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Working directory '{}' for '{name}' does not exist", .path.display())]
    InvalidWorkingDir { name: String, path: PathBuf },

    #[error("Process for '{0}' exited before its pid could be read")]
    ExitedBeforeTracked(String),
}
