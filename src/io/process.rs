//! Process management layer
//!
//! Handles the adapter process lifecycle and stderr monitoring, separate
//! from protocol concerns. The protocol layer only ever sees the child's
//! stdin and stdout; stderr is drained here into a bounded diagnostic tail.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
// warn! is used in non-unix code blocks too
use tracing::{debug, error, info, trace, warn};

/// Number of stderr lines kept for diagnostics
pub const STDERR_TAIL_LINES: usize = 200;

type ExitOutcome = Result<ExitStatus, String>;

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask the process to exit (SIGTERM)
    Graceful,
    /// Kill immediately (SIGKILL)
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited; `status` is absent when waiting on it failed
    Exited { status: Option<ExitStatus> },
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Stderr Monitoring Trait
// ============================================================================

/// Trait for monitoring stderr output from external processes
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines
    ///
    /// Only one handler can be active at a time. Must be installed before
    /// the process starts.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Failed to wait for process: {0}")]
    Wait(String),

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Protocol-bearing streams of the adapter process
#[derive(Debug)]
pub struct AdapterStdio {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Trait for managing external process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the external process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Signal the process without waiting for it to exit
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    /// Stop gracefully, escalating to a forced kill after `grace_period`.
    ///
    /// Terminating an already exited process returns its exit status.
    async fn terminate(&mut self, grace_period: Duration) -> Result<ExitStatus, Self::Error>;

    /// Wait for the process to exit
    async fn wait(&self) -> Result<ExitStatus, Self::Error>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;

    /// Hand over stdin and stdout; can be taken once
    fn take_stdio(&mut self) -> Result<AdapterStdio, Self::Error>;
}

/// Debug adapter child process spawned via Command
///
/// Dropping the manager kills the process if it is still running.
pub struct AdapterProcess {
    command: String,

    args: Vec<String>,

    working_directory: Option<PathBuf>,

    /// Thread-safe process state
    state: Arc<Mutex<ProcessState>>,

    /// Stdio streams (available once the process starts)
    stdio: Option<AdapterStdio>,

    stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,

    /// Most recent stderr lines, oldest first
    stderr_tail: Arc<Mutex<VecDeque<String>>>,

    stderr_task: Option<JoinHandle<()>>,

    /// Wait task owns the child; this asks it to kill
    kill_request: Option<oneshot::Sender<()>>,

    exit_outcome: watch::Receiver<Option<ExitOutcome>>,

    /// Kept so `exit_outcome` never observes a closed channel before start
    exit_sender: Option<watch::Sender<Option<ExitOutcome>>>,

    wait_task: Option<JoinHandle<()>>,
}

impl AdapterProcess {
    /// Create a manager for `command args...`; nothing runs until `start`
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        let (exit_sender, exit_outcome) = watch::channel(None);
        Self {
            command,
            args,
            working_directory: working_dir,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio: None,
            stderr_handler: None,
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            stderr_task: None,
            kill_request: None,
            exit_outcome,
            exit_sender: Some(exit_sender),
            wait_task: None,
        }
    }

    /// Spawn and start a process in one step
    pub async fn spawn(
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Self, ProcessError> {
        let mut process = Self::new(command.into(), args, None);
        process.start().await?;
        Ok(process)
    }

    /// Get current process state (thread-safe)
    pub fn get_state(&self) -> ProcessState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    /// Last lines the process wrote to stderr, oldest first
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().unwrap().iter().cloned().collect()
    }

    /// Spawn the stderr monitoring task
    ///
    /// Always drains stderr so the child never blocks on a full pipe.
    fn spawn_stderr_monitor(&mut self, stderr: tokio::process::ChildStderr) {
        if self.stderr_task.is_some() {
            return;
        }

        let handler = self.stderr_handler.clone();
        let tail = Arc::clone(&self.stderr_tail);

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            trace!(
                "AdapterProcess: Starting stderr monitoring (handler: {})",
                if handler.is_some() {
                    "installed"
                } else {
                    "draining only"
                }
            );

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("AdapterProcess: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        let line_content = line.trim_end().to_string();
                        if line_content.is_empty() {
                            continue;
                        }

                        trace!("AdapterProcess: stderr line: {}", line_content);
                        if let Some(handler) = &handler {
                            handler(line_content.clone());
                        }

                        let mut tail = tail.lock().unwrap();
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line_content);
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }

            trace!("AdapterProcess: stderr monitoring finished");
        });

        self.stderr_task = Some(task);
    }

    /// Spawn the wait task that owns the child until it exits
    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) -> Result<(), ProcessError> {
        let exit_sender = self.exit_sender.take().ok_or(ProcessError::AlreadyStarted)?;
        let (kill_sender, kill_receiver) = oneshot::channel::<()>();
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            trace!("AdapterProcess: Starting wait task for PID {}", pid);

            // A dropped sender also means kill: the manager is gone
            let result = tokio::select! {
                result = child.wait() => result,
                _ = kill_receiver => {
                    if let Err(e) = child.start_kill() {
                        debug!("Kill request for PID {} failed: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            let outcome = match result {
                Ok(status) => {
                    info!("Process PID {} exited with status: {}", pid, status);
                    Ok(status)
                }
                Err(e) => {
                    error!("Error waiting for child process: {}", e);
                    Err(e.to_string())
                }
            };

            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Exited {
                    status: outcome.as_ref().ok().copied(),
                };
            }
            let _ = exit_sender.send(Some(outcome));

            trace!("AdapterProcess: Wait task finished for PID {}", pid);
        });

        self.kill_request = Some(kill_sender);
        self.wait_task = Some(task);
        Ok(())
    }

    #[cfg(unix)]
    fn send_terminate_signal(pid: u32) {
        // SAFETY: plain kill(2); the pid belongs to our still-running child
        unsafe {
            if libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 {
                info!("Sent SIGTERM to process {}", pid);
            }
        }
    }

    #[cfg(not(unix))]
    fn send_terminate_signal(pid: u32) {
        warn!(
            "Graceful termination unavailable on this platform, PID {} will be killed after the grace period",
            pid
        );
    }
}

#[async_trait]
impl ProcessManager for AdapterProcess {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if !matches!(self.get_state(), ProcessState::NotStarted) {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn().map_err(|source| ProcessError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;
        info!("Process started with PID: {}", pid);

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ProcessState::Running { pid };

        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdio = Some(AdapterStdio { stdin, stdout });
        self.spawn_stderr_monitor(stderr);
        self.spawn_wait_task(child, pid)?;

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state() {
            ProcessState::Running { pid } => pid,
            ProcessState::Exited { .. } => return Ok(()),
            ProcessState::NotStarted => return Err(ProcessError::NotStarted),
        };

        match mode {
            StopMode::Graceful => Self::send_terminate_signal(pid),
            StopMode::Force => {
                info!("Force killing process with PID: {}", pid);
                if let Some(kill) = self.kill_request.take() {
                    let _ = kill.send(());
                }
            }
        }

        Ok(())
    }

    async fn terminate(&mut self, grace_period: Duration) -> Result<ExitStatus, Self::Error> {
        match self.get_state() {
            ProcessState::NotStarted => return Err(ProcessError::NotStarted),
            ProcessState::Exited { .. } => return self.wait().await,
            ProcessState::Running { pid } => {
                info!("Gracefully stopping process with PID: {}", pid);
            }
        }

        self.stop(StopMode::Graceful).await?;

        match tokio::time::timeout(grace_period, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Process '{}' ignored SIGTERM for {:?}, killing it",
                    self.command, grace_period
                );
                self.stop(StopMode::Force).await?;
                self.wait().await
            }
        }
    }

    async fn wait(&self) -> Result<ExitStatus, Self::Error> {
        if matches!(self.get_state(), ProcessState::NotStarted) {
            return Err(ProcessError::NotStarted);
        }

        let mut receiver = self.exit_outcome.clone();
        let outcome = receiver
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| ProcessError::Wait("wait task ended without a status".to_string()))?
            .clone();

        match outcome {
            Some(Ok(status)) => Ok(status),
            Some(Err(reason)) => Err(ProcessError::Wait(reason)),
            None => Err(ProcessError::Wait("no exit status recorded".to_string())),
        }
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn take_stdio(&mut self) -> Result<AdapterStdio, Self::Error> {
        self.stdio.take().ok_or(ProcessError::NotStarted)
    }
}

impl StderrMonitor for AdapterProcess {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
    }
}

impl Drop for AdapterProcess {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        // Dropping `kill_request` makes the wait task kill a still-running child
    }
}
