//! Subprocess execution with streaming output and lifecycle management.
//!
//! This is the single execution contract shared by migrations,
//! verifications, user commands, and the git adapter. The primary entry
//! points are [`ProcessHandle::spawn`], which runs a shell command and
//! returns a handle plus a channel of [`ProcessEvent`]s, and
//! [`run_to_completion`], which drives the event stream to the end with
//! an optional deadline and ring-buffered capture.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::registry::{self, ProcessRecord};

/// Maximum buffered output lines per stream. Earlier lines are discarded
/// with a visible truncation marker so exit codes and error tails are
/// always retained.
pub const MAX_BUFFERED_LINES: usize = 10_000;

/// Grace period between SIGTERM and SIGKILL during cancellation.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Events emitted by a spawned process over the event channel.
///
/// Events are always delivered in this order:
/// 1. [`ProcessEvent::Started`]
/// 2. Zero or more [`ProcessEvent::OutputLine`] events (stdout and stderr interleaved)
/// 3. [`ProcessEvent::Completed`] or [`ProcessEvent::Failed`]
///
/// The channel is disconnected after the terminal event.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Process has started; the PID is available.
    Started { pid: u32 },
    /// A line of output from the process (stdout or stderr).
    OutputLine { line: String, is_stderr: bool },
    /// Process exited; check `exit_code` for success (0) or failure.
    ///
    /// Processes killed by a signal report `exit_code: -1`.
    Completed { exit_code: i32 },
    /// Unexpected error during process monitoring (not a non-zero exit).
    Failed { error: String },
}

/// Errors from process spawn, wait, and kill operations.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to kill process: {0}")]
    KillFailed(String),

    #[error("Process '{op}' timed out after {elapsed_ms}ms")]
    Timeout { op: String, elapsed_ms: u64 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Configuration for spawning a process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Shell command to run via `sh -c`.
    pub command: String,
    /// Working directory for the process.
    pub working_dir: PathBuf,
    /// Optional environment variable overrides (applied last over the
    /// inherited environment).
    pub env: Option<HashMap<String, String>>,
    /// Optional path to a log file; output lines are tee'd here in append mode.
    pub log_path: Option<PathBuf>,
    /// Optional deadline; the process is killed if it exceeds this duration.
    pub timeout: Option<Duration>,
    /// Role recorded in the process registry ("migration", "verify",
    /// "user", "git"). `None` skips registration.
    pub role: Option<String>,
}

impl ProcessConfig {
    #[must_use]
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            env: None,
            log_path: None,
            timeout: None,
            role: None,
        }
    }

    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Ring buffer over output lines, capped at [`MAX_BUFFERED_LINES`].
#[derive(Debug, Default)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    dropped: usize,
}

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == MAX_BUFFERED_LINES {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    /// Number of lines discarded from the front of the buffer.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Joined text; a truncation marker leads when earlier lines were discarded.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if self.dropped > 0 {
            out.push_str(&format!("[... {} earlier lines truncated ...]\n", self.dropped));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Result of running a process to completion.
#[derive(Debug, Clone)]
pub struct CompletedProcess {
    pub exit_code: i32,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Whether either stream hit the ring-buffer cap.
    pub truncated: bool,
}

/// Handle to a running subprocess.
///
/// Created by [`ProcessHandle::spawn`]. Provides the process PID, kill,
/// and graceful termination. Lifecycle events are delivered over the
/// [`mpsc::Receiver<ProcessEvent>`] returned alongside the handle.
///
/// Dropping the handle does **not** kill the subprocess — call
/// [`terminate`](ProcessHandle::terminate) or [`kill`](ProcessHandle::kill)
/// explicitly if termination is needed.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    child: Arc<Mutex<std::process::Child>>,
    running: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// Spawn a subprocess and return a handle plus an event receiver.
    ///
    /// The command is executed via `sh -c <command>` in its own process
    /// group (so cancellation reaches grandchildren). Events are delivered
    /// in order: `Started`, then `OutputLine` events, then `Completed` or
    /// `Failed`. All `OutputLine` events arrive before the terminal event.
    pub fn spawn(
        config: &ProcessConfig,
    ) -> Result<(Self, mpsc::Receiver<ProcessEvent>), ProcessError> {
        let (tx, rx) = mpsc::channel();

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&config.command);
        cmd.current_dir(&config.working_dir);

        if let Some(env) = &config.env {
            for (k, v) in env {
                cmd.env(k, v);
            }
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

        let pid = child.id();
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let running = Arc::new(AtomicBool::new(true));
        let child_arc = Arc::new(Mutex::new(child));

        let registered = if let Some(role) = &config.role {
            let record = ProcessRecord {
                pid,
                repo: config.working_dir.display().to_string(),
                role: role.clone(),
                started_at: chrono::Utc::now()
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                log_path: config
                    .log_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            };
            if let Err(e) = registry::register(&record) {
                log::warn!("failed to register process {pid}: {e}");
            }
            true
        } else {
            false
        };

        let log_file = config.log_path.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| log::warn!("failed to open log file {}: {e}", path.display()))
                .ok()
                .map(|f| Arc::new(Mutex::new(f)))
        });

        // Deliver Started before the background threads begin emitting OutputLine events.
        let _ = tx.send(ProcessEvent::Started { pid });

        // Stdout reader thread — sends OutputLine { is_stderr: false } events.
        let tx_stdout = tx.clone();
        let log_stdout = log_file.clone();
        let stdout_thread = thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(l) => {
                        if let Some(f) = &log_stdout {
                            let _ = writeln!(f.lock().unwrap(), "{l}");
                        }
                        let _ = tx_stdout.send(ProcessEvent::OutputLine {
                            line: l,
                            is_stderr: false,
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        // Stderr reader thread — sends OutputLine { is_stderr: true } events.
        let tx_stderr = tx.clone();
        let log_stderr = log_file;
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(l) => {
                        if let Some(f) = &log_stderr {
                            let _ = writeln!(f.lock().unwrap(), "{l}");
                        }
                        let _ = tx_stderr.send(ProcessEvent::OutputLine {
                            line: l,
                            is_stderr: true,
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        // Monitor thread — polls for exit, joins reader threads, then sends
        // Completed/Failed and deregisters.
        //
        // Polling with try_wait() lets kill/terminate acquire the child lock
        // without contending with a blocking wait() call.
        let child_for_monitor = Arc::clone(&child_arc);
        let running_for_monitor = Arc::clone(&running);
        drop(thread::spawn(move || {
            loop {
                let result = {
                    let mut c = child_for_monitor.lock().unwrap();
                    c.try_wait()
                };

                match result {
                    Ok(Some(exit_status)) => {
                        // Join readers so all OutputLine events are flushed
                        // to the channel before the terminal event.
                        let _ = stdout_thread.join();
                        let _ = stderr_thread.join();
                        let exit_code = exit_status.code().unwrap_or(-1);
                        let _ = tx.send(ProcessEvent::Completed { exit_code });
                        running_for_monitor.store(false, Ordering::SeqCst);
                        if registered {
                            registry::deregister(pid);
                        }
                        break;
                    }
                    Ok(None) => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        let _ = stdout_thread.join();
                        let _ = stderr_thread.join();
                        let _ = tx.send(ProcessEvent::Failed {
                            error: e.to_string(),
                        });
                        running_for_monitor.store(false, Ordering::SeqCst);
                        if registered {
                            registry::deregister(pid);
                        }
                        break;
                    }
                }
            }
        }));

        let handle = Self {
            pid,
            child: child_arc,
            running,
        };

        Ok((handle, rx))
    }

    /// Return the process PID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Return `true` if the process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Send SIGKILL immediately, to the whole process group when possible.
    pub fn kill(&self) -> Result<(), ProcessError> {
        #[cfg(unix)]
        if signal_group(self.pid, libc::SIGKILL).is_ok() {
            return Ok(());
        }
        let mut child = self.child.lock().unwrap();
        child
            .kill()
            .map_err(|e| ProcessError::KillFailed(e.to_string()))
    }

    /// Graceful cancellation: SIGTERM to the process group, wait up to
    /// `grace`, then SIGKILL anything still running.
    pub fn terminate(&self, grace: Duration) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            if signal_group(self.pid, libc::SIGTERM).is_err() {
                // Group signalling unavailable; fall back to the top process.
                let ret = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
                if ret != 0 {
                    return self.kill();
                }
            }
        }
        #[cfg(not(unix))]
        {
            return self.kill();
        }

        let deadline = Instant::now() + grace;
        while self.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        if self.is_running() {
            self.kill()?;
        }
        Ok(())
    }
}

/// Signal every process in the group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::killpg(pid as libc::pid_t, sig) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Run a command to completion, streaming events into ring buffers.
///
/// The deadline in `config.timeout` is enforced against the event stream;
/// on expiry the process group is killed and [`ProcessError::Timeout`] is
/// returned with the elapsed time.
pub fn run_to_completion(config: &ProcessConfig) -> Result<CompletedProcess, ProcessError> {
    let started = Instant::now();
    let (handle, rx) = ProcessHandle::spawn(config)?;

    let mut stdout = OutputBuffer::new();
    let mut stderr = OutputBuffer::new();

    loop {
        let event = match config.timeout {
            Some(timeout) => {
                let remaining = timeout
                    .checked_sub(started.elapsed())
                    .unwrap_or(Duration::ZERO);
                match rx.recv_timeout(remaining) {
                    Ok(event) => event,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        let _ = handle.kill();
                        // Drain the channel so reader/monitor threads finish.
                        for _ in rx {}
                        return Err(ProcessError::Timeout {
                            op: config.command.clone(),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        match event {
            ProcessEvent::Started { .. } => {}
            ProcessEvent::OutputLine { line, is_stderr } => {
                if is_stderr {
                    stderr.push(line);
                } else {
                    stdout.push(line);
                }
            }
            ProcessEvent::Completed { exit_code } => {
                let truncated = stdout.dropped() > 0 || stderr.dropped() > 0;
                return Ok(CompletedProcess {
                    exit_code,
                    success: exit_code == 0,
                    stdout: stdout.to_text(),
                    stderr: stderr.to_text(),
                    truncated,
                });
            }
            ProcessEvent::Failed { error } => {
                return Err(ProcessError::SpawnFailed(error));
            }
        }
    }

    // Channel closed without a terminal event; treat as a monitoring failure.
    Err(ProcessError::SpawnFailed(
        "process event channel closed unexpectedly".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workdir() -> PathBuf {
        std::env::current_dir().unwrap()
    }

    fn config(command: &str) -> ProcessConfig {
        ProcessConfig::new(command, workdir())
    }

    fn collect_events(rx: mpsc::Receiver<ProcessEvent>) -> Vec<ProcessEvent> {
        rx.into_iter().collect()
    }

    #[test]
    fn spawn_echo_captures_stdout() {
        let (handle, rx) = ProcessHandle::spawn(&config("echo hello")).unwrap();
        let events = collect_events(rx);

        assert!(handle.pid() > 0);
        assert!(matches!(events[0], ProcessEvent::Started { .. }));

        let output_lines: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProcessEvent::OutputLine { .. }))
            .collect();
        assert_eq!(output_lines.len(), 1);
        match &output_lines[0] {
            ProcessEvent::OutputLine { line, is_stderr } => {
                assert_eq!(line, "hello");
                assert!(!is_stderr);
            }
            _ => panic!("expected OutputLine"),
        }

        match events.last().unwrap() {
            ProcessEvent::Completed { exit_code } => assert_eq!(*exit_code, 0),
            other => panic!("expected Completed, got: {other:?}"),
        }
    }

    #[test]
    fn spawn_stderr_capture() {
        let (_, rx) = ProcessHandle::spawn(&config("echo error_text >&2")).unwrap();
        let events = collect_events(rx);

        let stderr_lines: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProcessEvent::OutputLine { is_stderr: true, .. }))
            .collect();
        assert_eq!(stderr_lines.len(), 1);
    }

    #[test]
    fn nonzero_exit_code() {
        let (_, rx) = ProcessHandle::spawn(&config("exit 42")).unwrap();
        let events = collect_events(rx);

        match events.last().unwrap() {
            ProcessEvent::Completed { exit_code } => assert_eq!(*exit_code, 42),
            other => panic!("expected Completed, got: {other:?}"),
        }
    }

    #[test]
    fn spawn_failure_invalid_workdir() {
        let result = ProcessHandle::spawn(&ProcessConfig::new(
            "echo hello",
            "/nonexistent/path/that/does/not/exist/12345",
        ));

        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ProcessError::SpawnFailed(_)));
    }

    #[test]
    fn run_to_completion_captures_both_streams() {
        let result = run_to_completion(&config("echo out; echo err >&2; exit 3")).unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert!(result.stdout.contains("out"));
        assert!(result.stderr.contains("err"));
        assert!(!result.truncated);
    }

    #[test]
    fn run_to_completion_applies_env_overrides() {
        let mut env = HashMap::new();
        env.insert("GRAFT_TEST_VALUE".to_string(), "grafted".to_string());
        let cfg = config("echo $GRAFT_TEST_VALUE").with_env(env);

        let result = run_to_completion(&cfg).unwrap();
        assert!(result.stdout.contains("grafted"));
    }

    #[test]
    fn run_to_completion_times_out() {
        let cfg = config("sleep 10").with_timeout(Duration::from_millis(200));

        let started = Instant::now();
        let result = run_to_completion(&cfg);
        let elapsed = started.elapsed();

        match result {
            Err(ProcessError::Timeout { elapsed_ms, .. }) => {
                assert!(elapsed_ms >= 200);
            }
            other => panic!("expected Timeout, got: {other:?}"),
        }
        // Enforced within 100ms tolerance of the configured value (plus
        // thread teardown slack).
        assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    }

    #[test]
    fn kill_long_running_process() {
        let (handle, rx) = ProcessHandle::spawn(&config("sleep 60")).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(handle.is_running());

        handle.kill().unwrap();

        let events = collect_events(rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProcessEvent::Completed { .. })));
        assert!(!handle.is_running());
    }

    #[test]
    fn terminate_reaps_children_within_grace() {
        // The sh -c child spawns its own grandchild; group kill must reach it.
        let (handle, rx) = ProcessHandle::spawn(&config("sleep 60 & wait")).unwrap();
        thread::sleep(Duration::from_millis(50));

        handle.terminate(Duration::from_secs(2)).unwrap();
        let _ = collect_events(rx);
        assert!(!handle.is_running());
    }

    #[test]
    fn output_buffer_truncates_with_marker() {
        let mut buffer = OutputBuffer::new();
        for i in 0..(MAX_BUFFERED_LINES + 25) {
            buffer.push(format!("line {i}"));
        }

        assert_eq!(buffer.dropped(), 25);
        let text = buffer.to_text();
        assert!(text.starts_with("[... 25 earlier lines truncated ...]"));
        assert!(text.contains(&format!("line {}", MAX_BUFFERED_LINES + 24)));
        assert!(!text.contains("line 24\n"));
    }
}
