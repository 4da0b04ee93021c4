//! Container process primitives
//!
//! The proxy only needs three things from the container it runs in: list the
//! processes, start one, and stop one. [`Sandbox`] is that seam;
//! [`LocalSandbox`] implements it with `tokio::process` for the case where
//! the proxy itself runs inside the container.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Lines of stdout/stderr retained per process for diagnostics
const LOG_TAIL_LINES: usize = 200;

/// Exited processes kept for status and log lookups; older ones are dropped
const MAX_EXITED_RETAINED: usize = 4;

/// Status of a process as reported by the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Still running
    Running,
    /// Exited with status 0
    Completed,
    /// Exited with a non-zero status
    Failed,
    /// Terminated by a signal or by `kill_process`
    Killed,
}

impl ProcessStatus {
    pub fn is_alive(&self) -> bool {
        *self == ProcessStatus::Running
    }
}

/// One row of the container's process table
#[derive(Debug, Clone, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command: String,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
}

/// Captured output of a process
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
}

impl ProcessLogs {
    /// Best single diagnostic: stderr when present, otherwise stdout
    pub fn diagnostic(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.clone()
        } else {
            self.stdout.clone()
        }
    }
}

/// What to launch
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// The command line as it appears in the process table
    pub fn command_line(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }

    /// Command line with the value after `--token` masked, for logs
    pub fn redacted_command_line(&self) -> String {
        let mut masked = Vec::with_capacity(self.args.len());
        let mut hide_next = false;
        for arg in &self.args {
            if hide_next {
                masked.push("***".to_string());
                hide_next = false;
            } else {
                hide_next = arg == "--token";
                masked.push(arg.clone());
            }
        }
        let mut words = vec![self.program.as_str()];
        words.extend(masked.iter().map(String::as_str));
        shell_words::join(words)
    }
}

/// Process primitives of the container the gateway lives in
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Snapshot of the process table
    async fn list_processes(&self) -> anyhow::Result<Vec<ProcessEntry>>;

    /// Launch a process and return its table entry
    async fn start_process(&self, spec: SpawnSpec) -> anyhow::Result<ProcessEntry>;

    /// Stop a process, escalating to a hard kill after the grace period
    async fn kill_process(&self, pid: u32, grace_period: Duration) -> anyhow::Result<()>;

    /// Captured output of a process
    async fn process_logs(&self, pid: u32) -> anyhow::Result<ProcessLogs>;
}

pub type SharedSandbox = Arc<dyn Sandbox>;

#[derive(Default)]
struct LogTail {
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
}

impl LogTail {
    fn push(lines: &mut VecDeque<String>, line: String) {
        if lines.len() == LOG_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> ProcessLogs {
        ProcessLogs {
            stdout: self.stdout.iter().cloned().collect::<Vec<_>>().join("\n"),
            stderr: self.stderr.iter().cloned().collect::<Vec<_>>().join("\n"),
        }
    }
}

struct ManagedProcess {
    child: Option<Child>,
    command: String,
    started_at: DateTime<Utc>,
    status: ProcessStatus,
    exit_code: Option<i32>,
    logs: Arc<Mutex<LogTail>>,
}

impl ManagedProcess {
    /// Refresh the cached status from the OS without blocking
    fn refresh(&mut self) {
        if !self.status.is_alive() {
            return;
        }
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = status.code();
                self.status = match status.code() {
                    Some(0) => ProcessStatus::Completed,
                    Some(_) => ProcessStatus::Failed,
                    None => ProcessStatus::Killed,
                };
                self.child = None;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(command = %self.command, error = %e, "Failed to poll process status");
            }
        }
    }

    fn entry(&self, pid: u32) -> ProcessEntry {
        ProcessEntry {
            pid,
            command: self.command.clone(),
            status: self.status,
            exit_code: self.exit_code,
            started_at: self.started_at,
        }
    }
}

/// Sandbox backed by processes spawned from this proxy
#[derive(Default)]
pub struct LocalSandbox {
    processes: DashMap<u32, Mutex<ManagedProcess>>,
}

impl LocalSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Forget the oldest exited processes once they have been reported.
    /// `entries` must be sorted oldest first.
    fn prune_exited(&self, entries: &[ProcessEntry]) {
        let exited: Vec<u32> = entries
            .iter()
            .filter(|e| !e.status.is_alive())
            .map(|e| e.pid)
            .collect();
        let excess = exited.len().saturating_sub(MAX_EXITED_RETAINED);
        for pid in &exited[..excess] {
            self.processes.remove(pid);
            debug!(pid, "Pruned exited process");
        }
    }
}

fn capture_lines<R>(reader: R, logs: Arc<Mutex<LogTail>>, pid: u32, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = if is_stderr { "stderr" } else { "stdout" };
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(pid, stream, "{}", line);
            let mut tail = logs.lock();
            if is_stderr {
                LogTail::push(&mut tail.stderr, line);
            } else {
                LogTail::push(&mut tail.stdout, line);
            }
        }
    });
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn list_processes(&self) -> anyhow::Result<Vec<ProcessEntry>> {
        let mut entries: Vec<ProcessEntry> = self
            .processes
            .iter()
            .map(|entry| {
                let mut process = entry.value().lock();
                process.refresh();
                process.entry(*entry.key())
            })
            .collect();
        entries.sort_by_key(|e| e.started_at);
        self.prune_exited(&entries);
        Ok(entries)
    }

    async fn start_process(&self, spec: SpawnSpec) -> anyhow::Result<ProcessEntry> {
        let command_line = spec.command_line();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn '{}': {}", spec.program, e))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Process '{}' exited before reporting a pid", spec.program))?;

        let logs = Arc::new(Mutex::new(LogTail::default()));
        if let Some(stdout) = child.stdout.take() {
            capture_lines(stdout, Arc::clone(&logs), pid, false);
        }
        if let Some(stderr) = child.stderr.take() {
            capture_lines(stderr, Arc::clone(&logs), pid, true);
        }

        let process = ManagedProcess {
            child: Some(child),
            command: command_line,
            started_at: Utc::now(),
            status: ProcessStatus::Running,
            exit_code: None,
            logs,
        };
        let entry = process.entry(pid);
        self.processes.insert(pid, Mutex::new(process));

        info!(pid, command = %spec.redacted_command_line(), "Process spawned");
        Ok(entry)
    }

    async fn kill_process(&self, pid: u32, grace_period: Duration) -> anyhow::Result<()> {
        let child = {
            let Some(entry) = self.processes.get(&pid) else {
                anyhow::bail!("Unknown process {}", pid);
            };
            let mut process = entry.lock();
            process.refresh();
            if !process.status.is_alive() {
                return Ok(());
            }
            process.status = ProcessStatus::Killed;
            process.child.take()
        };

        let Some(mut child) = child else {
            return Ok(());
        };

        info!(pid, "Sending SIGTERM to process");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        let exit_code = match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, ?status, "Process exited gracefully");
                status.code()
            }
            Ok(Err(e)) => {
                warn!(pid, error = %e, "Error waiting for process to exit");
                None
            }
            Err(_) => {
                warn!(
                    pid,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
                None
            }
        };

        if let Some(entry) = self.processes.get(&pid) {
            entry.lock().exit_code = exit_code;
        }
        Ok(())
    }

    async fn process_logs(&self, pid: u32) -> anyhow::Result<ProcessLogs> {
        let entry = self
            .processes
            .get(&pid)
            .ok_or_else(|| anyhow::anyhow!("Unknown process {}", pid))?;
        let logs = Arc::clone(&entry.lock().logs);
        let snapshot = logs.lock().snapshot();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_quotes_arguments() {
        let spec = SpawnSpec::new("agent").with_args(["gateway", "--name", "two words"]);
        assert_eq!(spec.command_line(), "agent gateway --name 'two words'");
    }

    #[test]
    fn test_redacted_command_line_masks_token() {
        let spec = SpawnSpec::new("agent").with_args(["gateway", "--token", "s3cret", "--port", "1"]);
        let redacted = spec.redacted_command_line();
        assert!(!redacted.contains("s3cret"));
        assert!(redacted.contains("--token '***'") || redacted.contains("--token ***"));
        assert!(redacted.contains("--port 1"));
    }

    #[test]
    fn test_log_tail_is_bounded() {
        let mut tail = LogTail::default();
        for i in 0..(LOG_TAIL_LINES + 5) {
            LogTail::push(&mut tail.stderr, format!("line {}", i));
        }
        assert_eq!(tail.stderr.len(), LOG_TAIL_LINES);
        assert_eq!(tail.stderr.front().map(String::as_str), Some("line 5"));
    }

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let logs = ProcessLogs {
            stdout: "booting".to_string(),
            stderr: "fatal: heap out of memory".to_string(),
        };
        assert_eq!(logs.diagnostic(), "fatal: heap out of memory");

        let logs = ProcessLogs {
            stdout: "booting".to_string(),
            stderr: "  ".to_string(),
        };
        assert_eq!(logs.diagnostic(), "booting");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_list_and_kill() {
        let sandbox = LocalSandbox::new();
        let entry = sandbox
            .start_process(SpawnSpec::new("sleep").with_args(["60"]))
            .await
            .unwrap();
        assert_eq!(entry.status, ProcessStatus::Running);
        assert_eq!(entry.command, "sleep 60");

        let listed = sandbox.list_processes().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].status.is_alive());

        sandbox
            .kill_process(entry.pid, Duration::from_secs(1))
            .await
            .unwrap();

        let listed = sandbox.list_processes().await.unwrap();
        assert_eq!(listed[0].status, ProcessStatus::Killed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_and_logs() {
        let sandbox = LocalSandbox::new();
        let entry = sandbox
            .start_process(SpawnSpec::new("sh").with_args(["-c", "echo out; echo boom >&2; exit 3"]))
            .await
            .unwrap();

        let mut status = ProcessStatus::Running;
        for _ in 0..100 {
            let listed = sandbox.list_processes().await.unwrap();
            status = listed[0].status;
            if !status.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, ProcessStatus::Failed);

        // Output readers run on their own tasks
        tokio::time::sleep(Duration::from_millis(100)).await;
        let logs = sandbox.process_logs(entry.pid).await.unwrap();
        assert_eq!(logs.stdout, "out");
        assert_eq!(logs.stderr, "boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_processes_are_pruned() {
        let sandbox = LocalSandbox::new();
        let mut last = None;
        for i in 0..(MAX_EXITED_RETAINED + 3) {
            let entry = sandbox
                .start_process(SpawnSpec::new("sh").with_args(["-c", &format!("echo run {}", i)]))
                .await
                .unwrap();
            last = Some(entry.pid);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Nothing is pruned before the first listing reports the exits
        tokio::time::sleep(Duration::from_millis(500)).await;
        let reported = sandbox.list_processes().await.unwrap();
        assert_eq!(reported.len(), MAX_EXITED_RETAINED + 3);
        assert!(reported.iter().all(|e| !e.status.is_alive()));

        let listed = sandbox.list_processes().await.unwrap();
        assert_eq!(listed.len(), MAX_EXITED_RETAINED);
        assert_eq!(listed.last().map(|e| e.pid), last);
        assert!(sandbox.process_logs(last.unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn test_kill_unknown_process() {
        let sandbox = LocalSandbox::new();
        assert!(sandbox.kill_process(424242, Duration::from_millis(10)).await.is_err());
    }
}
