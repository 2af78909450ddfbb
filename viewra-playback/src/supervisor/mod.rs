//! External process lifecycles
//!
//! Spawns encoder/packager processes with captured output, parses their
//! progress stream, performs graceful-then-forced termination, and cleans
//! up orphans tagged by a previous run.

pub mod progress;

pub use progress::{EncoderProgress, ProgressParser};

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// Environment tag identifying our child processes; the orphan scan keys
/// off it after an unclean shutdown
pub const SESSION_TAG_ENV: &str = "VIEWRA_SESSION";

/// Lines of stderr retained for failure reports
const STDERR_TAIL_LINES: usize = 40;

/// What to launch and how to talk to it
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// Tags the child's environment for the orphan scan
    pub session_id: Option<Uuid>,
    /// Byte sequence that asks the program to finish gracefully when
    /// written to its stdin (ffmpeg: `q`)
    pub quit_sequence: Option<&'static [u8]>,
    /// Parse stdout as a key=value progress stream
    pub parse_progress: bool,
}

impl ProcessSpec {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            workdir: None,
            session_id: None,
            quit_sequence: None,
            parse_progress: false,
        }
    }
}

/// Spawns and terminates supervised processes. Stateless apart from the
/// grace period; handles own their children.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    grace: Duration,
}

impl ProcessSupervisor {
    #[must_use]
    pub const fn new(grace: Duration) -> Self {
        Self { grace }
    }

    #[must_use]
    pub const fn grace(&self) -> Duration {
        self.grace
    }

    /// Spawn with captured stdout/stderr. The child is killed if the handle
    /// is dropped without a reap.
    pub fn spawn(&self, spec: &ProcessSpec) -> Result<SupervisedProcess> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.workdir {
            command.current_dir(dir);
        }
        if let Some(id) = spec.session_id {
            command.env(SESSION_TAG_ENV, id.to_string());
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Internal(format!("failed to spawn {}: {e}", spec.program))
        })?;
        let pid = child.id();
        debug!(program = %spec.program, pid, "spawned process");

        let stdin = child.stdin.take();
        let (progress_tx, progress_rx) = watch::channel(None::<EncoderProgress>);

        let stdout_task = child.stdout.take().map(|stdout| {
            let parse = spec.parse_progress;
            tokio::spawn(async move {
                let mut parser = ProgressParser::new();
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if parse {
                        if let Some(report) = parser.feed_line(&line) {
                            let _ = progress_tx.send(Some(report));
                        }
                    }
                }
            })
        });

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        Ok(SupervisedProcess {
            child,
            stdin,
            pid,
            quit_sequence: spec.quit_sequence,
            progress_rx,
            stderr_tail,
            stdout_task,
            stderr_task,
        })
    }

    /// Graceful stop: quit sequence on stdin, then kill after the grace
    /// period. Returns the exit status.
    pub async fn stop(&self, process: &mut SupervisedProcess) -> Result<ExitStatus> {
        process.request_quit().await;
        match tokio::time::timeout(self.grace, process.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!(pid = process.pid, "grace period elapsed, killing process");
                process.child.start_kill()?;
                Ok(process.child.wait().await?)
            }
        }
    }

    /// Live processes tagged by this core: (pid, tag value). Linux-only
    /// scan; elsewhere `kill_on_drop` and session recovery cover restarts.
    #[must_use]
    pub fn scan_tagged(&self) -> Vec<(u32, String)> {
        scan_tagged_pids()
    }

    /// Forcibly kill one pid. Returns whether the kill was delivered.
    pub async fn kill_pid(&self, pid: u32) -> bool {
        let result = Command::new("kill")
            .args(["-KILL", &pid.to_string()])
            .output()
            .await;
        match result {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!(pid, error = %e, "failed to kill process");
                false
            }
        }
    }

    /// Startup sweep: kill every tagged process. Nothing of ours should be
    /// running before the manager starts.
    pub async fn kill_orphans(&self) -> u64 {
        let mut killed = 0u64;
        for (pid, tag) in self.scan_tagged() {
            warn!(pid, session = %tag, "killing orphaned transcode process");
            if self.kill_pid(pid).await {
                killed += 1;
            }
        }
        killed
    }
}

/// PIDs whose environment carries our session tag, with the tag value
fn scan_tagged_pids() -> Vec<(u32, String)> {
    let mut pids = Vec::new();
    let Ok(proc_entries) = std::fs::read_dir("/proc") else {
        return pids;
    };
    let own_pid = std::process::id();
    let needle = format!("{SESSION_TAG_ENV}=");
    for entry in proc_entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        // environ reads fail for other users' processes; skip those
        let Ok(environ) = std::fs::read(entry.path().join("environ")) else {
            continue;
        };
        let tag = environ
            .split(|b| *b == 0)
            .find(|var| var.starts_with(needle.as_bytes()))
            .map(|var| String::from_utf8_lossy(&var[needle.len()..]).to_string());
        if let Some(tag) = tag {
            pids.push((pid, tag));
        }
    }
    pids
}

/// A spawned child with captured output and progress
pub struct SupervisedProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    pub pid: Option<u32>,
    quit_sequence: Option<&'static [u8]>,
    progress_rx: watch::Receiver<Option<EncoderProgress>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl SupervisedProcess {
    /// Latest progress report, when the process spec requested parsing
    #[must_use]
    pub fn progress(&self) -> Option<EncoderProgress> {
        *self.progress_rx.borrow()
    }

    /// Subscribe to progress updates
    #[must_use]
    pub fn progress_watch(&self) -> watch::Receiver<Option<EncoderProgress>> {
        self.progress_rx.clone()
    }

    /// Last captured stderr lines, newline-joined
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock();
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Ask the program to finish; closing stdin doubles as EOF for
    /// programs without a quit command
    async fn request_quit(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Some(seq) = self.quit_sequence {
                let _ = stdin.write_all(seq).await;
                let _ = stdin.flush().await;
            }
            drop(stdin);
        }
    }

    /// Wait for exit and release all OS resources. Must be called on every
    /// path; `kill_on_drop` is only the backstop.
    pub async fn reap(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        // Let the readers drain buffered output before reporting
        if let Some(task) = self.stdout_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_spawn_and_reap_exit_code() {
        let spec = ProcessSpec::new("sh", vec!["-c".to_string(), "exit 3".to_string()]);
        let mut process = supervisor().spawn(&spec).expect("spawn");
        let status = process.reap().await.expect("reap");
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_stderr_tail_captured() {
        let spec = ProcessSpec::new(
            "sh",
            vec!["-c".to_string(), "echo oops-line >&2; exit 1".to_string()],
        );
        let mut process = supervisor().spawn(&spec).expect("spawn");
        let status = process.reap().await.expect("reap");
        assert!(!status.success());
        assert!(process.stderr_tail().contains("oops-line"));
    }

    #[tokio::test]
    async fn test_progress_stream_parsed() {
        let script = "printf 'out_time_us=5000000\\nprogress=continue\\nout_time_us=10000000\\nprogress=end\\n'";
        let mut spec = ProcessSpec::new("sh", vec!["-c".to_string(), script.to_string()]);
        spec.parse_progress = true;

        let mut process = supervisor().spawn(&spec).expect("spawn");
        process.reap().await.expect("reap");

        let report = process.progress().expect("progress report");
        assert!(report.finished);
        assert!((report.out_time_seconds - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stop_kills_stubborn_process() {
        // Ignores stdin EOF and must be killed after the grace period
        let spec = ProcessSpec::new("sh", vec!["-c".to_string(), "sleep 30".to_string()]);
        let sup = supervisor();
        let mut process = sup.spawn(&spec).expect("spawn");
        let status = sup.stop(&mut process).await.expect("stop");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_stop_respects_quit_sequence() {
        // `head -1` exits as soon as stdin delivers a line
        let mut spec = ProcessSpec::new(
            "sh",
            vec!["-c".to_string(), "head -1 > /dev/null".to_string()],
        );
        spec.quit_sequence = Some(b"q\n");
        let sup = supervisor();
        let mut process = sup.spawn(&spec).expect("spawn");
        let status = sup.stop(&mut process).await.expect("stop");
        assert!(status.success());
    }
}
