//! Single-job terminal command engine.
//!
//! One command runs at a time. `start` returns as soon as the shell has been
//! handed off to a background task; stdout and stderr are pumped line by
//! line into an [`OutputQueue`] that `poll` drains. The engine also keeps a
//! virtual working directory, changed by `cd` and confined to the sandbox
//! root.

use crate::error::{Result, ServiceError};
use crate::output_queue::{OutputQueue, Stream};
use crate::sandbox;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// How long output readers may linger once the command has been killed.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Interpreter used to run command lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shell {
    pub program: &'static str,
    pub flag: &'static str,
}

impl Shell {
    /// The platform shell, if this platform has one we know how to drive.
    pub fn detect() -> Option<Shell> {
        if cfg!(windows) {
            Some(Shell {
                program: "cmd.exe",
                flag: "/C",
            })
        } else if cfg!(unix) {
            Some(Shell {
                program: "/bin/bash",
                flag: "-c",
            })
        } else {
            None
        }
    }
}

/// What a successful `start` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A process was launched in the background.
    Started,
    /// A `cd` was handled in place; carries the new virtual directory.
    DirectoryChanged(String),
}

/// Result of one `poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSnapshot {
    pub out: String,
    pub err: String,
    pub running: bool,
    pub path: String,
}

pub struct TerminalEngine {
    root: PathBuf,
    current_dir: RwLock<String>,
    running: AtomicBool,
    queue: Arc<OutputQueue>,
    timeout: Duration,
    shell: Option<Shell>,
}

impl TerminalEngine {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::with_shell(root, timeout, Shell::detect())
    }

    pub fn with_shell(root: impl Into<PathBuf>, timeout: Duration, shell: Option<Shell>) -> Self {
        Self {
            root: root.into(),
            current_dir: RwLock::new(".".to_string()),
            running: AtomicBool::new(false),
            queue: Arc::new(OutputQueue::new()),
            timeout,
            shell,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Virtual working directory relative to the root (`.` for the root).
    pub fn current_dir(&self) -> String {
        self.current_dir
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_current_dir(&self, dir: String) {
        *self
            .current_dir
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = dir;
    }

    /// Start `command`, or change directory if it is a `cd`.
    pub fn start(self: &Arc<Self>, command: &str) -> Result<StartOutcome> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ServiceError::validation("missing cmd"));
        }
        if self.is_running() {
            return Err(ServiceError::AlreadyRunning);
        }
        if let Some(target) = cd_target(command) {
            return self.change_dir(target).map(StartOutcome::DirectoryChanged);
        }

        let shell = self.shell.clone().ok_or(ServiceError::UnsupportedOs)?;
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServiceError::AlreadyRunning);
        }
        self.queue.clear();

        info!(command, cwd = %self.current_dir(), "Command started");
        let engine = Arc::clone(self);
        let command = command.to_string();
        tokio::spawn(async move { engine.execute(shell, command).await });
        Ok(StartOutcome::Started)
    }

    /// Drain all pending output and report the current state.
    pub fn poll(&self) -> PollSnapshot {
        // Read the flag before draining: once it reads false, every line of
        // the finished command is already queued.
        let running = self.is_running();
        let drained = self.queue.drain();
        PollSnapshot {
            out: drained.out,
            err: drained.err,
            running,
            path: self.current_dir(),
        }
    }

    fn change_dir(&self, target: &str) -> Result<String> {
        if target.is_empty() || target == "~" {
            self.set_current_dir(".".to_string());
            return Ok(".".to_string());
        }
        let requested = Path::new(&self.current_dir()).join(target);
        let resolved = sandbox::resolve(&self.root, &requested)?;
        if !resolved.is_dir() {
            return Err(ServiceError::DirectoryNotFound(target.to_string()));
        }
        let dir = sandbox::relative_display(&self.root, &resolved);
        debug!(dir = %dir, "Directory changed");
        self.set_current_dir(dir.clone());
        Ok(dir)
    }

    async fn execute(self: Arc<Self>, shell: Shell, command: String) {
        let _idle = IdleOnDrop(&self.running);
        if let Err(e) = self.run_to_completion(&shell, &command).await {
            warn!(command = %command, "Run command failed: {}", e);
            self.queue.push(Stream::Err, format!("Run command failed: {e}"));
        }
    }

    async fn run_to_completion(&self, shell: &Shell, command: &str) -> std::io::Result<()> {
        let cwd = self.root.join(self.current_dir());
        let mut cmd = Command::new(shell.program);
        cmd.arg(shell.flag)
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pgid = child.id();
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(stdout, Stream::Out, Arc::clone(&self.queue))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(stderr, Stream::Err, Arc::clone(&self.queue))));
        }

        let deadline = Instant::now() + self.timeout;
        let waited = timeout_at(deadline, child.wait()).await;
        let mut timed_out = waited.is_err();
        if timed_out {
            kill_tree(&mut child, pgid).await;
        }

        // Background jobs can hold the pipes open after the shell exits.
        // Those still in the shell's group die with it; anything that left
        // the group gets a short grace period before its readers are aborted.
        let join_deadline = if timed_out {
            Instant::now() + READER_GRACE
        } else {
            deadline
        };
        if !join_readers(&mut readers, join_deadline).await {
            if !timed_out {
                timed_out = true;
                kill_tree(&mut child, pgid).await;
                join_readers(&mut readers, Instant::now() + READER_GRACE).await;
            }
            debug!(count = readers.len(), "aborting output readers held open past the deadline");
            for reader in &readers {
                reader.abort();
            }
            // A cancelled reader pushes nothing more, so the timeout entry stays last.
            for reader in readers.drain(..) {
                let _ = reader.await;
            }
        }

        if timed_out {
            warn!(command, timeout_ms = self.timeout.as_millis() as u64, "Command timed out");
            self.queue.push(
                Stream::Err,
                format!("Command timed out after {}", describe(self.timeout)),
            );
            return Ok(());
        }

        match waited {
            Ok(Ok(status)) => {
                info!(command, ?status, "Command finished");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(()),
        }
    }
}

/// Clears the running flag when the job ends, however it ends.
struct IdleOnDrop<'a>(&'a AtomicBool);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn cd_target(command: &str) -> Option<&str> {
    if command == "cd" {
        return Some("");
    }
    command.strip_prefix("cd ").map(str::trim)
}

async fn pump_lines<R>(reader: R, stream: Stream, queue: Arc<OutputQueue>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                queue.push(stream, String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                debug!(?stream, "output reader stopped: {}", e);
                break;
            }
        }
    }
}

/// Await readers in turn until `deadline`. Finished handles are removed, so
/// the ones left over can still be aborted. Returns true when all finished.
async fn join_readers(readers: &mut Vec<JoinHandle<()>>, deadline: Instant) -> bool {
    while let Some(reader) = readers.last_mut() {
        if timeout_at(deadline, reader).await.is_err() {
            return false;
        }
        readers.pop();
    }
    true
}

/// SIGKILL the whole process group led by the shell, then the shell itself.
async fn kill_tree(child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pgid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, "killpg failed: {}", e);
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
    if let Err(e) = child.kill().await {
        debug!("kill failed: {}", e);
    }
}

fn describe(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 {
        format!("{} seconds", timeout.as_secs())
    } else {
        format!("{} ms", timeout.as_millis())
    }
}
