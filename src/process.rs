// --- Transcoder process handle ----------------------------------------------
//
// One `ProcessHandle` per played item. Spawning hands the `Child` to a small
// supervising task which is the only place that ever waits on or signals the
// child; everybody else talks to it through two tokens (graceful stop, forced
// kill) and observes a one-shot completion value on a watch channel.
//
//   spawn ──► supervise task ──► child.wait()
//                 ▲   ▲               │
//        cancel ──┘   └── kill        ▼
//      (SIGTERM)       (SIGKILL)   done: Some(Exit)
//
// The stderr reader (if capture is enabled) is joined before `done` is
// published, so it never outlives the process it reads from.

use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SpawnError;
use crate::item::Item;
use crate::sink::OutputSink;

/// Default wait between the stop request and a forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// How long the stderr reader may linger after the child has been reaped.
/// A grandchild that inherited the pipe would otherwise keep it open.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Turns an [`Item`] into a ready-to-spawn command.
///
/// Stdio is configured by [`ProcessHandle::spawn`]; implementations only set
/// the program and its arguments.
pub trait Launcher: Send + Sync + 'static {
    fn command(&self, item: &Item) -> Command;

    /// The program being launched, used to report a missing binary.
    fn program(&self) -> Option<&Path> {
        None
    }
}

/// How a child process ended.
#[derive(Debug, Clone)]
pub enum Exit {
    /// Exited on its own.
    Finished(ExitStatus),
    /// Ended because a stop was requested. `forced` means the grace period
    /// ran out and the child was killed.
    Stopped { forced: bool },
    WaitFailed(String),
}

impl Exit {
    /// True for a natural exit with a non-zero status, or a failed wait.
    pub fn is_failure(&self) -> bool {
        match self {
            Exit::Finished(status) => !status.success(),
            Exit::Stopped { .. } => false,
            Exit::WaitFailed(_) => true,
        }
    }

    pub fn was_stopped(&self) -> bool {
        matches!(self, Exit::Stopped { .. })
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Finished(status) => write!(f, "exited ({status})"),
            Exit::Stopped { forced: false } => write!(f, "stopped"),
            Exit::Stopped { forced: true } => write!(f, "killed after grace period"),
            Exit::WaitFailed(e) => write!(f, "wait failed: {e}"),
        }
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    path: String,
    pid: Option<u32>,
    cancel: CancellationToken,
    kill: CancellationToken,
    done: watch::Receiver<Option<Exit>>,
    // Serializes concurrent stop() calls so only the first one can escalate.
    stop_lock: tokio::sync::Mutex<()>,
}

impl ProcessHandle {
    /// Start the child for `item`.
    ///
    /// With `sink` set, the child's stderr is drained into it chunk by chunk,
    /// tagged with the item's path; otherwise stderr is discarded.
    pub fn spawn(
        launcher: &dyn Launcher,
        item: &Item,
        sink: Option<Arc<OutputSink>>,
    ) -> Result<Self, SpawnError> {
        let mut cmd = launcher.command(item);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(if sink.is_some() { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match SpawnError::from(e) {
            SpawnError::BinaryNotFound(_) => SpawnError::BinaryNotFound(
                launcher.program().map(Path::to_path_buf).unwrap_or_default(),
            ),
            other => other,
        })?;

        let reader = match sink {
            Some(sink) => {
                // Dropping `child` here kills it (kill_on_drop).
                let stderr = child.stderr.take().ok_or(SpawnError::PipeUnavailable)?;
                Some(tokio::spawn(drain_stderr(stderr, item.path.clone(), sink)))
            }
            None => None,
        };

        let pid = child.id();
        let cancel = CancellationToken::new();
        let kill = CancellationToken::new();
        let (done_tx, done) = watch::channel(None);

        tokio::spawn(supervise(
            child,
            item.path.clone(),
            cancel.clone(),
            kill.clone(),
            reader,
            done_tx,
        ));

        Ok(Self {
            path: item.path.clone(),
            pid,
            cancel,
            kill,
            done,
            stop_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.done.borrow().is_none()
    }

    /// The exit, if the child has already been reaped.
    pub fn try_exit(&self) -> Option<Exit> {
        self.done.borrow().clone()
    }

    /// Wait for the child to end, however that happens.
    pub async fn wait(&self) -> Exit {
        let mut rx = self.done.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit)
                .clone()
                .unwrap_or_else(|| Exit::WaitFailed("no exit recorded".into())),
            Err(_) => Exit::WaitFailed("process supervisor went away".into()),
        };
        exit
    }

    /// Ask the child to stop, escalating to a kill after `grace`.
    ///
    /// Idempotent: once the child is gone this returns the recorded exit. A
    /// second concurrent caller waits for the first and observes the same
    /// exit instead of signalling again.
    pub async fn stop(&self, grace: Duration) -> Exit {
        let _serial = self.stop_lock.lock().await;
        if let Some(exit) = self.try_exit() {
            return exit;
        }

        self.cancel.cancel();
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(path = %self.path, ?grace, "transcoder ignored stop, killing");
                self.kill.cancel();
                self.wait().await
            }
        }
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Terminate,
    Kill,
}

async fn supervise(
    mut child: Child,
    path: String,
    cancel: CancellationToken,
    kill: CancellationToken,
    reader: Option<JoinHandle<()>>,
    done_tx: watch::Sender<Option<Exit>>,
) {
    let mut term_sent = false;
    let mut kill_sent = false;

    let res = loop {
        let wake = tokio::select! {
            res = child.wait() => Wake::Exited(res),
            _ = cancel.cancelled(), if !term_sent => Wake::Terminate,
            _ = kill.cancelled(), if !kill_sent => Wake::Kill,
        };
        match wake {
            Wake::Exited(res) => break res,
            Wake::Terminate => {
                term_sent = true;
                request_terminate(&mut child);
            }
            Wake::Kill => {
                kill_sent = true;
                if let Err(e) = child.start_kill() {
                    warn!(%path, "kill failed: {e}");
                }
            }
        }
    };

    if let Some(mut reader) = reader {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    let exit = if kill_sent {
        Exit::Stopped { forced: true }
    } else if term_sent {
        Exit::Stopped { forced: false }
    } else {
        match res {
            Ok(status) => Exit::Finished(status),
            Err(e) => Exit::WaitFailed(e.to_string()),
        }
    };
    debug!(%path, %exit, "transcoder reaped");
    done_tx.send_replace(Some(exit));
}

/// Polite stop: SIGTERM lets ffmpeg flush and close the ingest connection.
#[cfg(unix)]
fn request_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // id() is None once reaped, so the pid cannot have been recycled.
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, "SIGTERM failed: {e}");
        }
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

async fn drain_stderr(mut stderr: ChildStderr, path: String, sink: Arc<OutputSink>) {
    // Raw chunks rather than lines: ffmpeg's -stats progress is '\r'-separated.
    let mut buf = [0u8; 1024];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let ready = take_complete_utf8(&mut pending);
                if !ready.is_empty() {
                    sink.push_chunk(&path, &ready);
                }
            }
            Err(e) => {
                warn!(%path, "reading transcoder stderr failed: {e}");
                break;
            }
        }
    }
    if !pending.is_empty() {
        sink.push_chunk(&path, &pending);
    }
}

/// Split off everything but a trailing, incomplete UTF-8 sequence, which
/// stays in `pending` until the next read completes it.
fn take_complete_utf8(pending: &mut Vec<u8>) -> Vec<u8> {
    let keep_from = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        // Truncated sequence at the end.
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Genuinely invalid bytes; let the lossy decode deal with them.
        Err(_) => pending.len(),
    };
    let rest = pending.split_off(keep_from);
    std::mem::replace(pending, rest)
}
