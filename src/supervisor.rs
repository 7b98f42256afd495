// --- Playback supervisor ----------------------------------------------------
//
// Owns "what is playing now". One sequential loop (`stream`) drives
//
//   Idle ─► Starting ─► Running ─► Stopping ─► Transitioning ─┐
//    ▲                                                          │
//    └──────────────────────────────────────────────────────────┘
//
// and is the only place that spawns children. Control calls (next/prev/
// remove/close) arrive from the console, the watcher and websocket clients;
// they edit the index under the state lock, then stop the live child and
// wait for it to be gone. The loop notices the exit and re-evaluates.
//
// Locks:
//   - `state` (index, manual flag, revision, live handle)
//   - the playlist's own lock
// Order is always state → playlist, and neither is held across an `.await`.
//
// `revision` is bumped by every control call that changes which item should
// be playing. The loop captures it before spawning and re-checks it before
// publishing the new handle: if a control call slipped in between, the fresh
// child is torn down straight away instead of playing the wrong item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::item::Item;
use crate::playlist::Playlist;
use crate::process::{Exit, Launcher, ProcessHandle, DEFAULT_GRACE_PERIOD};
use crate::sink::OutputSink;

/// Lifecycle notifications published by the play loop.
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    Started { index: usize, path: String },
    Exited { index: usize, path: String, exit: Exit },
    SpawnFailed { index: usize, path: String, error: String },
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Time a child gets to exit after a stop request before it is killed.
    pub grace_period: Duration,
    /// Poll interval while the playlist is empty.
    pub idle_poll: Duration,
    pub backoff: Backoff,
    /// Capture the child's stderr into the output sink.
    pub capture_output: bool,
    pub output_buffer_bytes: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            idle_poll: Duration::from_secs(1),
            backoff: Backoff::default(),
            capture_output: true,
            output_buffer_bytes: 64 * 1024,
        }
    }
}

impl SupervisorOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            grace_period: cfg.supervisor.grace_period(),
            idle_poll: cfg.supervisor.idle_poll(),
            backoff: Backoff::from(&cfg.supervisor.backoff),
            capture_output: cfg.log.play_state,
            output_buffer_bytes: cfg.log.output_buffer_bytes,
        }
    }
}

#[derive(Debug, Default)]
struct PlayState {
    current_index: usize,
    /// The next transition was already applied by next/prev/remove.
    manual_advance: bool,
    revision: u64,
    process: Option<Arc<ProcessHandle>>,
}

pub struct Supervisor {
    playlist: Playlist,
    state: Mutex<PlayState>,
    launcher: Arc<dyn Launcher>,
    sink: Arc<OutputSink>,
    opts: SupervisorOptions,
    closed: CancellationToken,
    wake: Notify,
    events: broadcast::Sender<PlaybackEvent>,
    running: AtomicBool,
}

impl Supervisor {
    pub fn new(items: Vec<Item>, launcher: Arc<dyn Launcher>, opts: SupervisorOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            playlist: Playlist::new(items),
            state: Mutex::new(PlayState::default()),
            launcher,
            sink: Arc::new(OutputSink::new(opts.output_buffer_bytes)),
            opts,
            closed: CancellationToken::new(),
            wake: Notify::new(),
            events,
            running: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.opts
    }

    /// Run the play loop until [`Supervisor::close`] is called.
    ///
    /// Only one loop may run per supervisor; a second concurrent call logs a
    /// warning and returns straight away.
    pub async fn stream(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("play loop already running");
            return;
        }
        let mut failures: u32 = 0;

        while !self.closed.is_cancelled() {
            if failures > 0 {
                let delay = self.opts.backoff.delay(failures - 1);
                debug!(failures, ?delay, "backing off before next spawn");
                self.pause(delay).await;
                if self.closed.is_cancelled() {
                    break;
                }
            }

            // Idle
            let Some((index, item, revision)) = self.begin() else {
                self.pause(self.opts.idle_poll).await;
                continue;
            };

            // Starting
            let sink = self.opts.capture_output.then(|| self.sink.clone());
            let handle = match ProcessHandle::spawn(self.launcher.as_ref(), &item, sink) {
                Ok(h) => Arc::new(h),
                Err(e) => {
                    warn!(index, path = %item.path, kind = e.as_label(), "failed to start stream: {e}");
                    self.sink.push_line(&format!("failed to start stream {}: {e}", item.path));
                    self.publish(PlaybackEvent::SpawnFailed {
                        index,
                        path: item.path.clone(),
                        error: e.to_string(),
                    });
                    failures = failures.saturating_add(1);
                    self.transition();
                    continue;
                }
            };

            let raced = {
                let mut st = self.lock_state();
                if st.revision != revision || self.closed.is_cancelled() {
                    true
                } else {
                    st.process = Some(handle.clone());
                    false
                }
            };

            if raced {
                // Never announced: observers only see items that actually played.
                debug!(index, path = %item.path, "control request raced spawn, restarting");
                handle.stop(self.opts.grace_period).await;
                self.transition();
                continue;
            }

            info!(index, path = %item.path, pid = ?handle.pid(), "start stream");
            self.sink.push_line(&format!("start stream: {}", item.path));
            self.publish(PlaybackEvent::Started {
                index,
                path: item.path.clone(),
            });

            // Running / Stopping
            let exit = tokio::select! {
                exit = handle.wait() => exit,
                _ = self.closed.cancelled() => handle.stop(self.opts.grace_period).await,
            };

            {
                let mut st = self.lock_state();
                if st.process.as_ref().is_some_and(|p| Arc::ptr_eq(p, &handle)) {
                    st.process = None;
                }
            }

            if exit.is_failure() {
                warn!(index, path = %item.path, "stream failed: {exit}");
                failures = failures.saturating_add(1);
            } else {
                failures = 0;
            }
            if matches!(exit, Exit::Stopped { forced: true }) {
                warn!(index, path = %item.path, "transcoder had to be killed");
            }
            info!(index, path = %item.path, "stop stream: {exit}");
            self.sink.push_line(&format!("stop stream: {} ({exit})", item.path));
            self.publish(PlaybackEvent::Exited {
                index,
                path: item.path,
                exit,
            });

            // Transitioning
            self.transition();
        }

        info!("play loop closed");
        self.running.store(false, Ordering::Release);
    }

    /// Skip to the next item, waiting until the current child is gone.
    pub async fn next(&self) {
        self.step(true).await;
    }

    /// Go back one item (wrapping to the end), waiting until the current
    /// child is gone.
    pub async fn prev(&self) {
        self.step(false).await;
    }

    pub fn add(&self, path: impl Into<String>) {
        self.add_item(Item::new(path));
    }

    pub fn add_item(&self, item: Item) {
        info!(path = %item.path, "added to playlist");
        self.playlist.append(item);
        self.wake.notify_one();
    }

    /// Remove the first item with `path`. Removing the item that is playing
    /// stops it; playback resumes with whatever now sits at that index.
    ///
    /// Returns false if no such item exists.
    pub async fn remove(&self, path: &str) -> bool {
        let handle = {
            let mut st = self.lock_state();
            let Some(pos) = self.playlist.remove(path) else {
                return false;
            };
            let len = self.playlist.len();

            if pos < st.current_index {
                // Keep pointing at the same item.
                st.current_index -= 1;
                None
            } else if pos == st.current_index {
                if st.current_index >= len {
                    st.current_index = 0;
                }
                st.manual_advance = true;
                st.revision += 1;
                st.process.clone()
            } else {
                None
            }
        };
        info!(path, "removed from playlist");
        self.wake.notify_one();

        if let Some(h) = handle {
            h.stop(self.opts.grace_period).await;
        }
        true
    }

    /// Stop playback for good. The loop exits on its next check.
    pub async fn close(&self) {
        self.closed.cancel();
        self.wake.notify_one();
        let handle = self.lock_state().process.clone();
        if let Some(h) = handle {
            h.stop(self.opts.grace_period).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Supervisor::close`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    // --- Observers ---

    pub fn current_video_path(&self) -> Option<String> {
        let st = self.lock_state();
        self.playlist.get(st.current_index).map(|i| i.path)
    }

    pub fn current_index(&self) -> usize {
        self.lock_state().current_index
    }

    pub fn playlist_paths(&self) -> Vec<String> {
        self.playlist.paths()
    }

    pub fn playlist_snapshot(&self) -> Vec<Item> {
        self.playlist.snapshot()
    }

    pub fn recent_output(&self) -> String {
        self.sink.snapshot()
    }

    pub fn is_playing(&self) -> bool {
        self.lock_state()
            .process
            .as_ref()
            .is_some_and(|p| p.is_running())
    }

    // --- Internals ---

    /// Pick the item to start. Clears the manual flag: whatever moved the
    /// index has now been honoured.
    fn begin(&self) -> Option<(usize, Item, u64)> {
        let mut st = self.lock_state();
        let len = self.playlist.len();
        if len == 0 {
            st.current_index = 0;
            return None;
        }
        if st.current_index >= len {
            st.current_index = 0;
        }
        let item = self.playlist.get(st.current_index)?;
        st.manual_advance = false;
        Some((st.current_index, item, st.revision))
    }

    fn transition(&self) {
        let mut st = self.lock_state();
        let len = self.playlist.len();
        let manual = std::mem::take(&mut st.manual_advance);
        if len == 0 {
            st.current_index = 0;
        } else if manual {
            if st.current_index >= len {
                st.current_index = 0;
            }
        } else {
            st.current_index = (st.current_index + 1) % len;
        }
    }

    async fn step(&self, forward: bool) {
        let handle = {
            let mut st = self.lock_state();
            let len = self.playlist.len();
            if len == 0 || self.closed.is_cancelled() {
                return;
            }
            let cur = if st.current_index >= len { 0 } else { st.current_index };
            st.current_index = if forward {
                (cur + 1) % len
            } else if cur == 0 {
                len - 1
            } else {
                cur - 1
            };
            st.manual_advance = true;
            st.revision += 1;
            st.process.clone()
        };
        self.wake.notify_one();

        if let Some(h) = handle {
            h.stop(self.opts.grace_period).await;
        }
    }

    async fn pause(&self, d: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(d) => {}
            _ = self.wake.notified() => {}
            _ = self.closed.cancelled() => {}
        }
    }

    fn publish(&self, ev: PlaybackEvent) {
        // No subscribers is fine.
        let _ = self.events.send(ev);
    }

    fn lock_state(&self) -> MutexGuard<'_, PlayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("playlist", &self.playlist)
            .field("state", &self.state)
            .field("opts", &self.opts)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    struct NeverLauncher;

    impl Launcher for NeverLauncher {
        fn command(&self, _item: &Item) -> Command {
            Command::new("/nonexistent/transcoder")
        }
    }

    fn sup(paths: &[&str]) -> Supervisor {
        Supervisor::new(
            paths.iter().map(|p| Item::new(*p)).collect(),
            Arc::new(NeverLauncher),
            SupervisorOptions::default(),
        )
    }

    #[tokio::test]
    async fn next_wraps_modulo_len() {
        let s = sup(&["a", "b", "c"]);
        for _ in 0..7 {
            s.next().await;
        }
        assert_eq!(s.current_index(), 7 % 3);
        assert_eq!(s.current_video_path().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn prev_from_zero_goes_to_last() {
        let s = sup(&["a", "b", "c", "d"]);
        s.prev().await;
        assert_eq!(s.current_index(), 3);
        s.prev().await;
        assert_eq!(s.current_index(), 2);
    }

    #[tokio::test]
    async fn next_prev_on_empty_playlist_are_noops() {
        let s = sup(&[]);
        s.next().await;
        s.prev().await;
        assert_eq!(s.current_index(), 0);
        assert_eq!(s.current_video_path(), None);
        assert!(!s.remove("x").await);
    }

    #[tokio::test]
    async fn removing_before_current_keeps_the_same_item() {
        let s = sup(&["a", "b", "c"]);
        s.next().await;
        s.next().await;
        assert!(s.remove("a").await);
        assert_eq!(s.current_index(), 1);
        assert_eq!(s.current_video_path().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn removing_current_last_item_wraps_to_zero() {
        let s = sup(&["a", "b", "c"]);
        s.prev().await;
        assert!(s.remove("c").await);
        assert_eq!(s.current_index(), 0);
        assert!(s.remove("a").await);
        assert!(s.remove("b").await);
        assert_eq!(s.current_index(), 0);
        assert_eq!(s.current_video_path(), None);
    }

    #[tokio::test]
    async fn manual_step_is_not_applied_twice() {
        let s = sup(&["a", "b", "c"]);
        s.next().await;
        s.transition();
        assert_eq!(s.current_index(), 1);
        s.transition();
        assert_eq!(s.current_index(), 2);
    }

    #[tokio::test]
    async fn begin_clears_a_pending_manual_flag() {
        let s = sup(&["a", "b"]);
        s.next().await;
        let (index, item, _) = s.begin().unwrap();
        assert_eq!((index, item.path.as_str()), (1, "b"));
        // The step was consumed by starting "b"; finishing it advances.
        s.transition();
        assert_eq!(s.current_index(), 0);
    }

    #[tokio::test]
    async fn closed_supervisor_ignores_steps() {
        let s = sup(&["a", "b"]);
        s.close().await;
        assert!(s.is_closed());
        s.next().await;
        assert_eq!(s.current_index(), 0);
        // stream() returns immediately once closed.
        s.stream().await;
    }
}
