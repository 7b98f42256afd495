// --- Filesystem watcher -----------------------------------------------------
//
// Follows the directory inputs so that dropping a file into a watched folder
// queues it, and deleting one takes it out of rotation. notify delivers
// events on its own thread; we forward them over a channel and apply them to
// the supervisor from a tokio task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::item::is_supported_video;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchChange {
    Created(String),
    Removed(String),
}

/// Map a notify event onto playlist changes.
pub fn changes_for(event: &Event) -> Vec<WatchChange> {
    let created = |p: &PathBuf| {
        (is_supported_video(p) && !p.is_dir()).then(|| WatchChange::Created(p.to_string_lossy().to_string()))
    };
    let removed = |p: &PathBuf| Some(WatchChange::Removed(p.to_string_lossy().to_string()));

    match &event.kind {
        EventKind::Create(_) => event.paths.iter().filter_map(created).collect(),
        EventKind::Remove(_) => event.paths.iter().filter_map(removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().filter_map(removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().filter_map(created).collect()
        }
        // [from, to] in a single event.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            removed(&event.paths[0])
                .into_iter()
                .chain(created(&event.paths[1]))
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Keeps the notify watcher alive; dropping it stops watching.
pub struct DirWatcher {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl DirWatcher {
    /// Watch `dirs` recursively and apply changes to `sup`.
    pub fn start(dirs: &[PathBuf], sup: Arc<Supervisor>) -> anyhow::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WatchChange>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for change in changes_for(&event) {
                        if tx.send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!("watcher error: {e}"),
            },
            Config::default(),
        )?;

        for dir in dirs {
            watcher.watch(dir, RecursiveMode::Recursive)?;
            info!("watching dir: {}", dir.display());
        }

        let task = tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                apply(&sup, change).await;
            }
            debug!("watcher channel closed");
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn apply(sup: &Supervisor, change: WatchChange) {
    match change {
        WatchChange::Created(path) => {
            // Editors and copy tools can report the same file twice.
            if sup.playlist_snapshot().iter().any(|i| i.path == path) {
                debug!(%path, "already in playlist");
                return;
            }
            info!(%path, "new video added");
            sup.add(path);
        }
        WatchChange::Removed(path) => {
            if sup.remove(&path).await {
                info!(%path, "video removed");
            } else if !Path::new(&path).exists() {
                debug!(%path, "removed file was not in playlist");
            } else {
                warn!(%path, "remove event for a file that still exists");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use crate::process::Launcher;
    use crate::supervisor::{PlaybackEvent, SupervisorOptions};
    use notify::event::{CreateKind, RemoveKind};
    use std::time::Duration;
    use tokio::process::Command;

    /// Every item is a long-running shell.
    struct SleepLauncher;

    impl Launcher for SleepLauncher {
        fn command(&self, _item: &Item) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("exec sleep 30");
            cmd
        }
    }

    async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<PlaybackEvent>) -> PlaybackEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for playback event")
            .expect("event channel closed")
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut ev = Event::new(kind);
        for p in paths {
            ev = ev.add_path(PathBuf::from(p));
        }
        ev
    }

    #[test]
    fn create_of_supported_file_becomes_add() {
        let ev = event(EventKind::Create(CreateKind::File), &["/nowhere/new.mp4", "/nowhere/notes.txt"]);
        assert_eq!(changes_for(&ev), [WatchChange::Created("/nowhere/new.mp4".into())]);
    }

    #[test]
    fn remove_is_forwarded_regardless_of_extension() {
        let ev = event(EventKind::Remove(RemoveKind::Any), &["/nowhere/old.mkv"]);
        assert_eq!(changes_for(&ev), [WatchChange::Removed("/nowhere/old.mkv".into())]);
    }

    #[test]
    fn rename_both_is_remove_then_create() {
        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/nowhere/a.mp4", "/nowhere/b.mp4"],
        );
        assert_eq!(
            changes_for(&ev),
            [
                WatchChange::Removed("/nowhere/a.mp4".into()),
                WatchChange::Created("/nowhere/b.mp4".into()),
            ]
        );
    }

    #[test]
    fn access_and_data_modifications_are_ignored() {
        let ev = event(EventKind::Modify(ModifyKind::Any), &["/nowhere/a.mp4"]);
        assert!(changes_for(&ev).is_empty());
    }

    #[tokio::test]
    async fn applied_changes_dedupe_creates_and_stop_a_removed_current_item() {
        let sup = Arc::new(Supervisor::new(
            vec![Item::new("/lib/a.mp4"), Item::new("/lib/b.mp4")],
            Arc::new(SleepLauncher),
            SupervisorOptions {
                grace_period: Duration::from_secs(2),
                ..SupervisorOptions::default()
            },
        ));
        let mut events = sup.subscribe();
        let play = tokio::spawn({
            let sup = sup.clone();
            async move { sup.stream().await }
        });
        assert!(matches!(
            next_event(&mut events).await,
            PlaybackEvent::Started { index: 0, ref path } if path == "/lib/a.mp4"
        ));

        apply(&sup, WatchChange::Created("/lib/c.mp4".into())).await;
        apply(&sup, WatchChange::Created("/lib/c.mp4".into())).await;
        assert_eq!(sup.playlist_paths(), ["/lib/a.mp4", "/lib/b.mp4", "/lib/c.mp4"]);

        // Deleting the playing file stops it; b.mp4 slides into index 0.
        apply(&sup, WatchChange::Removed("/lib/a.mp4".into())).await;
        assert!(matches!(
            next_event(&mut events).await,
            PlaybackEvent::Exited { ref path, ref exit, .. } if path == "/lib/a.mp4" && exit.was_stopped()
        ));
        assert!(matches!(
            next_event(&mut events).await,
            PlaybackEvent::Started { index: 0, ref path } if path == "/lib/b.mp4"
        ));
        assert_eq!(sup.playlist_paths(), ["/lib/b.mp4", "/lib/c.mp4"]);

        // Unknown paths are ignored.
        apply(&sup, WatchChange::Removed("/lib/zzz.mp4".into())).await;
        assert_eq!(sup.playlist_paths().len(), 2);

        sup.close().await;
        tokio::time::timeout(Duration::from_secs(5), play).await.unwrap().unwrap();
    }
}
