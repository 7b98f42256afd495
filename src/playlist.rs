use std::sync::RwLock;

use crate::item::Item;

/// Ordered, shared list of items.
///
/// Has its own lock, separate from playback state, so the watcher can add
/// and remove files while the play loop is busy with a child process. The
/// lock is never held across an `.await`.
#[derive(Debug, Default)]
pub struct Playlist {
    items: RwLock<Vec<Item>>,
}

impl Playlist {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    pub fn append(&self, item: Item) {
        self.write().push(item);
    }

    /// Remove the first item with `path`, returning its former position.
    pub fn remove(&self, path: &str) -> Option<usize> {
        let mut items = self.write();
        let pos = items.iter().position(|i| i.path == path)?;
        items.remove(pos);
        Some(pos)
    }

    pub fn get(&self, index: usize) -> Option<Item> {
        self.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.read().iter().any(|i| i.path == path)
    }

    /// Point-in-time copy for observers.
    pub fn snapshot(&self) -> Vec<Item> {
        self.read().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.read().iter().map(|i| i.path.clone()).collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Item>> {
        self.items.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Item>> {
        self.items.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(paths: &[&str]) -> Playlist {
        Playlist::new(paths.iter().map(|p| Item::new(*p)).collect())
    }

    #[test]
    fn remove_takes_first_match_only() {
        let pl = list(&["a", "b", "a"]);
        assert_eq!(pl.remove("a"), Some(0));
        assert_eq!(pl.paths(), ["b", "a"]);
        assert_eq!(pl.remove("zzz"), None);
        assert_eq!(pl.len(), 2);
    }

    #[test]
    fn snapshot_is_detached_from_later_mutations() {
        let pl = list(&["a", "b"]);
        let snap = pl.snapshot();
        pl.append(Item::new("c"));
        pl.remove("a");
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].path, "a");
        assert_eq!(pl.paths(), ["b", "c"]);
        assert!(pl.contains("c"));
        assert_eq!(pl.get(5), None);
    }

    #[test]
    fn emptied_playlist_reports_empty() {
        let pl = list(&["a"]);
        pl.remove("a");
        assert!(pl.is_empty());
        assert_eq!(pl.get(0), None);
    }
}
