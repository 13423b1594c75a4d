//! Content-hash snapshots of a working directory.
//!
//! The tracker records SHA-256 hashes for every regular file under the root
//! before a run and diffs against a second walk afterwards. Changes outside
//! the root are invisible.

use crate::constants::TRACKER_SKIP_DIRS;
use crate::models::{FileChange, FileChangeKind};
use crate::{NightshiftError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

pub struct FileTracker {
    root: PathBuf,
    before: HashMap<String, String>,
}

impl FileTracker {
    /// Snapshot `root` and begin tracking.
    pub fn start(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| NightshiftError::StorageIo(format!("{}: {e}", root.display())))?;
        let before = snapshot(&root);
        debug!(root = %root.display(), files = before.len(), "tracker snapshot taken");
        Ok(Self { root, before })
    }

    /// Walk again and report what changed since [`FileTracker::start`].
    pub fn stop(self) -> Vec<FileChange> {
        let after = snapshot(&self.root);
        let mut changes = Vec::new();

        for (path, before_hash) in &self.before {
            match after.get(path) {
                None => changes.push(FileChange {
                    path: path.clone(),
                    kind: FileChangeKind::Deleted,
                    before_hash: Some(before_hash.clone()),
                    after_hash: None,
                }),
                Some(after_hash) if after_hash != before_hash => changes.push(FileChange {
                    path: path.clone(),
                    kind: FileChangeKind::Modified,
                    before_hash: Some(before_hash.clone()),
                    after_hash: Some(after_hash.clone()),
                }),
                Some(_) => {}
            }
        }
        for (path, after_hash) in &after {
            if !self.before.contains_key(path) {
                changes.push(FileChange {
                    path: path.clone(),
                    kind: FileChangeKind::Created,
                    before_hash: None,
                    after_hash: Some(after_hash.clone()),
                });
            }
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }
}

fn keep_entry(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') && entry.depth() > 0 {
        return false;
    }
    if entry.file_type().is_dir() && TRACKER_SKIP_DIRS.contains(&name.as_ref()) {
        return false;
    }
    true
}

/// Map of root-relative path -> content hash for every regular file.
fn snapshot(root: &Path) -> HashMap<String, String> {
    let mut files = HashMap::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(keep_entry);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("tracker skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        match hash_file(entry.path()) {
            Ok(hash) => {
                files.insert(relative.to_string_lossy().into_owned(), hash);
            }
            Err(e) => debug!(path = %entry.path().display(), "tracker skipping file: {e}"),
        }
    }
    files
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn no_changes_yields_empty_diff() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("stable.txt"), "unchanging").unwrap();
        let tracker = FileTracker::start(dir.path()).unwrap();
        assert!(tracker.stop().is_empty());
    }

    #[test]
    fn create_modify_delete_detected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), "same").unwrap();
        fs::write(dir.path().join("edit.txt"), "v1").unwrap();
        fs::write(dir.path().join("gone.txt"), "bye").unwrap();

        let tracker = FileTracker::start(dir.path()).unwrap();
        fs::write(dir.path().join("haiku.md"), "Twilight falls softly").unwrap();
        fs::write(dir.path().join("edit.txt"), "v2").unwrap();
        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        let changes = tracker.stop();

        assert_eq!(changes.len(), 3);
        let find = |p: &str| changes.iter().find(|c| c.path == p).unwrap();
        assert_eq!(find("haiku.md").kind, FileChangeKind::Created);
        assert!(find("haiku.md").before_hash.is_none());
        assert_eq!(find("edit.txt").kind, FileChangeKind::Modified);
        assert_ne!(find("edit.txt").before_hash, find("edit.txt").after_hash);
        assert_eq!(find("gone.txt").kind, FileChangeKind::Deleted);
        assert!(find("gone.txt").after_hash.is_none());
    }

    #[test]
    fn deleted_after_fresh_snapshot() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f.txt"), "data").unwrap();
        let tracker = FileTracker::start(dir.path()).unwrap();
        fs::remove_file(dir.path().join("f.txt")).unwrap();
        let changes = tracker.stop();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, FileChangeKind::Deleted);
        assert_eq!(changes[0].path, "f.txt");
    }

    #[test]
    fn hidden_and_dependency_dirs_skipped() {
        let dir = TempDir::new().unwrap();
        let tracker = FileTracker::start(dir.path()).unwrap();

        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::write(dir.path().join(".hidden"), "dotfile").unwrap();
        fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("__pycache__/mod.pyc"), "bytecode").unwrap();
        fs::write(dir.path().join("visible.txt"), "seen").unwrap();

        let changes = tracker.stop();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "visible.txt");
    }

    #[test]
    fn changes_outside_root_invisible() {
        let outer = TempDir::new().unwrap();
        let inner = outer.path().join("tracked");
        fs::create_dir_all(&inner).unwrap();
        let tracker = FileTracker::start(&inner).unwrap();
        fs::write(outer.path().join("outside.txt"), "elsewhere").unwrap();
        assert!(tracker.stop().is_empty());
    }
}
