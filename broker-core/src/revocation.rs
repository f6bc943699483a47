//! Certificate revocation store (spec §4.F): a flat set of revoked
//! certificate hashes, appended to in memory and flushed to disk as a
//! whole on each maintenance tick.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub struct RevocationStore {
    revoked: BTreeSet<String>,
    pending: Vec<String>,
    path: Option<PathBuf>,
}

impl RevocationStore {
    pub fn new() -> Self {
        RevocationStore {
            revoked: BTreeSet::new(),
            pending: Vec::new(),
            path: None,
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        RevocationStore {
            revoked: BTreeSet::new(),
            pending: Vec::new(),
            path: Some(path.into()),
        }
    }

    pub fn is_revoked(&self, hash: &str) -> bool {
        self.revoked.contains(hash)
    }

    /// Adds `hash` to the in-memory set and queues it for the next flush.
    /// Returns whether it was newly added.
    pub fn add(&mut self, hash: impl Into<String>) -> bool {
        let hash = hash.into();
        let newly_added = self.revoked.insert(hash.clone());
        if newly_added {
            self.pending.push(hash);
        }
        newly_added
    }

    /// Loads hashes from a plain hash-per-line file, skipping blank and
    /// whitespace-only lines. Replaces neither `pending` nor the file path
    /// this store was constructed with.
    pub fn read_from_file(path: &Path) -> io::Result<BTreeSet<String>> {
        let contents = fs::read_to_string(path)?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    pub fn load(&mut self, path: &Path) -> io::Result<()> {
        self.revoked = Self::read_from_file(path)?;
        self.pending.clear();
        Ok(())
    }

    /// If there are pending additions, atomically rewrites the backing
    /// file with the full current set (write tmp, rename) and returns the
    /// incremental additions for the caller to push onto the transport's
    /// revocation view. A no-op, returning an empty vec, when nothing is
    /// pending or no path was configured.
    pub fn run_maintenance(&mut self) -> io::Result<Vec<String>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let additions = std::mem::take(&mut self.pending);
        if let Some(path) = &self.path {
            let tmp_path = path.with_extension("tmp");
            let body = self.revoked.iter().cloned().collect::<Vec<_>>().join("\n");
            fs::write(&tmp_path, body).map_err(|e| {
                warn!(error = %e, path = %tmp_path.display(), "failed to write revocation tmp file");
                e
            })?;
            fs::rename(&tmp_path, path)?;
            debug!(count = additions.len(), "flushed revocation additions to disk");
        }
        Ok(additions)
    }

    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

impl Default for RevocationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_and_queues_once() {
        let mut store = RevocationStore::new();
        assert!(store.add("abc"));
        assert!(!store.add("abc"));
        assert_eq!(store.pending.len(), 1);
    }

    #[test]
    fn maintenance_flushes_and_clears_pending() {
        let dir = std::env::temp_dir().join(format!("revocation-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("revoked.txt");
        let mut store = RevocationStore::with_path(&path);
        store.add("hash1");
        store.add("hash2");
        let additions = store.run_maintenance().unwrap();
        assert_eq!(additions, vec!["hash1".to_string(), "hash2".to_string()]);
        assert!(store.run_maintenance().unwrap().is_empty());

        let on_disk = RevocationStore::read_from_file(&path).unwrap();
        assert!(on_disk.contains("hash1"));
        assert!(on_disk.contains("hash2"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn read_from_file_skips_blank_lines() {
        let dir = std::env::temp_dir().join(format!("revocation-test-blank-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("revoked.txt");
        fs::write(&path, "abc\n\n  \ndef\n").unwrap();
        let set = RevocationStore::read_from_file(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("abc"));
        assert!(set.contains("def"));
        fs::remove_dir_all(&dir).ok();
    }
}
