//! Filesystem-backed registry of network namespace references.
//!
//! Each entry is a symlink `<dir>/<key>` pointing at a namespace path
//! (usually `/proc/<pid>/ns/net` or a bind mount). The registry is the only
//! state shared between plugin invocations.

use itertools::Itertools;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{CniError, Result};
use crate::netns::NetNs;

/// One registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub target: PathBuf,
}

impl Entry {
    /// The symlink target no longer resolves
    pub fn is_dangling(&self) -> bool {
        !self.target.exists()
    }
}

#[derive(Debug, Clone)]
pub struct NamespaceRegistry {
    dir: PathBuf,
}

impl NamespaceRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the symlink for `key`
    pub fn entry_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key == "." || key == ".." {
            return Err(CniError::Namespace(format!(
                "invalid registry key {:?}",
                key
            )));
        }
        Ok(self.dir.join(key))
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            CniError::Namespace(format!(
                "failed to create registry directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    /// Point `key` at `ns_path`, replacing any stale entry.
    pub fn put(&self, key: &str, ns_path: &Path) -> Result<()> {
        let entry = self.entry_path(key)?;

        match fs::remove_file(&entry) {
            Ok(()) => debug!(key, "replaced stale registry entry"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(key, error = %e, "failed to remove existing registry entry"),
        }

        symlink(ns_path, &entry).map_err(|e| {
            CniError::Namespace(format!(
                "failed to link {} -> {}: {}",
                entry.display(),
                ns_path.display(),
                e
            ))
        })?;

        debug!(key, target = %ns_path.display(), "registry entry written");
        Ok(())
    }

    /// Namespace path recorded for `key`
    pub fn get(&self, key: &str) -> Result<PathBuf> {
        let entry = self.entry_path(key)?;
        fs::read_link(&entry).map_err(|e| {
            CniError::Namespace(format!(
                "no registry entry {}: {}",
                entry.display(),
                e
            ))
        })
    }

    /// Open the namespace behind `key`
    pub fn open(&self, key: &str) -> Result<NetNs> {
        NetNs::open(&self.entry_path(key)?)
    }

    /// Remove `key`. Returns whether an entry existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let entry = self.entry_path(key)?;
        match fs::remove_file(&entry) {
            Ok(()) => {
                debug!(key, "registry entry removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CniError::Namespace(format!(
                "failed to remove {}: {}",
                entry.display(),
                e
            ))),
        }
    }

    /// All symlink entries, sorted by key. A missing directory is empty.
    pub fn list(&self) -> Result<Vec<Entry>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CniError::io(
                    format!("failed to read {}", self.dir.display()),
                    e,
                ))
            }
        };

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item.map_err(|e| CniError::io("failed to read registry entry", e))?;
            let Ok(target) = fs::read_link(item.path()) else {
                // bind mounts created by `ip netns add` live here too
                continue;
            };
            entries.push(Entry {
                key: item.file_name().to_string_lossy().into_owned(),
                target,
            });
        }

        Ok(entries
            .into_iter()
            .sorted_by(|a, b| a.key.cmp(&b.key))
            .collect())
    }

    /// Remove entries whose target is gone. Returns the removed keys.
    pub fn prune(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for entry in self.list()? {
            if entry.is_dangling() && self.remove(&entry.key)? {
                removed.push(entry.key);
            }
        }
        Ok(removed)
    }
}
