//! Crash-safe persistent index of replication tasks.
//!
//! On disk:
//!
//! ```text
//! <root>/
//!   waiting/<taskKey>   # JSON RefUpdate, present while queued
//!   running/<taskKey>   # same schema, present while a push is in flight
//!   tmp/                # staging area for atomic-rename creates
//! ```
//!
//! A task moves between `waiting/` and `running/` by filesystem rename, which
//! is atomic on a POSIX filesystem within one directory. That atomicity is
//! the store's only concurrency primitive: no in-process lock guards a single
//! key's mutations, and no cross-key critical section is required (I1/I2 in
//! the design doc).

mod error;

pub use error::StoreError;

use crate::model::{RefUpdate, TaskKey, TaskState, UriUpdates};
use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Point-in-time count of tasks in each state, for `replicated list --detail`
/// and reload log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub waiting: usize,
    pub running: usize,
}

pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    /// Open (creating if necessary) a task store rooted at `root`. Sweeps any
    /// stale files left in `tmp/` by a `create` that crashed between the
    /// write and the rename.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in ["waiting", "running", "tmp"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir)
                .map_err(|source| StoreError::InitFailed { path: dir, source })?;
        }
        let store = TaskStore { root };
        store.sweep_tmp();
        Ok(store)
    }

    fn dir(&self, state: TaskState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    fn path_for(&self, state: TaskState, key: &TaskKey) -> PathBuf {
        self.dir(state).join(key.as_str())
    }

    /// Remove any leftover temp files. A file in `tmp/` is garbage by
    /// construction: the only thing ever written there is a create's staging
    /// file, immediately renamed away on success.
    fn sweep_tmp(&self) {
        let tmp = self.root.join("tmp");
        let entries = match fs::read_dir(&tmp) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("task store: failed to sweep {}: {e}", tmp.display());
                return;
            }
        };
        for entry in entries.flatten() {
            if let Err(e) = fs::remove_file(entry.path()) {
                if e.kind() != ErrorKind::NotFound {
                    log::warn!("task store: failed to remove stale temp file {}: {e}", entry.path().display());
                }
            }
        }
    }

    /// Persist `update`, deduplicating against an existing waiting or running
    /// record with the same key. Returns the task key either way (I1).
    pub fn create(&self, update: &RefUpdate) -> Result<TaskKey, StoreError> {
        let key = update.key();
        if self.path_for(TaskState::Waiting, &key).exists()
            || self.path_for(TaskState::Running, &key).exists()
        {
            return Ok(key);
        }

        let body = serde_json::to_vec_pretty(update)?;
        let tmp_path = self.root.join("tmp").join(key.as_str());
        {
            let mut f = fs::File::create(&tmp_path)
                .map_err(|source| StoreError::io("create temp file", &tmp_path, source))?;
            f.write_all(&body)
                .map_err(|source| StoreError::io("write temp file", &tmp_path, source))?;
            f.sync_all()
                .map_err(|source| StoreError::io("sync temp file", &tmp_path, source))?;
        }

        let dest = self.path_for(TaskState::Waiting, &key);
        match fs::rename(&tmp_path, &dest) {
            Ok(()) => Ok(key),
            Err(e) => {
                // Lost a create race against another writer for the same key:
                // the destination now exists, which is exactly the dedup
                // outcome we wanted anyway.
                let _ = fs::remove_file(&tmp_path);
                if dest.exists() {
                    Ok(key)
                } else {
                    Err(StoreError::io("rename into waiting/", &dest, e))
                }
            }
        }
    }

    /// Move every `RefUpdate` in `group` from `waiting/` to `running/`. A
    /// missing source file is tolerated: the task was already started
    /// elsewhere, or already finished (I5 / idempotent start).
    pub fn start(&self, group: &UriUpdates) -> Result<(), StoreError> {
        for update in group.ref_updates() {
            self.transition(&update, TaskState::Waiting, TaskState::Running)?;
        }
        Ok(())
    }

    /// Inverse of [`start`](Self::start): move every `RefUpdate` in `group`
    /// back from `running/` to `waiting/`.
    pub fn reset(&self, group: &UriUpdates) -> Result<(), StoreError> {
        for update in group.ref_updates() {
            self.transition(&update, TaskState::Running, TaskState::Waiting)?;
        }
        Ok(())
    }

    /// Remove every `RefUpdate` in `group` from `running/`. Missing file is
    /// tolerated (I5: finishing a non-existent or already-finished task is a
    /// no-op).
    pub fn finish(&self, group: &UriUpdates) -> Result<(), StoreError> {
        for update in group.ref_updates() {
            let path = self.path_for(TaskState::Running, &update.key());
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io("unlink running/", &path, e)),
            }
        }
        Ok(())
    }

    fn transition(&self, update: &RefUpdate, from: TaskState, to: TaskState) -> Result<(), StoreError> {
        let key = update.key();
        let src = self.path_for(from, &key);
        let dst = self.path_for(to, &key);
        match fs::rename(&src, &dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("rename", &src, e)),
        }
    }

    /// Move every task currently in `running/` back to `waiting/`. Called
    /// once at startup (I4: nothing recorded as Running is actually running
    /// after a restart) before any worker is started. Returns the tasks that
    /// were moved, so the caller can replay them through the scheduler.
    pub fn reset_all(&self) -> Result<Vec<RefUpdate>, StoreError> {
        let running = self.list_running();
        for update in &running {
            let key = update.key();
            let src = self.path_for(TaskState::Running, &key);
            let dst = self.path_for(TaskState::Waiting, &key);
            match fs::rename(&src, &dst) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("task store: resetAll failed to reset {key}: {e}");
                }
            }
        }
        Ok(running.into_iter().collect())
    }

    pub fn list_waiting(&self) -> HashSet<RefUpdate> {
        self.list(TaskState::Waiting)
    }

    pub fn list_running(&self) -> HashSet<RefUpdate> {
        self.list(TaskState::Running)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            waiting: self.list_waiting().len(),
            running: self.list_running().len(),
        }
    }

    fn list(&self, state: TaskState) -> HashSet<RefUpdate> {
        let dir = self.dir(state);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("task store: failed to list {}: {e}", dir.display());
                return HashSet::new();
            }
        };

        let mut out = HashSet::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                // The directory was mutated concurrently; a vanished entry is
                // not an error, just a race we lost.
                Err(_) => continue,
            };
            match Self::read_record(&entry.path()) {
                Ok(Some(update)) => {
                    out.insert(update);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("task store: skipping unreadable record {}: {e}", entry.path().display());
                }
            }
        }
        out
    }

    fn read_record(path: &Path) -> Result<Option<RefUpdate>, StoreError> {
        let body = match fs::read(path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io("read", path, e)),
        };
        let update = serde_json::from_slice(&body)?;
        Ok(Some(update))
    }
}
