//! Auto-reload controller: polls the on-disk config, gates on in-flight
//! replication, and publishes a new [`ConfigSnapshot`] through a single-writer
//! lock.

use super::{pending_version, ConfigSnapshot, ConfigVersion};
use std::path::PathBuf;
use std::sync::Mutex;

/// Result of one reload poll cycle.
#[derive(Debug)]
pub enum ReloadOutcome {
    /// Nothing to do: the on-disk version matches what's loaded, matches the
    /// version that failed to parse last time, or the queue isn't eligible.
    Gated(&'static str),
    /// The new snapshot parsed and is ready to publish.
    Reloaded(ConfigSnapshot),
    /// The on-disk config changed but failed to parse; the previous snapshot
    /// stays live.
    Failed(super::ConfigError),
}

pub struct ReloadController {
    main_path: PathBuf,
    remotes_dir: PathBuf,
    loaded_version: Mutex<ConfigVersion>,
    last_failed_version: Mutex<Option<ConfigVersion>>,
}

impl ReloadController {
    pub fn new(main_path: PathBuf, remotes_dir: PathBuf, loaded: &ConfigSnapshot) -> Self {
        ReloadController {
            main_path,
            remotes_dir,
            loaded_version: Mutex::new(loaded.version.clone()),
            last_failed_version: Mutex::new(None),
        }
    }

    pub fn loaded_version(&self) -> ConfigVersion {
        self.loaded_version.lock().unwrap().clone()
    }

    /// Run one poll cycle. `stopped` and `replaying` reflect the
    /// [`crate::queue::ReplicationQueue`]'s current state: a stopped queue or
    /// one still draining in-flight pushes defers the reload (spec.md §4.F
    /// step 2 / scenario 6).
    pub fn check(&self, stopped: bool, replaying: bool) -> ReloadOutcome {
        let pending = match pending_version(&self.main_path, &self.remotes_dir) {
            Ok(v) => v,
            Err(e) => return ReloadOutcome::Failed(e),
        };

        if pending == *self.loaded_version.lock().unwrap() {
            return ReloadOutcome::Gated("unchanged");
        }
        if Some(&pending) == self.last_failed_version.lock().unwrap().as_ref() {
            return ReloadOutcome::Gated("previously failed to parse");
        }
        if stopped {
            return ReloadOutcome::Gated("queue stopped");
        }
        if replaying {
            return ReloadOutcome::Gated("queue replaying");
        }

        match super::load(&self.main_path, &self.remotes_dir) {
            Ok(snapshot) => {
                *self.loaded_version.lock().unwrap() = snapshot.version.clone();
                *self.last_failed_version.lock().unwrap() = None;
                ReloadOutcome::Reloaded(snapshot)
            }
            Err(e) => {
                *self.last_failed_version.lock().unwrap() = Some(pending);
                ReloadOutcome::Failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.toml");
        let remotes = dir.path().join("remotes.d");
        fs::write(&main, "[general]\nauto-reload = true\n").unwrap();
        (dir, main, remotes)
    }

    #[test]
    fn gates_while_replaying() {
        let (_dir, main, remotes) = setup();
        let initial = super::super::load(&main, &remotes).unwrap();
        let controller = ReloadController::new(main.clone(), remotes, &initial);

        fs::write(&main, "[general]\nauto-reload = false\n").unwrap();
        match controller.check(false, true) {
            ReloadOutcome::Gated(_) => {}
            other => panic!("expected gated, got {other:?}"),
        }
        assert_eq!(controller.loaded_version(), initial.version);
    }

    #[test]
    fn reloads_once_replay_finishes() {
        let (_dir, main, remotes) = setup();
        let initial = super::super::load(&main, &remotes).unwrap();
        let controller = ReloadController::new(main.clone(), remotes, &initial);

        std::thread::sleep(std::time::Duration::from_millis(5));
        fs::write(&main, "[general]\nauto-reload = false\n").unwrap();
        match controller.check(false, false) {
            ReloadOutcome::Reloaded(snapshot) => {
                assert_ne!(snapshot.version, initial.version);
                assert!(!snapshot.auto_reload);
            }
            other => panic!("expected reload, got {other:?}"),
        }
        assert_ne!(controller.loaded_version(), initial.version);
    }

    #[test]
    fn does_not_retry_a_broken_file_every_cycle() {
        let (_dir, main, remotes) = setup();
        let initial = super::super::load(&main, &remotes).unwrap();
        let controller = ReloadController::new(main.clone(), remotes.clone(), &initial);

        fs::create_dir_all(&remotes).unwrap();
        fs::write(remotes.join("bad.toml"), "not valid toml [[[").unwrap();

        let first = controller.check(false, false);
        assert!(matches!(first, ReloadOutcome::Failed(_)));
        let second = controller.check(false, false);
        assert!(matches!(second, ReloadOutcome::Gated("previously failed to parse")));
    }
}
