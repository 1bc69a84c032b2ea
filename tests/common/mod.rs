//! Shared fixtures for the end-to-end replication scenarios.

use replicate::queue::ReplicationQueue;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A scratch config/store layout plus a started [`ReplicationQueue`] on top
/// of it. Holding the `TempDir`s keeps the directories alive for the test's
/// duration.
pub struct Harness {
    pub queue: Arc<ReplicationQueue>,
    _store_dir: TempDir,
    _config_dir: TempDir,
    remotes_dir: PathBuf,
}

impl Harness {
    /// Write one `remotes.d/<name>.toml` file before the queue starts.
    pub fn with_remote(self, name: &str, body: &str) -> Self {
        fs::write(self.remotes_dir.join(format!("{name}.toml")), body).unwrap();
        self
    }

    pub fn start(self) -> Self {
        self.queue.start();
        self
    }
}

pub fn harness() -> Harness {
    let store_dir = tempfile::tempdir().unwrap();
    let config_dir = tempfile::tempdir().unwrap();
    let remotes_dir = config_dir.path().join("remotes.d");
    fs::create_dir_all(&remotes_dir).unwrap();
    let main_path = config_dir.path().join("replication.toml");
    fs::write(&main_path, "[general]\nauto-reload = true\npoll-interval-secs = 1\n").unwrap();

    let queue = ReplicationQueue::open(store_dir.path(), &main_path, &remotes_dir).unwrap();
    Harness { queue, _store_dir: store_dir, _config_dir: config_dir, remotes_dir }
}

/// Poll `cond` until it's true or `timeout` elapses.
pub fn wait_for(mut cond: impl FnMut() -> bool, timeout: std::time::Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    cond()
}

pub fn write_main(dir: &Path, body: &str) {
    fs::write(dir.join("replication.toml"), body).unwrap();
}
