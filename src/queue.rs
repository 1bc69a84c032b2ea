//! Ties the task store, config loader, router, and live destinations into one
//! running replication engine.

use crate::admin::{self, AdminTransport};
use crate::config::{self, ConfigError, ConfigSnapshot, ReloadController, ReloadOutcome};
use crate::destination::Destination;
use crate::router::Router;
use crate::store::{StoreError, TaskStore};
use crate::worker::CommandLineTransport;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug)]
pub enum QueueError {
    Store(StoreError),
    Config(ConfigError),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Store(e) => write!(f, "task store: {e}"),
            QueueError::Config(e) => write!(f, "config: {e}"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        QueueError::Store(e)
    }
}

impl From<ConfigError> for QueueError {
    fn from(e: ConfigError) -> Self {
        QueueError::Config(e)
    }
}

/// The running replication engine: one task store, one live config
/// snapshot, and a map of started [`Destination`]s kept in sync with it.
pub struct ReplicationQueue {
    store: Arc<TaskStore>,
    main_path: PathBuf,
    remotes_dir: PathBuf,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    destinations: RwLock<HashMap<String, Arc<Destination>>>,
    reload: ReloadController,
    stopped: AtomicBool,
    reload_stop: Arc<(Mutex<bool>, Condvar)>,
    reload_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ReplicationQueue {
    pub fn open(
        store_root: impl Into<PathBuf>,
        main_path: impl Into<PathBuf>,
        remotes_dir: impl Into<PathBuf>,
    ) -> Result<Arc<Self>, QueueError> {
        let main_path = main_path.into();
        let remotes_dir = remotes_dir.into();
        let store = Arc::new(TaskStore::open(store_root)?);
        let snapshot = config::load(&main_path, &remotes_dir)?;
        let reload = ReloadController::new(main_path.clone(), remotes_dir.clone(), &snapshot);

        Ok(Arc::new(ReplicationQueue {
            store,
            main_path,
            remotes_dir,
            snapshot: RwLock::new(Arc::new(snapshot)),
            destinations: RwLock::new(HashMap::new()),
            reload,
            stopped: AtomicBool::new(true),
            reload_stop: Arc::new((Mutex::new(false), Condvar::new())),
            reload_thread: Mutex::new(None),
        }))
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    fn build_destination(&self, config: crate::config::Destination) -> Arc<Destination> {
        let transport = Arc::new(CommandLineTransport::new(false));
        let admin_transport: Arc<dyn AdminTransport> = match config.admin_urls.first() {
            Some(url) => Arc::from(admin::for_url(url)),
            None => Arc::new(admin::Ssh),
        };
        let dest = Arc::new(Destination::new(config, Arc::clone(&self.store), transport, admin_transport));
        dest.start();
        dest
    }

    /// Recover crashed-running tasks, start every configured destination,
    /// and spawn the config auto-reload poll thread.
    ///
    /// Reloads config synchronously first: `open()` loads a snapshot once,
    /// and any remote file written between `open()` and `start()` would
    /// otherwise be invisible until the next poll cycle.
    pub fn start(self: &Arc<Self>) {
        self.stopped.store(false, Ordering::SeqCst);
        if let Err(e) = self.store.reset_all() {
            log::warn!("queue start: resetAll failed: {e}");
        }

        match self.reload.check(false, false) {
            ReloadOutcome::Reloaded(fresh) => *self.snapshot.write().unwrap() = Arc::new(fresh),
            ReloadOutcome::Gated(reason) => log::debug!("queue start: config unchanged since open ({reason})"),
            ReloadOutcome::Failed(e) => log::warn!("queue start: failed to load config, using last-known snapshot: {e}"),
        }

        let snapshot = self.snapshot();
        {
            let mut destinations = self.destinations.write().unwrap();
            for (name, cfg) in &snapshot.destinations {
                destinations.insert(name.clone(), self.build_destination(cfg.clone()));
            }
        }

        let this = Arc::clone(self);
        let stop = Arc::clone(&self.reload_stop);
        let poll_interval = Duration::from_secs(snapshot.poll_interval_secs.max(1));
        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*stop;
            let mut guard = lock.lock().unwrap();
            loop {
                let (g, timed_out) = cvar.wait_timeout(guard, poll_interval).unwrap();
                guard = g;
                if *guard {
                    break;
                }
                if timed_out.timed_out() {
                    this.poll_reload();
                }
            }
        });
        *self.reload_thread.lock().unwrap() = Some(handle);
    }

    /// Stop accepting new config reloads, drain every destination, and join
    /// the reload thread. In-flight pushes are allowed to finish.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let (lock, cvar) = &*self.reload_stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(handle) = self.reload_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        for dest in self.destinations.read().unwrap().values() {
            dest.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_replaying(&self) -> bool {
        self.destinations.read().unwrap().values().any(|d| d.is_replaying())
    }

    fn poll_reload(&self) {
        if !self.snapshot().auto_reload {
            return;
        }
        match self.reload.check(self.is_stopped(), self.is_replaying()) {
            ReloadOutcome::Reloaded(snapshot) => self.swap_snapshot(snapshot),
            ReloadOutcome::Gated(reason) => log::debug!("config reload gated: {reason}"),
            ReloadOutcome::Failed(e) => log::warn!("config reload: {e}"),
        }
    }

    /// Transactional swap: destinations absent from the new snapshot are
    /// drained and dropped, destinations present in both keep running
    /// in-flight work, and newly configured destinations are built and
    /// started.
    fn swap_snapshot(&self, new_snapshot: ConfigSnapshot) {
        let new_snapshot = Arc::new(new_snapshot);
        let mut destinations = self.destinations.write().unwrap();
        let mut kept = HashMap::new();
        for (name, dest) in destinations.drain() {
            if new_snapshot.destinations.contains_key(&name) {
                kept.insert(name, dest);
            } else {
                log::info!("config reload: destination {name} removed, draining");
                dest.stop();
            }
        }
        for (name, cfg) in &new_snapshot.destinations {
            kept.entry(name.clone()).or_insert_with(|| self.build_destination(cfg.clone()));
        }
        *destinations = kept;
        *self.snapshot.write().unwrap() = new_snapshot;
    }

    /// Handle one ordinary ref-update event, fanning it out to every
    /// matching live destination.
    pub fn on_event(&self, project: &str, r#ref: &str, updater: &str) -> Result<usize, StoreError> {
        let snapshot = self.snapshot();
        let destinations = self.destinations.read().unwrap();
        let router = Router::new(&self.store);
        router.on_event(&snapshot, &*destinations, project, r#ref, updater)
    }

    /// Handle a project-creation lifecycle event, notifying every
    /// destination whose project filter opts into `ProjectCreation`.
    pub fn on_project_created(&self, project: &str, head: Option<&str>) -> usize {
        let snapshot = self.snapshot();
        let destinations = self.destinations.read().unwrap();
        let router = Router::new(&self.store);
        router.on_project_created(&snapshot, &*destinations, project, head)
    }

    /// Handle a project-deletion lifecycle event, notifying every
    /// destination whose project filter opts into `ProjectDeletion`.
    pub fn on_project_deleted(&self, project: &str) -> usize {
        let snapshot = self.snapshot();
        let destinations = self.destinations.read().unwrap();
        let router = Router::new(&self.store);
        router.on_project_deleted(&snapshot, &*destinations, project)
    }

    pub fn main_path(&self) -> &std::path::Path {
        &self.main_path
    }

    pub fn remotes_dir(&self) -> &std::path::Path {
        &self.remotes_dir
    }

    /// Names of every destination matching `pattern` (`*`/`?` glob, as used
    /// by a remote's `projects` filter).
    pub fn matching_destinations(&self, pattern: &str) -> Result<Vec<String>, String> {
        let re = config::glob_to_regex(pattern)?;
        Ok(self.destinations.read().unwrap().keys().filter(|name| re.is_match(name)).cloned().collect())
    }

    /// `replicated stop [PATTERN]`: cancel scheduled/retrying timers for
    /// every matching destination. In-flight pushes finish; their tasks
    /// stay durable regardless.
    pub fn pause(&self, pattern: &str) -> Result<Vec<String>, String> {
        let matched = self.matching_destinations(pattern)?;
        let destinations = self.destinations.read().unwrap();
        for name in &matched {
            if let Some(dest) = destinations.get(name) {
                dest.stop();
            }
        }
        Ok(matched)
    }

    /// `replicated start [--now] [PATTERN]`: resume accepting new work for
    /// every matching destination, optionally forcing everything currently
    /// coalescing to dispatch immediately.
    pub fn resume(&self, pattern: &str, now: bool) -> Result<Vec<String>, String> {
        let matched = self.matching_destinations(pattern)?;
        let destinations = self.destinations.read().unwrap();
        for name in &matched {
            if let Some(dest) = destinations.get(name) {
                dest.start();
                if now {
                    dest.force_dispatch_all();
                }
            }
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup(dir: &std::path::Path) -> (PathBuf, PathBuf, PathBuf) {
        let store_root = dir.join("store");
        let main = dir.join("main.toml");
        let remotes = dir.join("remotes.d");
        fs::create_dir_all(&remotes).unwrap();
        fs::write(&main, "[general]\nauto-reload = true\npoll-interval-secs = 1\n").unwrap();
        (store_root, main, remotes)
    }

    #[test]
    fn start_and_stop_with_no_destinations_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (store_root, main, remotes) = setup(dir.path());
        let queue = ReplicationQueue::open(&store_root, &main, &remotes).unwrap();
        queue.start();
        assert!(!queue.is_stopped());
        assert_eq!(queue.on_event("proj", "refs/heads/main", "alice").unwrap(), 0);
        queue.stop();
        assert!(queue.is_stopped());
    }

    #[test]
    fn start_sees_a_remote_file_written_after_open_but_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let (store_root, main, remotes) = setup(dir.path());
        let queue = ReplicationQueue::open(&store_root, &main, &remotes).unwrap();

        // Written after open() already fingerprinted an empty remotes.d/.
        fs::write(remotes.join("foo1.toml"), "url = \"ssh://foo1/${name}.git\"\nprojects = [\"*\"]\n").unwrap();

        queue.start();
        let created = queue.on_event("proj", "refs/heads/main", "alice").unwrap();
        assert_eq!(created, 1);
        queue.stop();
    }

    #[test]
    fn event_fans_out_once_a_remote_is_configured() {
        let dir = tempfile::tempdir().unwrap();
        let (store_root, main, remotes) = setup(dir.path());
        fs::write(remotes.join("foo1.toml"), "url = \"ssh://foo1/${name}.git\"\nprojects = [\"*\"]\n").unwrap();

        let queue = ReplicationQueue::open(&store_root, &main, &remotes).unwrap();
        queue.start();
        let created = queue.on_event("proj", "refs/heads/main", "alice").unwrap();
        assert_eq!(created, 1);
        assert_eq!(queue.store().stats().waiting + queue.store().stats().running, 1);
        queue.stop();
    }
}
