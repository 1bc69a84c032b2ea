//! A `Destination` is the live, running counterpart of a
//! [`crate::config::Destination`]: it owns an in-memory `PushOne` table, a
//! bounded worker pool, and the durable task store both read from.

mod scheduler;

use crate::admin::AdminTransport;
use crate::config::Destination as DestinationConfig;
use crate::model::UriUpdates;
use crate::store::TaskStore;
use crate::worker::{GitTransport, Outcome};
use dashmap::DashMap;
use scheduler::{new_push_one, PushOne};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The live, running counterpart of a [`DestinationConfig`]: a per-uri
/// `PushOne` table, a bounded worker pool sized from `threads`, and a
/// background ticker that dispatches due work.
pub struct Destination {
    config: DestinationConfig,
    store: Arc<TaskStore>,
    transport: Arc<dyn GitTransport>,
    admin: Arc<dyn AdminTransport>,
    state: Arc<DashMap<String, Mutex<PushOne>>>,
    pool: rayon::ThreadPool,
    accepting: AtomicBool,
    ticker: Mutex<Option<std::thread::JoinHandle<()>>>,
    ticker_stop: Arc<(Mutex<bool>, std::sync::Condvar)>,
}

impl Destination {
    pub fn new(config: DestinationConfig, store: Arc<TaskStore>, transport: Arc<dyn GitTransport>, admin: Arc<dyn AdminTransport>) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads.max(1))
            .thread_name(move |i| format!("push-worker-{i}"))
            .build()
            .expect("failed to build destination worker pool");

        Destination {
            config,
            store,
            transport,
            admin,
            state: Arc::new(DashMap::new()),
            pool,
            accepting: AtomicBool::new(true),
            ticker: Mutex::new(None),
            ticker_stop: Arc::new((Mutex::new(false), std::sync::Condvar::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Start the background ticker and replay any tasks already `Waiting`
    /// in the store for this destination's URIs (crash/restart recovery,
    /// spec.md §4.C startup recovery).
    pub fn start(self: &Arc<Self>) {
        self.accepting.store(true, Ordering::SeqCst);
        *self.ticker_stop.0.lock().unwrap() = false;
        for update in self.store.list_waiting() {
            if update.remote == self.config.name {
                self.schedule(&update.project, &update.r#ref, &update.uri);
            }
        }

        let this = Arc::clone(self);
        let stop = Arc::clone(&self.ticker_stop);
        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*stop;
            let mut guard = lock.lock().unwrap();
            while !*guard {
                guard = cvar.wait_timeout(guard, Duration::from_millis(100)).unwrap().0;
                this.tick();
            }
        });
        *self.ticker.lock().unwrap() = Some(handle);
    }

    /// Stop accepting new enqueues, cancel armed timers for anything not
    /// already running, and let in-flight pushes finish. Durable state for
    /// cancelled timers stays `Waiting` in the store untouched.
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.state.retain(|_, po| !po.lock().unwrap().cancelable());

        let (lock, cvar) = &*self.ticker_stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// True while any `PushOne` owned by this destination is `Running` or
    /// `Retrying` — used by the reload controller to defer a config swap
    /// until in-flight work drains.
    pub fn is_replaying(&self) -> bool {
        self.state.iter().any(|e| {
            let po = e.value().lock().unwrap();
            po.is_running() || matches!(po.state(), scheduler::PushOneState::Retrying)
        })
    }

    /// Enqueue protocol entry point: create or coalesce a `PushOne` for
    /// `uri`. The underlying task was already persisted by the router
    /// before this is called.
    pub fn schedule(&self, project: &str, r#ref: &str, uri: &str) {
        if !self.is_running() {
            return;
        }
        let delay = Duration::from_secs(self.config.replication_delay_secs);
        let retries = self.config.replication_retry;

        match self.state.entry(uri.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Mutex::new(new_push_one(project, uri, r#ref, delay, retries)));
            }
            dashmap::mapref::entry::Entry::Occupied(e) => {
                e.get().lock().unwrap().add_ref(r#ref);
            }
        }
    }

    /// Scan the state table for due work and hand it to the worker pool.
    /// Runs on the ticker thread; each dispatched push runs on the rayon
    /// pool, bounding in-flight pushes to `config.threads`.
    fn tick(&self) {
        self.tick_inner(false);
    }

    /// Dispatch every `Scheduled`/`Retrying` `PushOne` immediately,
    /// ignoring its remaining coalescing delay. Backs the CLI's
    /// `start --now`.
    pub fn force_dispatch_all(&self) {
        self.tick_inner(true);
    }

    fn tick_inner(&self, force: bool) {
        if !self.is_running() {
            return;
        }
        let now = Instant::now();
        let due: Vec<String> = self
            .state
            .iter()
            .filter(|e| e.value().lock().unwrap().ready_or_forced(now, force))
            .map(|e| e.key().clone())
            .collect();

        for uri in due {
            let Some(entry) = self.state.get(&uri) else { continue };
            let (project, refs) = {
                let mut po = entry.value().lock().unwrap();
                (po.project.clone(), po.begin_dispatch())
            };
            drop(entry);
            if refs.is_empty() {
                continue;
            }

            let store = Arc::clone(&self.store);
            let transport = Arc::clone(&self.transport);
            let state = Arc::clone(&self.state);
            let remote = self.config.name.clone();
            let uri_owned = uri.clone();
            let group = UriUpdates { remote, uri: uri_owned.clone(), refs, project };

            self.pool.spawn(move || {
                if let Err(e) = store.start(&group) {
                    log::warn!("push {uri_owned}: failed to mark task running: {e}");
                }
                let report = transport.push(&group);

                let retry_or_done = match report.outcome {
                    Outcome::Success => {
                        let _ = store.finish(&group);
                        false
                    }
                    Outcome::Permanent => {
                        log::warn!("push {uri_owned}: permanent failure, giving up");
                        let _ = store.finish(&group);
                        false
                    }
                    Outcome::Transient => true,
                };

                if let Some(po) = state.get(&uri_owned) {
                    let mut po = po.lock().unwrap();
                    if retry_or_done {
                        if !po.fail_transient() {
                            log::warn!("push {uri_owned}: retries exhausted, giving up");
                            let _ = store.finish(&group);
                        } else {
                            let _ = store.reset(&group);
                        }
                    } else {
                        po.complete();
                    }
                }
            });
        }
    }

    pub fn create_project(&self, project: &str, head: Option<&str>) {
        for admin_url in &self.config.admin_urls {
            if !self.admin.create_project(admin_url, project, head) {
                log::warn!("create_project {project} on {} via {admin_url} did not succeed", self.config.name);
            }
        }
    }

    pub fn delete_project(&self, project: &str) {
        for admin_url in &self.config.admin_urls {
            if !self.admin.delete_project(admin_url, project) {
                log::warn!("delete_project {project} on {} via {admin_url} did not succeed", self.config.name);
            }
        }
    }

    pub fn update_head(&self, project: &str, head: &str) {
        for admin_url in &self.config.admin_urls {
            if !self.admin.update_head(admin_url, project, head) {
                log::warn!("update_head {project} on {} via {admin_url} did not succeed", self.config.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{PushReport, RefPushResult};
    use std::sync::Mutex as StdMutex;

    struct FakeTransport {
        outcome: Outcome,
        calls: StdMutex<Vec<UriUpdates>>,
    }

    impl GitTransport for FakeTransport {
        fn push(&self, updates: &UriUpdates) -> PushReport {
            self.calls.lock().unwrap().push(updates.clone());
            PushReport {
                outcome: self.outcome,
                refs: updates
                    .refs
                    .iter()
                    .map(|r| RefPushResult { r#ref: r.clone(), outcome: self.outcome, detail: None })
                    .collect(),
            }
        }
    }

    struct NoopAdmin;
    impl AdminTransport for NoopAdmin {
        fn create_project(&self, _: &str, _: &str, _: Option<&str>) -> bool {
            true
        }
        fn delete_project(&self, _: &str, _: &str) -> bool {
            true
        }
        fn update_head(&self, _: &str, _: &str, _: &str) -> bool {
            true
        }
    }

    fn test_config(name: &str, delay_secs: u64) -> DestinationConfig {
        DestinationConfig::for_test(name, delay_secs)
    }

    #[test]
    fn schedule_creates_and_dispatches_a_due_push() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let update = crate::model::RefUpdate::new("proj", "refs/heads/main", "ssh://host/proj.git", "foo1");
        store.create(&update).unwrap();

        let transport = Arc::new(FakeTransport { outcome: Outcome::Success, calls: StdMutex::new(Vec::new()) });
        let dest = Arc::new(Destination::new(test_config("foo1", 0), Arc::clone(&store), transport.clone(), Arc::new(NoopAdmin)));
        dest.start();
        dest.schedule("proj", "refs/heads/main", "ssh://host/proj.git");

        std::thread::sleep(Duration::from_millis(250));
        dest.stop();

        assert_eq!(transport.calls.lock().unwrap().len(), 1);
        assert_eq!(store.stats().waiting, 0);
        assert_eq!(store.stats().running, 0);
    }

    #[test]
    fn stop_cancels_scheduled_but_leaves_task_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let update = crate::model::RefUpdate::new("proj", "refs/heads/main", "ssh://host/proj.git", "foo1");
        store.create(&update).unwrap();

        let transport = Arc::new(FakeTransport { outcome: Outcome::Success, calls: StdMutex::new(Vec::new()) });
        let dest = Arc::new(Destination::new(test_config("foo1", 3600), Arc::clone(&store), transport.clone(), Arc::new(NoopAdmin)));
        dest.start();
        dest.schedule("proj", "refs/heads/main", "ssh://host/proj.git");
        dest.stop();

        assert_eq!(transport.calls.lock().unwrap().len(), 0);
        assert_eq!(store.stats().waiting, 1);
    }
}
