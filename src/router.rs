//! Ref-update event router: turns one `(project, ref, updater)` event into
//! per-(destination, uri) replication tasks.

use crate::config::{ConfigSnapshot, FilterMode};
use crate::destination::Destination as RunningDestination;
use crate::model::RefUpdate;
use crate::store::{StoreError, TaskStore};
use std::collections::HashMap;
use std::sync::Arc;

/// Dispatches a matched `(destination, uri)` pair into that destination's
/// scheduler. Implemented by [`crate::queue::ReplicationQueue`]'s destination
/// map; kept as a trait so the router is unit-testable without a whole
/// running queue.
pub trait Dispatch {
    fn dispatch(&self, destination: &str, project: &str, r#ref: &str, uri: &str);
    fn create_project(&self, destination: &str, project: &str, head: Option<&str>);
    fn delete_project(&self, destination: &str, project: &str);
}

impl Dispatch for HashMap<String, Arc<RunningDestination>> {
    fn dispatch(&self, destination: &str, project: &str, r#ref: &str, uri: &str) {
        if let Some(dest) = self.get(destination) {
            dest.schedule(project, r#ref, uri);
        }
    }

    fn create_project(&self, destination: &str, project: &str, head: Option<&str>) {
        if let Some(dest) = self.get(destination) {
            dest.create_project(project, head);
        }
    }

    fn delete_project(&self, destination: &str, project: &str) {
        if let Some(dest) = self.get(destination) {
            dest.delete_project(project);
        }
    }
}

/// Receives ref-update events from the (external, out-of-scope) event
/// source and fans them out to every matching destination.
pub struct Router<'a> {
    store: &'a TaskStore,
}

impl<'a> Router<'a> {
    pub fn new(store: &'a TaskStore) -> Self {
        Router { store }
    }

    /// Handle one ref-update event: persist a task and enqueue it for every
    /// (destination, uri) pair whose project/ref filters match, under
    /// [`FilterMode::All`].
    ///
    /// `updater` identifies who pushed the update; it isn't consulted by the
    /// matching logic today but is threaded through for replication events
    /// and audit logging further down the pipeline.
    pub fn on_event(
        &self,
        snapshot: &ConfigSnapshot,
        dispatch: &impl Dispatch,
        project: &str,
        r#ref: &str,
        _updater: &str,
    ) -> Result<usize, StoreError> {
        let mut created = 0;
        for dest in snapshot.destinations.values() {
            if !dest.matches(project, r#ref, FilterMode::All) {
                continue;
            }
            for uri in dest.expand_urls(project) {
                let update = RefUpdate::new(project, r#ref, uri.clone(), dest.name.clone());
                self.store.create(&update)?;
                dispatch.dispatch(&dest.name, project, r#ref, &uri);
                created += 1;
            }
        }
        Ok(created)
    }

    /// Project-creation lifecycle event: notify every destination that opts
    /// into `ProjectCreation` filtering. Admin operations are best-effort and
    /// bypass the task store entirely (spec.md §4.C Admin operations), so
    /// this returns only a count of destinations notified.
    pub fn on_project_created(&self, snapshot: &ConfigSnapshot, dispatch: &impl Dispatch, project: &str, head: Option<&str>) -> usize {
        let mut notified = 0;
        for dest in snapshot.destinations.values() {
            if !dest.matches(project, "", FilterMode::ProjectCreation) {
                continue;
            }
            dispatch.create_project(&dest.name, project, head);
            notified += 1;
        }
        notified
    }

    /// Project-deletion lifecycle event, mirroring [`on_project_created`](Self::on_project_created).
    pub fn on_project_deleted(&self, snapshot: &ConfigSnapshot, dispatch: &impl Dispatch, project: &str) -> usize {
        let mut notified = 0;
        for dest in snapshot.destinations.values() {
            if !dest.matches(project, "", FilterMode::ProjectDeletion) {
                continue;
            }
            dispatch.delete_project(&dest.name, project);
            notified += 1;
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load as load_config};
    use std::cell::RefCell;
    use std::fs;

    struct RecordingDispatch {
        calls: RefCell<Vec<(String, String, String, String)>>,
        project_created: RefCell<Vec<(String, String, Option<String>)>>,
        project_deleted: RefCell<Vec<(String, String)>>,
    }

    impl RecordingDispatch {
        fn new() -> Self {
            RecordingDispatch {
                calls: RefCell::new(Vec::new()),
                project_created: RefCell::new(Vec::new()),
                project_deleted: RefCell::new(Vec::new()),
            }
        }
    }

    impl Dispatch for RecordingDispatch {
        fn dispatch(&self, destination: &str, project: &str, r#ref: &str, uri: &str) {
            self.calls.borrow_mut().push((
                destination.to_string(),
                project.to_string(),
                r#ref.to_string(),
                uri.to_string(),
            ));
        }

        fn create_project(&self, destination: &str, project: &str, head: Option<&str>) {
            self.project_created.borrow_mut().push((destination.to_string(), project.to_string(), head.map(String::from)));
        }

        fn delete_project(&self, destination: &str, project: &str) {
            self.project_deleted.borrow_mut().push((destination.to_string(), project.to_string()));
        }
    }

    fn two_remote_config(dir: &std::path::Path) -> crate::config::ConfigSnapshot {
        let remotes = dir.join("remotes.d");
        fs::create_dir_all(&remotes).unwrap();
        fs::write(remotes.join("foo1.toml"), "url = \"ssh://foo1/${name}.git\"\nprojects = [\"*\"]\n").unwrap();
        fs::write(remotes.join("foo2.toml"), "url = \"ssh://foo2/${name}.git\"\nprojects = [\"*\"]\n").unwrap();
        load_config(&dir.join("main.toml"), &remotes).unwrap()
    }

    #[test]
    fn new_branch_fans_out_to_two_remotes() {
        let store_dir = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(store_dir.path()).unwrap();
        let snapshot = two_remote_config(config_dir.path());
        let router = Router::new(&store);
        let dispatch = RecordingDispatch::new();

        let created = router
            .on_event(&snapshot, &dispatch, "P", "refs/heads/mybranch", "alice")
            .unwrap();

        assert_eq!(created, 2);
        let all = store.list_waiting();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|u| u.r#ref == "refs/heads/mybranch"));
        assert_eq!(dispatch.calls.borrow().len(), 2);
    }

    #[test]
    fn fan_out_count_with_multiple_urls_per_remote() {
        let store_dir = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        let remotes = config_dir.path().join("remotes.d");
        fs::create_dir_all(&remotes).unwrap();
        fs::write(
            remotes.join("foo1.toml"),
            "url = [\"ssh://foo1/replica1/${name}.git\", \"ssh://foo1/replica2/${name}.git\"]\nprojects = [\"*\"]\n",
        )
        .unwrap();
        fs::write(
            remotes.join("foo2.toml"),
            "url = [\"ssh://foo2/replica1/${name}.git\", \"ssh://foo2/replica2/${name}.git\"]\nprojects = [\"*\"]\n",
        )
        .unwrap();
        let snapshot = load_config(&config_dir.path().join("main.toml"), &remotes).unwrap();

        let store = TaskStore::open(store_dir.path()).unwrap();
        let router = Router::new(&store);
        let dispatch = RecordingDispatch::new();

        router
            .on_event(&snapshot, &dispatch, "P", "refs/changes/12/1234/1", "alice")
            .unwrap();

        let waiting: Vec<_> = store
            .list_waiting()
            .into_iter()
            .filter(|u| regex::Regex::new(r"refs/changes/\d+/\d+/\d+").unwrap().is_match(&u.r#ref))
            .collect();
        assert_eq!(waiting.len(), 4);
    }

    #[test]
    fn non_matching_project_is_skipped() {
        let store_dir = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        let remotes = config_dir.path().join("remotes.d");
        fs::create_dir_all(&remotes).unwrap();
        fs::write(remotes.join("foo1.toml"), "url = \"ssh://foo1/${name}.git\"\nprojects = [\"team-*\"]\n").unwrap();
        let snapshot = load_config(&config_dir.path().join("main.toml"), &remotes).unwrap();

        let store = TaskStore::open(store_dir.path()).unwrap();
        let router = Router::new(&store);
        let dispatch = RecordingDispatch::new();

        let created = router.on_event(&snapshot, &dispatch, "other-proj", "refs/heads/main", "alice").unwrap();
        assert_eq!(created, 0);
        assert!(store.list_waiting().is_empty());
    }

    #[test]
    fn project_created_notifies_matching_destinations_without_touching_the_store() {
        let store_dir = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        let snapshot = two_remote_config(config_dir.path());
        let store = TaskStore::open(store_dir.path()).unwrap();
        let router = Router::new(&store);
        let dispatch = RecordingDispatch::new();

        let notified = router.on_project_created(&snapshot, &dispatch, "P", Some("refs/heads/main"));

        assert_eq!(notified, 2);
        assert_eq!(dispatch.project_created.borrow().len(), 2);
        assert!(store.list_waiting().is_empty());
    }

    #[test]
    fn project_deleted_skips_destinations_whose_project_filter_does_not_match() {
        let store_dir = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        let remotes = config_dir.path().join("remotes.d");
        fs::create_dir_all(&remotes).unwrap();
        fs::write(remotes.join("foo1.toml"), "url = \"ssh://foo1/${name}.git\"\nprojects = [\"team-*\"]\n").unwrap();
        let snapshot = load_config(&config_dir.path().join("main.toml"), &remotes).unwrap();

        let store = TaskStore::open(store_dir.path()).unwrap();
        let router = Router::new(&store);
        let dispatch = RecordingDispatch::new();

        let notified = router.on_project_deleted(&snapshot, &dispatch, "other-proj");
        assert_eq!(notified, 0);
        assert!(dispatch.project_deleted.borrow().is_empty());
    }
}
