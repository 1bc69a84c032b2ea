//! Scenario 5 / P7 / P12: a task stuck in `running/` when the process dies
//! comes back as `waiting/` the next time the engine starts, and is not lost.

mod common;

use common::harness;
use replicate::model::{RefUpdate, UriUpdates};
use replicate::queue::ReplicationQueue;
use replicate::store::TaskStore;

#[test]
fn reset_all_recovers_a_crashed_running_task() {
    let h = harness().with_remote("foo1", "url = \"ssh://foo1/${name}.git\"\nprojects = [\"*\"]\nreplicationDelay = 3600\n").start();

    let update = RefUpdate::new("P", "refs/heads/main", "ssh://foo1/P.git", "foo1");
    h.queue.store().create(&update).unwrap();
    let group = UriUpdates { remote: "foo1".into(), uri: "ssh://foo1/P.git".into(), refs: vec!["refs/heads/main".into()], project: "P".into() };
    h.queue.store().start(&group).unwrap();
    assert_eq!(h.queue.store().stats(), replicate::store::StoreStats { waiting: 0, running: 1 });

    h.queue.stop();

    let recovered = h.queue.store().reset_all().unwrap();
    assert_eq!(recovered, vec![update.clone()]);
    assert_eq!(h.queue.store().stats(), replicate::store::StoreStats { waiting: 1, running: 0 });
}

#[test]
fn a_second_queue_handle_over_the_same_store_sees_the_recovered_task() {
    let store_dir = tempfile::tempdir().unwrap();
    let config_dir = tempfile::tempdir().unwrap();
    let remotes_dir = config_dir.path().join("remotes.d");
    std::fs::create_dir_all(&remotes_dir).unwrap();
    let main_path = config_dir.path().join("replication.toml");
    std::fs::write(&main_path, "[general]\nauto-reload = true\n").unwrap();
    std::fs::write(remotes_dir.join("foo1.toml"), "url = \"ssh://foo1/${name}.git\"\nprojects = [\"*\"]\nreplicationDelay = 3600\n").unwrap();

    // First "process": create a task, mark it running, then vanish without
    // calling stop() — simulating a crash.
    {
        let queue = ReplicationQueue::open(store_dir.path(), &main_path, &remotes_dir).unwrap();
        let update = RefUpdate::new("P", "refs/heads/main", "ssh://foo1/P.git", "foo1");
        queue.store().create(&update).unwrap();
        let group = UriUpdates { remote: "foo1".into(), uri: "ssh://foo1/P.git".into(), refs: vec!["refs/heads/main".into()], project: "P".into() };
        queue.store().start(&group).unwrap();
    }

    // Second "process": opening the same store path and starting recovers
    // the orphaned running task back into waiting (I4).
    let restarted = TaskStore::open(store_dir.path()).unwrap();
    assert_eq!(restarted.stats().running, 1);
    restarted.reset_all().unwrap();
    assert_eq!(restarted.stats(), replicate::store::StoreStats { waiting: 1, running: 0 });
}
