//! Core data types shared by the store, router, and scheduler.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A single unit of replication work: "push `ref` of `project` to `uri` on
/// `remote`". This is the record persisted by the task store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefUpdate {
    pub project: String,
    pub r#ref: String,
    pub uri: String,
    pub remote: String,
}

impl RefUpdate {
    pub fn new(
        project: impl Into<String>,
        r#ref: impl Into<String>,
        uri: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            r#ref: r#ref.into(),
            uri: uri.into(),
            remote: remote.into(),
        }
    }

    /// Stable identity for dedup and filesystem naming: SHA-256 of the four
    /// fields in a fixed order, joined by a byte that cannot appear in any of
    /// them on its own (project/ref/uri/remote are never binary).
    pub fn key(&self) -> TaskKey {
        let mut hasher = Sha256::new();
        hasher.update(self.remote.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.project.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.r#ref.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.uri.as_bytes());
        TaskKey(hex_encode(&hasher.finalize()))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// The task store's sole identity for a [`RefUpdate`]. Also the filename
/// under which it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a [`RefUpdate`] currently lives in the task store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Waiting,
    Running,
}

impl TaskState {
    pub fn dir_name(self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
        }
    }
}

/// An in-memory batch of [`RefUpdate`]s that share `(remote, uri)`, built by
/// the scheduler when it coalesces pending refs for dispatch. Each underlying
/// `RefUpdate` keeps its own identity and file in the task store; a
/// `UriUpdates` never itself gets persisted.
#[derive(Debug, Clone)]
pub struct UriUpdates {
    pub remote: String,
    pub uri: String,
    pub refs: Vec<String>,
    pub project: String,
}

impl UriUpdates {
    /// The individual [`RefUpdate`]s this batch expands to, in the task
    /// store's schema.
    pub fn ref_updates(&self) -> Vec<RefUpdate> {
        self.refs
            .iter()
            .map(|r| RefUpdate::new(self.project.clone(), r.clone(), self.uri.clone(), self.remote.clone()))
            .collect()
    }
}
