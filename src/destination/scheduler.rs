//! The `PushOne` state machine: one entry per (destination, uri), coalescing
//! ref arrivals into batches and tracking retry/backoff state in memory.
//!
//! The backing [`crate::store::TaskStore`] is the durable source of truth;
//! everything in here is an in-memory index rebuilt from `resetAll()` +
//! `listWaiting()` on startup. Losing this table costs at most one coalescing
//! window, never a task.

use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Spec names `Pending`, `Scheduled`, `Running`, and `Retrying`. `Pending` is
/// the instant between "a task was just created" and "a timer got armed for
/// it", which in this implementation happens inside a single locked section
/// of [`enqueue`](PushOne::enqueue) — there's no externally observable
/// interval where a `PushOne` sits in that state, so it collapses into
/// `Scheduled` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOneState {
    Scheduled,
    Running,
    Retrying,
}

/// One coalescing unit for a single (destination, uri) pair.
pub struct PushOne {
    pub uri: String,
    pub project: String,
    state: PushOneState,
    /// Refs waiting for the next dispatch. While `Running`, newly arrived
    /// refs accumulate here too (the spec's "shadow set") rather than being
    /// merged into the batch a worker already took a snapshot of; draining
    /// this set at dispatch time is what both starts a fresh batch and
    /// collects the next one.
    refs: HashSet<String>,
    fire_at: Instant,
    retries_left: u32,
    max_retries: u32,
    base_delay: Duration,
}

/// What the scheduler tick loop should do with a `PushOne` it's inspecting.
pub enum TickAction {
    /// Not due yet, or already running.
    Wait,
    /// Due: take this batch of refs and dispatch a push for them.
    Dispatch(Vec<String>),
}

impl PushOne {
    fn new(project: &str, uri: &str, r#ref: &str, delay: Duration, max_retries: u32) -> Self {
        let mut refs = HashSet::new();
        refs.insert(r#ref.to_string());
        PushOne {
            uri: uri.to_string(),
            project: project.to_string(),
            state: PushOneState::Scheduled,
            refs,
            fire_at: Instant::now() + delay,
            retries_left: max_retries,
            max_retries,
            base_delay: delay,
        }
    }

    pub fn state(&self) -> PushOneState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == PushOneState::Running
    }

    /// Implements the enqueue protocol's four coalescing cases. Returns
    /// `true` when this is the first ref attached to a freshly-created
    /// `PushOne` (the caller needs this to decide whether to build one).
    pub fn add_ref(&mut self, r#ref: &str) {
        match self.state {
            // Case 2 / 4: already waiting for its timer, or waiting to
            // retry — merge in without resetting the clock.
            PushOneState::Scheduled | PushOneState::Retrying => {
                self.refs.insert(r#ref.to_string());
            }
            // Case 3: a push is in flight; buffer for the successor batch
            // that forms once this one completes.
            PushOneState::Running => {
                self.refs.insert(r#ref.to_string());
            }
        }
    }

    /// Is this `PushOne` due to fire right now?
    pub fn ready(&self, now: Instant) -> bool {
        matches!(self.state, PushOneState::Scheduled | PushOneState::Retrying) && self.fire_at <= now
    }

    /// As [`ready`](Self::ready), but `force` skips the `fire_at` check
    /// (still refuses to double-dispatch a `Running` entry).
    pub fn ready_or_forced(&self, now: Instant, force: bool) -> bool {
        let waiting = matches!(self.state, PushOneState::Scheduled | PushOneState::Retrying);
        waiting && (force || self.fire_at <= now)
    }

    /// Take the current batch and transition to `Running`. The returned set
    /// becomes one [`crate::model::UriUpdates`] for the worker; `self.refs`
    /// is left empty to receive shadow arrivals.
    pub fn begin_dispatch(&mut self) -> Vec<String> {
        self.state = PushOneState::Running;
        self.refs.drain().collect()
    }

    /// Push succeeded, or failed permanently (no point retrying). If refs
    /// arrived while running, rearm for one more round; otherwise this
    /// `PushOne` is done and the caller should remove it from the table.
    pub fn complete(&mut self) -> bool {
        self.retries_left = self.max_retries;
        if self.refs.is_empty() {
            false
        } else {
            self.state = PushOneState::Scheduled;
            self.fire_at = Instant::now() + self.base_delay;
            true
        }
    }

    /// Push failed transiently. Returns `true` if a retry was armed, `false`
    /// if retries are exhausted (caller should finish the task as failed).
    pub fn fail_transient(&mut self) -> bool {
        if self.retries_left == 0 {
            return self.complete();
        }
        let attempt = self.max_retries - self.retries_left;
        self.retries_left -= 1;
        self.state = PushOneState::Retrying;
        self.fire_at = Instant::now() + backoff(self.base_delay, attempt);
        true
    }

    /// Drop any armed retry timer, leaving durable state untouched. Used
    /// when the owning destination is asked to stop; a `Scheduled` or
    /// `Retrying` `PushOne` simply vanishes from memory; the underlying task
    /// stays `Waiting` in the store for the next start to pick back up.
    pub fn cancelable(&self) -> bool {
        !self.is_running()
    }
}

/// `delay * 2^attempt`, capped at `max(60s, 8*delay)`.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let doubled = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let cap = Duration::from_secs(60).max(base * 8);
    doubled.min(cap)
}

pub fn new_push_one(project: &str, uri: &str, r#ref: &str, delay: Duration, max_retries: u32) -> PushOne {
    PushOne::new(project, uri, r#ref, delay, max_retries)
}
