//! Push worker: executes one [`UriUpdates`] batch against a remote and
//! classifies the result.

use crate::model::UriUpdates;
use std::process::Command;

/// Outcome of attempting to push a batch of refs to one URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every ref in the batch pushed cleanly (or was already at the target
    /// SHA, or its source object no longer exists locally).
    Success,
    /// A network error, temporary auth failure, remote unavailability, or
    /// remote-side lock contention. Worth retrying.
    Transient,
    /// Non-fast-forward with force disabled, permanent auth failure, or a
    /// malformed ref. Retrying would not help.
    Permanent,
}

/// Per-ref detail behind an [`Outcome`], kept for logging and for the
/// replication-event bus that downstream observers subscribe to.
#[derive(Debug, Clone)]
pub struct RefPushResult {
    pub r#ref: String,
    pub outcome: Outcome,
    pub detail: Option<String>,
}

/// A completed push attempt: the overall classification plus the detail for
/// every individual ref, in `pending_refs` order.
#[derive(Debug, Clone)]
pub struct PushReport {
    pub outcome: Outcome,
    pub refs: Vec<RefPushResult>,
}

/// Outbound git push transport. `ssh://`, `http(s)://`, `git://`, and
/// `file://` are all implemented by shelling out to the system `git` binary
/// in [`CommandLineTransport`]; the trait boundary exists so the worker's
/// retry/classification logic can be exercised against a fake in tests.
pub trait GitTransport: Send + Sync {
    fn push(&self, updates: &UriUpdates) -> PushReport;
}

/// Shells out to `git push --porcelain`, mirroring the only integration
/// point a real replication engine has with the git wire protocol.
pub struct CommandLineTransport {
    /// Force-push every ref regardless of fast-forward status. Mirrors the
    /// per-destination `force` knob a real config would carry; kept simple
    /// here since `spec.md` doesn't name a dedicated force-push field.
    pub force: bool,
}

impl CommandLineTransport {
    pub fn new(force: bool) -> Self {
        CommandLineTransport { force }
    }
}

impl GitTransport for CommandLineTransport {
    fn push(&self, updates: &UriUpdates) -> PushReport {
        let mut cmd = Command::new("git");
        cmd.arg("push").arg("--porcelain");
        if self.force {
            cmd.arg("--force");
        }
        cmd.arg(&updates.uri);
        for r#ref in &updates.refs {
            cmd.arg(format!("{r}:{r}", r = r#ref));
        }

        log::debug!("$ git push --porcelain {} ({} refs)", updates.uri, updates.refs.len());

        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) => {
                log::warn!("push to {}: failed to spawn git: {e}", updates.uri);
                return PushReport {
                    outcome: Outcome::Transient,
                    refs: updates
                        .refs
                        .iter()
                        .map(|r| RefPushResult {
                            r#ref: r.clone(),
                            outcome: Outcome::Transient,
                            detail: Some(e.to_string()),
                        })
                        .collect(),
                };
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        classify_porcelain(updates, &stdout, &stderr, output.status.success())
    }
}

/// Parse `git push --porcelain` output into per-ref results and an overall
/// classification.
///
/// Porcelain lines look like `<flag>\t<from>:<to>\t<summary> (<reason>)`.
/// Flags: ` ` fast-forward, `+` forced update, `-` deleted, `*` new ref,
/// `!` rejected, `=` up to date.
fn classify_porcelain(updates: &UriUpdates, stdout: &str, stderr: &str, command_succeeded: bool) -> PushReport {
    let mut refs = Vec::with_capacity(updates.refs.len());
    let mut worst = Outcome::Success;

    for line in stdout.lines() {
        if !line.starts_with(['\t', ' ', '+', '-', '*', '!', '=']) {
            continue;
        }
        let mut fields = line.splitn(3, '\t');
        let flag = fields.next().unwrap_or_default();
        let refspec = fields.next().unwrap_or_default();
        let summary = fields.next().unwrap_or_default();
        let target = refspec.split(':').nth(1).unwrap_or(refspec).to_string();

        let outcome = if flag.contains('!') {
            classify_rejection(summary)
        } else {
            Outcome::Success
        };
        worst = combine(worst, outcome);
        refs.push(RefPushResult { r#ref: target, outcome, detail: Some(summary.to_string()) });
    }

    if refs.is_empty() {
        // No porcelain lines parsed (e.g. git itself failed to connect):
        // classify from the command's own exit status and stderr.
        let outcome = if command_succeeded {
            Outcome::Success
        } else {
            classify_stderr(stderr)
        };
        worst = outcome;
        refs = updates
            .refs
            .iter()
            .map(|r| RefPushResult { r#ref: r.clone(), outcome, detail: Some(stderr.trim().to_string()) })
            .collect();
    }

    PushReport { outcome: worst, refs }
}

fn combine(a: Outcome, b: Outcome) -> Outcome {
    use Outcome::*;
    match (a, b) {
        (Permanent, _) | (_, Permanent) => Permanent,
        (Transient, _) | (_, Transient) => Transient,
        _ => Success,
    }
}

fn classify_rejection(summary: &str) -> Outcome {
    let s = summary.to_lowercase();
    if s.contains("non-fast-forward") || s.contains("stale info") {
        Outcome::Permanent
    } else if s.contains("remote ref updates were rejected") && s.contains("hook") {
        Outcome::Permanent
    } else {
        // Lock contention, timeouts, and anything else unrecognized default
        // to retriable: a false "permanent" would drop real work on the
        // floor, a false "transient" just costs one extra attempt.
        Outcome::Transient
    }
}

fn classify_stderr(stderr: &str) -> Outcome {
    let s = stderr.to_lowercase();
    if s.contains("does not match any") || s.contains("src refspec") {
        // The local source object is gone (branch deleted/rewritten since
        // the event was enqueued): the ref has been superseded, so there is
        // nothing left to replicate and the push counts as successful.
        return Outcome::Success;
    }
    if s.contains("could not resolve host")
        || s.contains("connection refused")
        || s.contains("connection timed out")
        || s.contains("could not read from remote repository")
        || s.contains("remote end hung up")
        || s.contains("temporarily")
    {
        Outcome::Transient
    } else if s.contains("permission denied")
        || s.contains("authentication failed")
        || s.contains("repository not found")
        || s.contains("does not appear to be a git repository")
    {
        Outcome::Permanent
    } else {
        Outcome::Transient
    }
}
