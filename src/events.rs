//! Ref-update event ingestion: the boundary between whatever tells this
//! process "ref X of project Y changed" and the router that fans it out.

use std::io::BufRead;
use std::sync::Arc;

/// One notification from the outside world: an ordinary ref update, or a
/// project lifecycle change (create/delete). `kind` picks the variant so a
/// single newline-delimited JSON stream can carry both.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefEvent {
    RefUpdated { project: String, r#ref: String, updater: String },
    ProjectCreated { project: String, updater: String, head: Option<String> },
    ProjectDeleted { project: String, updater: String },
}

/// Where ref-update events come from. `subscribe` blocks the calling thread
/// for the lifetime of the source, invoking `sink` once per event; callers
/// run it on a dedicated thread.
pub trait EventSource {
    fn subscribe(&self, sink: Arc<dyn Fn(RefEvent) + Send + Sync>);
}

/// Reads newline-delimited JSON events from stdin. The natural entry point
/// for a process driven by an external hook or CI system piping events in.
pub struct StdinEventSource;

impl EventSource for StdinEventSource {
    fn subscribe(&self, sink: Arc<dyn Fn(RefEvent) + Send + Sync>) {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("stdin event source: read error: {e}");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RefEvent>(&line) {
                Ok(event) => sink(event),
                Err(e) => log::warn!("stdin event source: skipping malformed line: {e}"),
            }
        }
    }
}

/// In-process event source backed by a channel, used by tests and by the
/// CLI's `inject` debug command to feed synthetic events into a running
/// queue without going through stdin.
pub struct ChannelEventSource {
    receiver: crossbeam_channel::Receiver<RefEvent>,
}

impl ChannelEventSource {
    pub fn new(receiver: crossbeam_channel::Receiver<RefEvent>) -> Self {
        ChannelEventSource { receiver }
    }
}

impl EventSource for ChannelEventSource {
    fn subscribe(&self, sink: Arc<dyn Fn(RefEvent) + Send + Sync>) {
        while let Ok(event) = self.receiver.recv() {
            sink(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn channel_source_delivers_events_in_order() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(RefEvent::RefUpdated { project: "proj".into(), r#ref: "refs/heads/a".into(), updater: "alice".into() }).unwrap();
        tx.send(RefEvent::RefUpdated { project: "proj".into(), r#ref: "refs/heads/b".into(), updater: "alice".into() }).unwrap();
        drop(tx);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_received = Arc::clone(&received);
        ChannelEventSource::new(rx).subscribe(Arc::new(move |e: RefEvent| {
            if let RefEvent::RefUpdated { r#ref, .. } = e {
                sink_received.lock().unwrap().push(r#ref);
            }
        }));

        assert_eq!(*received.lock().unwrap(), vec!["refs/heads/a", "refs/heads/b"]);
    }

    #[test]
    fn stdin_source_parses_lifecycle_events() {
        let body = concat!(
            "{\"kind\":\"project_created\",\"project\":\"proj\",\"updater\":\"alice\",\"head\":\"refs/heads/main\"}\n",
            "{\"kind\":\"project_deleted\",\"project\":\"proj\",\"updater\":\"alice\"}\n",
        );
        let parsed: Vec<RefEvent> = body.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(
            parsed,
            vec![
                RefEvent::ProjectCreated { project: "proj".into(), updater: "alice".into(), head: Some("refs/heads/main".into()) },
                RefEvent::ProjectDeleted { project: "proj".into(), updater: "alice".into() },
            ]
        );
    }
}
