use clap::Parser;
use replicate::cli::{Cli, Command};
use replicate::events::{EventSource, RefEvent, StdinEventSource};
use replicate::queue::ReplicationQueue;
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let queue = ReplicationQueue::open(&cli.store, &cli.config, &cli.remotes_dir)?;

    match cli.command {
        None => run_daemon(queue),
        Some(Command::List { json, detail, .. }) => run_list(&queue, json, detail),
        Some(cmd @ Command::Stop { wait, .. }) => run_stop(&queue, cmd.pattern(), wait),
        Some(cmd @ Command::Start { now, wait, .. }) => run_start(&queue, cmd.pattern(), now, wait),
    }
}

/// Foreground daemon mode: start the queue, subscribe to ref-update events
/// on stdin, and block until the event source's input closes.
fn run_daemon(queue: Arc<ReplicationQueue>) -> anyhow::Result<()> {
    queue.start();
    log::info!("replication engine started, watching stdin for ref-update events");

    let sink_queue = Arc::clone(&queue);
    let sink = Arc::new(move |event: RefEvent| match event {
        RefEvent::RefUpdated { project, r#ref, updater } => match sink_queue.on_event(&project, &r#ref, &updater) {
            Ok(created) => log::debug!("{updater}: {created} tasks created for {project}/{r}", r = r#ref),
            Err(e) => log::warn!("failed to record ref update for {project}/{r}: {e}", r = r#ref),
        },
        RefEvent::ProjectCreated { project, updater, head } => {
            let notified = sink_queue.on_project_created(&project, head.as_deref());
            log::debug!("{updater}: {notified} destinations notified of project creation for {project}");
        }
        RefEvent::ProjectDeleted { project, updater } => {
            let notified = sink_queue.on_project_deleted(&project);
            log::debug!("{updater}: {notified} destinations notified of project deletion for {project}");
        }
    });
    StdinEventSource.subscribe(sink);

    queue.stop();
    Ok(())
}

fn run_list(queue: &ReplicationQueue, json: bool, detail: bool) -> anyhow::Result<()> {
    let stats = queue.store().stats();
    if json {
        println!(
            "{}",
            serde_json::json!({ "waiting": stats.waiting, "running": stats.running })
        );
    } else {
        println!("waiting: {}  running: {}", stats.waiting, stats.running);
    }

    if detail {
        for update in queue.store().list_waiting() {
            println!("waiting  {} {} -> {} ({})", update.project, update.r#ref, update.uri, update.remote);
        }
        for update in queue.store().list_running() {
            println!("running  {} {} -> {} ({})", update.project, update.r#ref, update.uri, update.remote);
        }
    }
    Ok(())
}

fn run_stop(queue: &Arc<ReplicationQueue>, pattern: &str, wait: bool) -> anyhow::Result<()> {
    queue.start();
    let matched = queue.pause(pattern).map_err(anyhow::Error::msg)?;
    if wait {
        while queue.is_replaying() {
            std::thread::sleep(std::time::Duration::from_millis(200));
        }
    }
    println!("stopped: {}", matched.join(", "));
    Ok(())
}

fn run_start(queue: &Arc<ReplicationQueue>, pattern: &str, now: bool, wait: bool) -> anyhow::Result<()> {
    queue.start();
    let matched = queue.resume(pattern, now).map_err(anyhow::Error::msg)?;
    if wait {
        while queue.is_replaying() {
            std::thread::sleep(std::time::Duration::from_millis(200));
        }
    }
    println!("started: {}", matched.join(", "));
    Ok(())
}
