//! Project lifecycle operations (create/delete/update-HEAD) against a
//! destination's admin endpoint. Unlike ref pushes these are best-effort:
//! callers log and move on rather than retrying through the task store.

use std::fs;
use std::path::{Path, PathBuf};

/// Admin-side lifecycle operations for a destination. Every method returns
/// `Ok(false)` rather than an error or a panic when the operation can't be
/// carried out — the caller has nowhere durable to retry this from, so the
/// contract is "best effort, never crash the daemon".
pub trait AdminTransport: Send + Sync {
    fn create_project(&self, admin_url: &str, project: &str, head: Option<&str>) -> bool;
    fn delete_project(&self, admin_url: &str, project: &str) -> bool;
    fn update_head(&self, admin_url: &str, project: &str, head: &str) -> bool;
}

/// `file://` admin endpoint: the destination is a directory of bare repos on
/// a filesystem this process can reach directly (typically NFS or a local
/// mirror root).
pub struct LocalFs;

impl LocalFs {
    fn repo_path(admin_url: &str, project: &str) -> Option<PathBuf> {
        let root = admin_url.strip_prefix("file://")?;
        Some(Path::new(root).join(format!("{project}.git")))
    }
}

impl AdminTransport for LocalFs {
    fn create_project(&self, admin_url: &str, project: &str, head: Option<&str>) -> bool {
        let Some(path) = Self::repo_path(admin_url, project) else {
            log::warn!("create_project: {admin_url} is not a file:// admin url");
            return false;
        };
        if let Err(e) = fs::create_dir_all(&path) {
            log::warn!("create_project {project}: mkdir {}: {e}", path.display());
            return false;
        }
        if let Err(e) = std::process::Command::new("git").arg("init").arg("--bare").arg(&path).output() {
            log::warn!("create_project {project}: git init --bare: {e}");
            return false;
        }
        // Only a `refs/...` HEAD is well-formed as a symbolic ref target;
        // anything else (a bare SHA, an empty string) is left alone rather
        // than writing a detached HEAD a replica never asked for.
        if let Some(head) = head {
            if head.starts_with("refs/") {
                return Self.update_head(admin_url, project, head);
            }
        }
        true
    }

    fn delete_project(&self, admin_url: &str, project: &str) -> bool {
        let Some(path) = Self::repo_path(admin_url, project) else {
            log::warn!("delete_project: {admin_url} is not a file:// admin url");
            return false;
        };
        match fs::remove_dir_all(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                log::warn!("delete_project {project}: rmdir {}: {e}", path.display());
                false
            }
        }
    }

    fn update_head(&self, admin_url: &str, project: &str, head: &str) -> bool {
        let Some(path) = Self::repo_path(admin_url, project) else {
            log::warn!("update_head: {admin_url} is not a file:// admin url");
            return false;
        };
        let tmp = path.join("HEAD.tmp");
        if let Err(e) = fs::write(&tmp, format!("ref: {head}\n")) {
            log::warn!("update_head {project}: write HEAD.tmp: {e}");
            return false;
        }
        if let Err(e) = fs::rename(&tmp, path.join("HEAD")) {
            log::warn!("update_head {project}: rename HEAD.tmp: {e}");
            return false;
        }
        true
    }
}

/// `ssh://` admin endpoint (e.g. `gerrit admin ...` over SSH). No live
/// implementation ships; configuring an `ssh://` admin URL is accepted but
/// every call logs and returns `Ok(false)` rather than silently succeeding.
pub struct Ssh;

impl AdminTransport for Ssh {
    fn create_project(&self, admin_url: &str, project: &str, _head: Option<&str>) -> bool {
        log::warn!("create_project {project}: ssh admin transport {admin_url} is not implemented");
        false
    }

    fn delete_project(&self, admin_url: &str, project: &str) -> bool {
        log::warn!("delete_project {project}: ssh admin transport {admin_url} is not implemented");
        false
    }

    fn update_head(&self, admin_url: &str, project: &str, _head: &str) -> bool {
        log::warn!("update_head {project}: ssh admin transport {admin_url} is not implemented");
        false
    }
}

/// `http(s)://` REST admin endpoint. Same placeholder contract as [`Ssh`].
pub struct Rest;

impl AdminTransport for Rest {
    fn create_project(&self, admin_url: &str, project: &str, _head: Option<&str>) -> bool {
        log::warn!("create_project {project}: rest admin transport {admin_url} is not implemented");
        false
    }

    fn delete_project(&self, admin_url: &str, project: &str) -> bool {
        log::warn!("delete_project {project}: rest admin transport {admin_url} is not implemented");
        false
    }

    fn update_head(&self, admin_url: &str, project: &str, _head: &str) -> bool {
        log::warn!("update_head {project}: rest admin transport {admin_url} is not implemented");
        false
    }
}

/// Pick the right transport for an admin URL's scheme.
pub fn for_url(admin_url: &str) -> Box<dyn AdminTransport> {
    if admin_url.starts_with("file://") {
        Box::new(LocalFs)
    } else if admin_url.starts_with("ssh://") {
        Box::new(Ssh)
    } else if admin_url.starts_with("http://") || admin_url.starts_with("https://") {
        Box::new(Rest)
    } else {
        log::warn!("admin url {admin_url} has an unrecognized scheme, falling back to ssh placeholder");
        Box::new(Ssh)
    }
}
