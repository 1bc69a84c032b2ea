//! Immutable configuration snapshot: destinations plus tuning, stamped with a
//! version fingerprint that changes iff the contents of any contributing file
//! changes.

use super::ConfigError;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Which lifecycle events a destination should be considered for. Ordinary
/// ref updates always use `All`; project create/delete use the matching
/// variant so a destination can opt out of mirroring deletes, say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    All,
    ProjectCreation,
    ProjectDeletion,
}

/// Accepts either a bare scalar or a sequence for the same TOML key. TOML has
/// no implicit scalar-to-one-element-sequence coercion, unlike some other
/// config formats, so a field written `url = "..."` in the common single-URL
/// case needs this to parse into the same `Vec<String>` as `url = ["..."]`.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// One configured remote, as loaded from the main config file or a
/// `remotes.d/*.toml` file.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "url", deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, alias = "adminUrl", deserialize_with = "one_or_many")]
    pub admin_urls: Vec<String>,
    #[serde(default, alias = "project")]
    pub projects: Vec<String>,
    #[serde(default)]
    pub ref_filter: Option<String>,
    #[serde(default, alias = "authGroup")]
    pub auth_groups: Vec<String>,
    #[serde(default = "default_delay", alias = "replicationDelay")]
    pub replication_delay_secs: u64,
    #[serde(default = "default_retry", alias = "replicationRetry")]
    pub replication_retry: u32,
    #[serde(default = "default_threads")]
    pub threads: usize,
}

fn default_delay() -> u64 {
    15
}
fn default_retry() -> u32 {
    3
}
fn default_threads() -> usize {
    1
}

/// A destination resolved and validated from a [`RemoteConfig`]: the compiled
/// project/ref matchers, named, ready to drive a [`crate::destination::Destination`].
#[derive(Debug, Clone)]
pub struct Destination {
    pub name: String,
    pub urls: Vec<String>,
    pub admin_urls: Vec<String>,
    project_patterns: Vec<Regex>,
    ref_filter: Option<Regex>,
    pub auth_groups: Vec<String>,
    pub replication_delay_secs: u64,
    pub replication_retry: u32,
    pub threads: usize,
}

impl Destination {
    fn from_config(cfg: RemoteConfig, fallback_name: &str) -> Result<Self, ConfigError> {
        let name = cfg.name.unwrap_or_else(|| fallback_name.to_string());
        let project_patterns = cfg
            .projects
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| ConfigError::Invalid { path: PathBuf::from(&name), reason })?;
        let ref_filter = cfg
            .ref_filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConfigError::Invalid { path: PathBuf::from(&name), reason: e.to_string() })?;

        Ok(Destination {
            name,
            urls: cfg.urls,
            admin_urls: cfg.admin_urls,
            project_patterns,
            ref_filter,
            auth_groups: cfg.auth_groups,
            replication_delay_secs: cfg.replication_delay_secs,
            replication_retry: cfg.replication_retry,
            threads: cfg.threads.max(1),
        })
    }

    /// Whether this destination replicates `project`/`ref` under the given
    /// lifecycle filter. Ordinary ref-update events always pass `All`.
    /// `ProjectCreation`/`ProjectDeletion` events have no `ref` to match
    /// against — the event router passes an empty string for it — so the
    /// ref filter is only consulted for `All`.
    pub fn matches(&self, project: &str, r#ref: &str, mode: FilterMode) -> bool {
        let project_ok = self.project_patterns.is_empty()
            || self.project_patterns.iter().any(|p| p.is_match(project));
        if !project_ok {
            return false;
        }
        match mode {
            FilterMode::All => match &self.ref_filter {
                Some(re) => re.is_match(r#ref),
                None => true,
            },
            FilterMode::ProjectCreation | FilterMode::ProjectDeletion => true,
        }
    }

    /// Expand every configured URL template for `project`, substituting
    /// `${name}`.
    pub fn expand_urls(&self, project: &str) -> Vec<String> {
        self.urls.iter().map(|u| u.replace("${name}", project)).collect()
    }

    #[cfg(test)]
    pub fn for_test(name: &str, delay_secs: u64) -> Self {
        Destination {
            name: name.to_string(),
            urls: Vec::new(),
            admin_urls: Vec::new(),
            project_patterns: Vec::new(),
            ref_filter: None,
            auth_groups: Vec::new(),
            replication_delay_secs: delay_secs,
            replication_retry: 3,
            threads: 1,
        }
    }
}

/// Translate a shell-style glob (`*`, `?`) into an anchored regex. A pattern
/// already wrapped in `^`/`$` is treated as an explicit regex and passed
/// through unchanged.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex, String> {
    if pattern.starts_with('^') && pattern.ends_with('$') {
        return Regex::new(pattern).map_err(|e| e.to_string());
    }
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| e.to_string())
}

/// A stable fingerprint over the content and mtime of every file that
/// contributed to a [`ConfigSnapshot`]. Equal on a no-op re-read; changes on
/// any semantic change to any contributing file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigVersion(String);

impl ConfigVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn fingerprint_files(paths: &[PathBuf]) -> Result<ConfigVersion, ConfigError> {
    let mut sorted = paths.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    for path in &sorted {
        let meta = fs::metadata(path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let body = fs::read(path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(mtime.to_le_bytes());
        hasher.update(&body);
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for b in digest {
        hex.push_str(&format!("{b:02x}"));
    }
    Ok(ConfigVersion(hex))
}

/// Immutable, published view of every destination and the global tuning
/// parameters. Destinations never mutate it; the reload controller swaps the
/// whole `Arc` when a new version is published.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: ConfigVersion,
    pub destinations: BTreeMap<String, Destination>,
    pub auto_reload: bool,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Default)]
struct GeneralSection {
    #[serde(default, alias = "autoReload", alias = "auto-reload")]
    auto_reload: bool,
    #[serde(default = "default_poll_interval", alias = "pollIntervalSecs", alias = "poll-interval-secs")]
    poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    1
}

#[derive(Debug, Deserialize, Default)]
struct MainFile {
    #[serde(default)]
    general: GeneralSection,
    #[serde(default, alias = "remote")]
    remotes: Vec<RemoteConfig>,
}

/// Every file that would contribute to a snapshot loaded from `main_path` /
/// `remotes_dir`, in the same order [`load`] would read them. Listing this
/// does not require any file to parse successfully, so the reload controller
/// can compute [`pending_version`] even when the on-disk config is broken.
fn contributing_files(main_path: &Path, remotes_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();
    if main_path.exists() {
        files.push(main_path.to_path_buf());
    }
    if remotes_dir.is_dir() {
        let mut remote_files: Vec<PathBuf> = fs::read_dir(remotes_dir)
            .map_err(|source| ConfigError::Read { path: remotes_dir.to_path_buf(), source })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
            .collect();
        remote_files.sort();
        files.extend(remote_files);
    }
    Ok(files)
}

/// The version the on-disk config would fingerprint to right now, independent
/// of whether it currently parses. Used by the reload controller to decide
/// whether it's even worth attempting a reparse.
pub fn pending_version(main_path: &Path, remotes_dir: &Path) -> Result<ConfigVersion, ConfigError> {
    fingerprint_files(&contributing_files(main_path, remotes_dir)?)
}

/// Load a [`ConfigSnapshot`] from `main_path` (a TOML file with an optional
/// `[general]` section and zero or more `[[remote]]` tables) plus every
/// `*.toml` file directly under `remotes_dir`, each describing exactly one
/// destination (named after the file stem unless it sets `name` itself).
pub fn load(main_path: &Path, remotes_dir: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let contributing = contributing_files(main_path, remotes_dir)?;

    let main: MainFile = if main_path.exists() {
        let body = fs::read_to_string(main_path)
            .map_err(|source| ConfigError::Read { path: main_path.to_path_buf(), source })?;
        toml::from_str(&body).map_err(|source| ConfigError::Parse { path: main_path.to_path_buf(), source })?
    } else {
        MainFile::default()
    };

    let mut destinations = BTreeMap::new();
    for remote in main.remotes {
        let dest = Destination::from_config(remote, "remote")?;
        destinations.insert(dest.name.clone(), dest);
    }

    for path in contributing.iter().filter(|p| p.as_path() != main_path) {
        let body = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        let remote: RemoteConfig =
            toml::from_str(&body).map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("remote");
        let dest = Destination::from_config(remote, stem)?;
        destinations.insert(dest.name.clone(), dest);
    }

    // Global settings accept an environment override, the way the corpus's
    // own user-config loader layers `Environment::with_prefix` over file
    // values, so operators can flip auto-reload without editing the file.
    let general = config::Config::builder()
        .set_default("auto_reload", main.general.auto_reload)?
        .set_default("poll_interval_secs", main.general.poll_interval_secs)?
        .add_source(config::Environment::with_prefix("REPLICATE"))
        .build()?;

    let version = fingerprint_files(&contributing)?;

    Ok(ConfigSnapshot {
        version,
        destinations,
        auto_reload: general.get_bool("auto_reload").unwrap_or(main.general.auto_reload),
        poll_interval_secs: general
            .get_int("poll_interval_secs")
            .map(|v| v as u64)
            .unwrap_or(main.general.poll_interval_secs),
    })
}
