//! Configuration loading: one main TOML file plus optional per-remote files
//! under a `remotes.d/` directory, published as an immutable, version-stamped
//! [`ConfigSnapshot`].

mod error;
mod reload;
mod snapshot;

pub use error::ConfigError;
pub use reload::{ReloadController, ReloadOutcome};
pub use snapshot::{load, pending_version, ConfigSnapshot, ConfigVersion, Destination, FilterMode, RemoteConfig};
pub(crate) use snapshot::glob_to_regex;
