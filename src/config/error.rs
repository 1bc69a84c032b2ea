use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: toml::de::Error },
    Layered(config::ConfigError),
    Invalid { path: PathBuf, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => write!(f, "failed to read {}: {source}", path.display()),
            ConfigError::Parse { path, source } => write!(f, "failed to parse {}: {source}", path.display()),
            ConfigError::Layered(e) => write!(f, "failed to load configuration: {e}"),
            ConfigError::Invalid { path, reason } => write!(f, "invalid configuration in {}: {reason}", path.display()),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Layered(e)
    }
}
