use std::path::PathBuf;

/// Errors loading or validating a [`ChannelConfig`](crate::ChannelConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the model.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A value is out of range.
    #[error("invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// An unrecognized transport preference.
    #[error("unknown transport {0:?} (expected auto, shm, device or socket)")]
    UnknownTransport(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
