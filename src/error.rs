//! Crate-level error types.

use crate::binding::BindingError;
use crate::device::SampleError;
use crate::event::{CodeParseError, SourceKind};
use crate::key::InvalidKeyName;
use std::path::PathBuf;

/// Configuration could not be read, parsed or validated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Key(#[from] InvalidKeyName),

    #[error(transparent)]
    Code(#[from] CodeParseError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error for hosts embedding the input subsystem.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sample(#[from] SampleError),

    #[error("failed to spawn {0} thread: {1}")]
    Spawn(String, std::io::Error),

    #[error("a {0} source is already running")]
    SourceExists(SourceKind),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
