//! Error types for engine bring-up and configuration parsing.

use thiserror::Error;

/// Failures that prevent the engine or a handle from existing at all.
#[derive(Debug, Error)]
pub enum Error {
    /// `curl_global_init` failed
    #[error("libcurl global initialization failed: {0}")]
    GlobalInit(curl::Error),

    /// The shared DNS/TLS/connection cache could not be created or configured
    #[error("libcurl share handle setup failed: {0}")]
    Share(String),

    /// The multiplexer rejected a callback registration
    #[error("libcurl multi handle setup failed: {0}")]
    Multi(#[from] curl::MultiError),

    /// The readiness notifier could not be created
    #[error("poll setup failed: {0}")]
    Poll(#[source] std::io::Error),

    /// A worker thread could not be spawned
    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// No libcurl easy handle could be allocated or configured
    #[error("failed to allocate a libcurl easy handle: {0}")]
    EasyAlloc(curl::Error),
}

/// A comma-separated `key=value` string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An entry has no `=`
    #[error("entry {0:?} is not a key=value pair")]
    MissingSeparator(String),

    /// The key is not known to this parser
    #[error("unknown key {0:?}")]
    UnknownKey(String),

    /// The key is known but its value does not parse
    #[error("invalid value {value:?} for key {key:?}")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: &str) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
