//! Error types shared across the crate

use thiserror::Error;

/// Operator parameter outside its accepted range
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("attempts must be between {min} and {max}, got {value}")]
    Attempts { value: u32, min: u32, max: u32 },
    #[error("workers must be between {min} and {max}, got {value}")]
    Workers { value: usize, min: usize, max: usize },
    #[error("timeout must be between {min} and {max} seconds, got {value}")]
    Timeout { value: u64, min: u64, max: u64 },
    #[error("test url must not be empty")]
    EmptyTestUrl,
}

/// Registry operation rejected by its contract
///
/// The registry is left untouched when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("index {index} is out of range (registry holds {len} entries)")]
    IndexOutOfRange { index: usize, len: usize },
}

/// A single import line that could not be turned into an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImportError {
    #[error("no protocol keyword (http, https, socks, ftp) in line")]
    MissingProtocol,
}
