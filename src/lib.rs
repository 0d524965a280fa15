//! Proxy Prober - concurrent batch proxy tester
//!
//! Endpoints are kept in a shared registry. A fixed-size pool of workers
//! claims queued endpoints one at a time, fetches a target URL through each
//! of them with bounded retries, and writes every status change back to the
//! registry, where observers can follow progress.

pub mod error;
pub mod proxy;

pub use error::{ConfigError, ImportError, RegistryError};
pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
