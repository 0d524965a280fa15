//! Proxy module for probing endpoints through a worker pool
//!
//! This module provides functionality for:
//! - Modelling endpoints and their probe status
//! - Holding them in a shared, lock-protected registry
//! - Probing a single endpoint with a per-attempt timeout
//! - Retrying retryable failures up to a fixed number of attempts
//! - Draining the registry with a fixed-size pool of workers
//! - Importing and exporting line-oriented endpoint lists

pub mod checker;
pub mod models;
pub mod parser;
pub mod pool;
pub mod registry;
pub mod retry;

pub use checker::{CheckerConfig, HttpProbe, Probe, ProbeError, ProbeOutcome};
pub use models::{Endpoint, ProbeState, ProbeStatus, ProxyKind, Transport};
pub use parser::{ImportReport, ProxyParser};
pub use pool::ProbePool;
pub use registry::{Entry, EntryId, Registry, RegistryEvent, RemoveOutcome};
pub use retry::RetryPolicy;
