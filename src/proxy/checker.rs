//! Proxy checker module: operator settings and the single-attempt probe

use crate::error::ConfigError;
use crate::proxy::models::{Endpoint, Transport};
use async_trait::async_trait;
use reqwest::{Client, Proxy as ReqwestProxy, StatusCode, Url};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default timeout for a single attempt in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Default number of concurrent workers
const DEFAULT_WORKERS: usize = 8;

/// Default number of attempts per endpoint
const DEFAULT_ATTEMPTS: u32 = 3;

/// Default URL to test proxies against
const DEFAULT_TEST_URL: &str = "http://httpbin.org/ip";

/// Default user agent for probe requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/76.0.3809.87 Safari/537.36";

pub const MIN_ATTEMPTS: u32 = 1;
pub const MAX_ATTEMPTS: u32 = 10;
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 32;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 60;

/// Operator-configured parameters for a test run
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for connecting and for reading the response, per attempt
    pub timeout: Duration,
    /// Number of concurrent workers
    pub workers: usize,
    /// Attempts per endpoint before giving up
    pub attempts: u32,
    /// URL fetched through each proxy
    pub test_url: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            workers: DEFAULT_WORKERS,
            attempts: DEFAULT_ATTEMPTS,
            test_url: DEFAULT_TEST_URL.to_string(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    /// Check every parameter against the range the operator may choose from
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_ATTEMPTS..=MAX_ATTEMPTS).contains(&self.attempts) {
            return Err(ConfigError::Attempts {
                value: self.attempts,
                min: MIN_ATTEMPTS,
                max: MAX_ATTEMPTS,
            });
        }
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.workers) {
            return Err(ConfigError::Workers {
                value: self.workers,
                min: MIN_WORKERS,
                max: MAX_WORKERS,
            });
        }
        let secs = self.timeout.as_secs();
        let whole_seconds = self.timeout.subsec_nanos() == 0;
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) || !whole_seconds {
            return Err(ConfigError::Timeout {
                value: secs,
                min: MIN_TIMEOUT_SECS,
                max: MAX_TIMEOUT_SECS,
            });
        }
        if self.test_url.trim().is_empty() {
            return Err(ConfigError::EmptyTestUrl);
        }
        Ok(())
    }
}

/// Why a single probe attempt failed
///
/// The variant decides whether another attempt is worth making; the message
/// is what ends up in the endpoint's status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Target URL is not a well-formed absolute URL
    #[error("{0}")]
    MalformedTarget(String),
    /// Proxy address or kind cannot be turned into a transport
    #[error("{0}")]
    InvalidSettings(String),
    #[error("{0}")]
    Timeout(String),
    /// Any other I/O failure, or a non-200 answer
    #[error("{0}")]
    Connect(String),
    #[error("{0}")]
    Unexpected(String),
}

impl ProbeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProbeError::Timeout(_) | ProbeError::Connect(_))
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeError::Timeout(err.to_string())
        } else if err.is_builder() {
            ProbeError::Unexpected(err.to_string())
        } else {
            // connect, request, redirect, body and decode failures
            ProbeError::Connect(err.to_string())
        }
    }
}

/// Latency in milliseconds of a successful attempt
pub type ProbeOutcome = Result<u64, ProbeError>;

/// A single connect-and-fetch attempt through an endpoint
///
/// Implementations must not retry internally.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self, target: &str, endpoint: &Endpoint, timeout: Duration) -> ProbeOutcome;
}

/// Probe that issues a real `GET` through the endpoint with reqwest
#[derive(Debug, Clone)]
pub struct HttpProbe {
    user_agent: String,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(user_agent: String) -> Self {
        Self { user_agent }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn parse_target(target: &str) -> Result<Url, ProbeError> {
        let url = Url::parse(target).map_err(|e| ProbeError::MalformedTarget(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ProbeError::MalformedTarget(format!(
                "unknown protocol: {}",
                other
            ))),
        }
    }

    /// Build the reqwest proxy for the endpoint
    fn create_proxy(endpoint: &Endpoint) -> Result<ReqwestProxy, ProbeError> {
        let port = u16::try_from(endpoint.port()).map_err(|_| {
            ProbeError::InvalidSettings(format!("port out of range:{}", endpoint.port()))
        })?;

        let scheme = match endpoint.kind().transport() {
            Transport::Http => "http",
            Transport::Socks => "socks5",
            Transport::Direct => {
                return Err(ProbeError::InvalidSettings(
                    "type DIRECT is not compatible with address".to_string(),
                ))
            }
        };

        let proxy_url = format!("{}://{}:{}", scheme, endpoint.ip(), port);
        ReqwestProxy::all(&proxy_url).map_err(|e| ProbeError::InvalidSettings(e.to_string()))
    }

    /// Create a reqwest client routed through the endpoint
    fn create_client(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Client, ProbeError> {
        let proxy = Self::create_proxy(endpoint)?;
        Client::builder()
            .proxy(proxy)
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| ProbeError::InvalidSettings(e.to_string()))
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, target: &str, endpoint: &Endpoint, timeout: Duration) -> ProbeOutcome {
        let url = Self::parse_target(target)?;
        let client = self.create_client(endpoint, timeout)?;

        let start = Instant::now();
        let response = match tokio::time::timeout(timeout, client.get(url).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ProbeError::from_reqwest(e)),
            Err(_) => {
                return Err(ProbeError::Timeout(format!(
                    "timed out after {} ms",
                    timeout.as_millis()
                )))
            }
        };
        let elapsed = start.elapsed().as_millis() as u64;

        if response.status() != StatusCode::OK {
            return Err(ProbeError::Connect(format!(
                "Response code:{}",
                response.status().as_u16()
            )));
        }

        Ok(elapsed)
    }
}
