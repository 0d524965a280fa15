//! Proxy data models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocol tag attached to an endpoint
///
/// The set is open-ended: any tag that is not recognized is kept verbatim
/// (lowercased) and probed as an HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProxyKind {
    #[default]
    Http,
    Https,
    Socks,
    Ftp,
    Direct,
    Other(String),
}

/// Transport used to reach the target through an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Socks,
    Direct,
}

impl ProxyKind {
    /// Build a kind from a tag, normalizing it to lowercase
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim().to_lowercase();
        match tag.as_str() {
            "http" => ProxyKind::Http,
            "https" => ProxyKind::Https,
            "socks" => ProxyKind::Socks,
            "ftp" => ProxyKind::Ftp,
            "" | "direct" => ProxyKind::Direct,
            _ => ProxyKind::Other(tag),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks => "socks",
            ProxyKind::Ftp => "ftp",
            ProxyKind::Direct => "direct",
            ProxyKind::Other(tag) => tag,
        }
    }

    /// Map the tag onto the transport used at probe time
    pub fn transport(&self) -> Transport {
        match self {
            ProxyKind::Socks => Transport::Socks,
            ProxyKind::Direct => Transport::Direct,
            ProxyKind::Http | ProxyKind::Https | ProxyKind::Ftp | ProxyKind::Other(_) => {
                Transport::Http
            }
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_tag(s))
    }
}

/// Candidate proxy identified by kind, ip and port
///
/// Equality and hashing use all three fields; the ip is stored lowercased.
/// The port is kept wide so that out-of-range values read from noisy input
/// survive until probe time, where they are reported as invalid settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    kind: ProxyKind,
    ip: String,
    port: u32,
}

impl Endpoint {
    pub fn new(kind: ProxyKind, ip: &str, port: u32) -> Self {
        Self {
            kind,
            ip: ip.to_lowercase(),
            port,
        }
    }

    /// Entry inserted by "add server" before the operator edits it
    pub fn placeholder() -> Self {
        Self::new(ProxyKind::Http, "0.0.0.0", 8080)
    }

    pub fn kind(&self) -> &ProxyKind {
        &self.kind
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn set_kind(&mut self, kind: ProxyKind) {
        self.kind = kind;
    }

    pub fn set_ip(&mut self, ip: &str) {
        self.ip = ip.to_lowercase();
    }

    pub fn set_port(&mut self, port: u32) {
        self.port = port;
    }

    /// Get the endpoint in IP:PORT format
    pub fn to_simple_string(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.kind, self.ip, self.port)
    }
}

/// Lifecycle state of a single endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProbeState {
    #[default]
    New,
    Queued,
    Testing,
    Ok,
    Fail,
    Cancelled,
}

/// Mutable status record attached to an endpoint
///
/// Setters are plain field writes. The registry serializes access to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProbeStatus {
    state: ProbeState,
    latency_ms: u64,
    error: Option<String>,
    attempt: u32,
}

impl ProbeStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Latency of the last successful attempt; only meaningful in `Ok`
    pub fn latency_ms(&self) -> u64 {
        self.latency_ms
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn set_state(&mut self, state: ProbeState) {
        self.state = state;
    }

    pub fn set_latency(&mut self, latency_ms: u64) {
        self.latency_ms = latency_ms;
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    pub fn mark_ok(&mut self, latency_ms: u64) {
        self.latency_ms = latency_ms;
        self.error = None;
        self.state = ProbeState::Ok;
    }

    pub fn mark_fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.state = ProbeState::Fail;
    }

    fn attempt_prefix(&self) -> String {
        if self.attempt > 1 {
            format!("# {}: ", self.attempt)
        } else {
            String::new()
        }
    }
}

/// Latency in seconds with two decimals, rounded half-up from the
/// single-precision value so ties such as 0.125 render as "0.13"
fn seconds_two_places(latency_ms: u64) -> String {
    let seconds = f64::from(latency_ms as f32 / 1000.0);
    let hundredths = (seconds * 100.0).round() as u64;
    format!("{}.{:02}", hundredths / 100, hundredths % 100)
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self.state {
            ProbeState::New => "New".to_string(),
            ProbeState::Queued => "Queued".to_string(),
            ProbeState::Cancelled => "Cancelled".to_string(),
            ProbeState::Testing => format!("{}Testing...", self.attempt_prefix()),
            ProbeState::Ok => format!(
                "{}OK {} sec",
                self.attempt_prefix(),
                seconds_two_places(self.latency_ms)
            ),
            ProbeState::Fail => match &self.error {
                Some(error) => format!("{}Test fail. {}", self.attempt_prefix(), error),
                None => format!("{}Test fail.", self.attempt_prefix()),
            },
        };
        // pad so export columns honor width specifiers
        f.pad(&text)
    }
}
