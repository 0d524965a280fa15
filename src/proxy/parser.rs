//! Proxy parser module for importing and exporting endpoint lists
//!
//! Import accepts noisy free text, one candidate per line: the first protocol
//! keyword and the first IPv4 address (with an optional port) found anywhere
//! in the line are used. Only the keyword is required; a line without an
//! address yields an endpoint with an empty ip and port 0. Export writes one
//! tab-separated line per entry.

use crate::error::{ImportError, RegistryError};
use crate::proxy::models::{Endpoint, ProxyKind};
use crate::proxy::registry::{Entry, Registry};
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Protocol keyword, first match anywhere in the line
static PROTOCOL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)https?|socks|ftp").expect("Invalid protocol regex"));

/// IPv4 address, optionally followed by separators and a 1-5 digit port
static ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"((?:(?:1\d\d|2[0-4]\d|25[0-5]|[1-9]\d|\d)\.){3}(?:1\d\d|2[0-4]\d|25[0-5]|[1-9]\d|\d))(?:\W*|:)?(\d{1,5})?",
    )
    .expect("Invalid IPv4 regex")
});

/// Counts reported after a bulk import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Non-empty lines examined
    pub lines: usize,
    /// Endpoints appended to the registry
    pub added: usize,
    /// Lines that could not be parsed
    pub rejected: usize,
    /// Lines that parsed to an endpoint already present
    pub duplicates: usize,
}

/// Parser for endpoint lines
pub struct ProxyParser;

impl ProxyParser {
    /// Extract the protocol keyword from a line
    pub fn extract_kind(line: &str) -> Option<ProxyKind> {
        PROTOCOL_REGEX
            .find(line)
            .map(|m| ProxyKind::from_tag(m.as_str()))
    }

    /// Extract the first IPv4 address and its port (0 when absent)
    pub fn extract_address(line: &str) -> Option<(String, u32)> {
        let caps = ADDRESS_REGEX.captures(line)?;
        let ip = caps.get(1)?.as_str().to_string();
        let port = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        Some((ip, port))
    }

    /// Parse a single line such as `http 1.2.3.4:8080`
    pub fn parse_line(line: &str) -> std::result::Result<Endpoint, ImportError> {
        let kind = Self::extract_kind(line).ok_or(ImportError::MissingProtocol)?;
        let (ip, port) = Self::extract_address(line).unwrap_or_default();
        Ok(Endpoint::new(kind, &ip, port))
    }

    /// Set the ip of entry `index` from free text
    ///
    /// The first IPv4 address in `text` is used; text without one leaves the
    /// entry unchanged and returns false.
    pub fn edit_ip(
        registry: &Registry,
        index: usize,
        text: &str,
    ) -> std::result::Result<bool, RegistryError> {
        match ADDRESS_REGEX.captures(text).and_then(|caps| caps.get(1)) {
            Some(ip) => registry.set_ip(index, ip.as_str()).map(|_| true),
            None => {
                if index >= registry.len() {
                    return Err(RegistryError::IndexOutOfRange {
                        index,
                        len: registry.len(),
                    });
                }
                Ok(false)
            }
        }
    }

    /// Add every parseable line of `content` to the registry
    ///
    /// Bad lines are skipped and counted; they never stop the batch.
    pub fn import_str(registry: &Registry, content: &str) -> ImportReport {
        let mut report = ImportReport::default();

        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            report.lines += 1;

            match Self::parse_line(line) {
                Ok(endpoint) => {
                    if registry.add(endpoint) {
                        report.added += 1;
                    } else {
                        report.duplicates += 1;
                    }
                }
                Err(e) => {
                    tracing::debug!(line, error = %e, "skipping line");
                    report.rejected += 1;
                }
            }
        }

        report
    }

    /// Import endpoints from a file
    pub fn import_file<P: AsRef<Path>>(registry: &Registry, path: P) -> Result<ImportReport> {
        let content = fs::read_to_string(path)?;
        Ok(Self::import_str(registry, &content))
    }

    /// Render one entry as an export line (without the newline)
    pub fn export_line(entry: &Entry) -> String {
        let endpoint = entry.endpoint();
        format!(
            "{}\t{:>10}:{}\t{:>10}",
            endpoint.kind(),
            endpoint.ip(),
            endpoint.port(),
            entry.status()
        )
    }

    /// Write every entry of the registry to `writer`
    pub fn export<W: Write>(registry: &Registry, writer: &mut W) -> Result<usize> {
        let entries = registry.snapshot();
        for entry in &entries {
            writeln!(writer, "{}", Self::export_line(entry))?;
        }
        writer.flush()?;
        Ok(entries.len())
    }

    /// Save the registry to a file, replacing any previous content
    pub fn export_file<P: AsRef<Path>>(registry: &Registry, path: P) -> Result<usize> {
        let mut file = std::io::BufWriter::new(fs::File::create(path)?);
        Self::export(registry, &mut file)
    }
}
