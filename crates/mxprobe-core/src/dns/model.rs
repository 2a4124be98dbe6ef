//! DNS data models.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A mail exchanger advertised for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MxRecord {
    /// Host name, without the trailing root dot.
    pub exchange: String,
    /// Preference; lower wins.
    pub priority: u16,
}

impl MxRecord {
    /// Creates a record, trimming a trailing `.` from the exchange.
    #[must_use]
    pub fn new(exchange: impl Into<String>, priority: u16) -> Self {
        let exchange = exchange.into();
        let exchange = exchange.trim_end_matches('.').to_ascii_lowercase();
        Self { exchange, priority }
    }
}

/// Record types the resolvers know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Mail exchanger.
    Mx,
    /// IPv4 address.
    A,
    /// IPv6 address.
    Aaaa,
    /// Text record.
    Txt,
}

impl RecordKind {
    /// Every kind, in resolution order.
    pub const ALL: [Self; 4] = [Self::Mx, Self::A, Self::Aaaa, Self::Txt];

    /// Lowercase label used in cache keys.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Mx => "mx",
            Self::A => "a",
            Self::Aaaa => "aaaa",
            Self::Txt => "txt",
        }
    }

    /// TTL used when the answer carries none, and for cache hits.
    #[must_use]
    pub const fn default_ttl(self) -> Duration {
        match self {
            Self::Mx => Duration::from_secs(24 * 60 * 60),
            Self::A | Self::Aaaa => Duration::from_secs(60 * 60),
            Self::Txt => Duration::from_secs(4 * 60 * 60),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    /// Served from cache.
    Cache,
    /// Fresh DNS answer.
    Dns,
    /// The lookup failed; records are empty.
    Error,
}

/// Result of resolving one record type for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordResolution<T> {
    /// Normalized domain.
    pub domain: String,
    /// Records found; empty on failure.
    pub records: Vec<T>,
    /// TTL applied to this answer.
    pub ttl_seconds: u64,
    /// Wall time spent resolving.
    pub resolution_time_ms: u64,
    /// Where the records came from.
    pub source: ResolutionSource,
    /// Failure description when `source` is [`ResolutionSource::Error`].
    pub error: Option<String>,
}

/// Combined MX/A/AAAA/TXT view of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainResolution {
    /// Normalized domain.
    pub domain: String,
    /// Mail exchangers in answer order.
    pub mx_records: Vec<MxRecord>,
    /// IPv4 addresses.
    pub a_records: Vec<Ipv4Addr>,
    /// IPv6 addresses.
    pub aaaa_records: Vec<Ipv6Addr>,
    /// Text records.
    pub txt_records: Vec<String>,
    /// At least one MX record.
    pub has_valid_mx: bool,
    /// At least one A record.
    pub has_valid_a: bool,
    /// At least one AAAA record.
    pub has_valid_aaaa: bool,
    /// Wall time for the whole fan-out.
    pub resolution_time_ms: u64,
    /// `error` if any type failed, else `cache` if any was cached, else `dns`.
    pub source: ResolutionSource,
    /// Failures per record type, joined with `; `.
    pub error: Option<String>,
}

/// Lowercases and trims a domain name.
#[must_use]
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().to_ascii_lowercase()
}

/// Milliseconds in `elapsed`, saturating.
pub(crate) fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
