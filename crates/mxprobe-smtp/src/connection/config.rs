//! Session and TLS configuration.

use std::fmt;
use std::time::Duration;

use rustls::SupportedProtocolVersion;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::quirks::ProviderThrottle;
use crate::types::Address;

/// Default SMTP port.
pub const DEFAULT_PORT: u16 = 25;

/// Default timeout for establishing the TCP connection.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single command reply.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default envelope sender.
pub const DEFAULT_SENDER: &str = "probe@example.com";

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2
    #[serde(rename = "TLSv1.2")]
    Tls12,
    /// TLS 1.3
    #[serde(rename = "TLSv1.3")]
    Tls13,
}

impl TlsVersion {
    fn rustls(self) -> &'static SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => f.write_str("TLSv1.2"),
            Self::Tls13 => f.write_str("TLSv1.3"),
        }
    }
}

/// Opportunistic STARTTLS policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsPolicy {
    /// Attempt STARTTLS after EHLO.
    pub enabled: bool,
    /// Verify the server certificate chain and hostname.
    pub reject_unauthorized: bool,
    /// Lowest acceptable protocol version.
    pub min_version: TlsVersion,
    /// Highest acceptable protocol version.
    pub max_version: TlsVersion,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            reject_unauthorized: true,
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
        }
    }
}

impl TlsPolicy {
    /// Protocol versions inside `[min_version, max_version]`.
    #[must_use]
    pub fn protocol_versions(&self) -> Vec<&'static SupportedProtocolVersion> {
        [TlsVersion::Tls12, TlsVersion::Tls13]
            .into_iter()
            .filter(|v| *v >= self.min_version && *v <= self.max_version)
            .map(TlsVersion::rustls)
            .collect()
    }
}

/// Configuration shared by every probing session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Envelope sender used in `MAIL FROM`.
    pub sender: Address,
    /// Name announced in EHLO/HELO.
    pub helo_domain: String,
    /// TCP connect timeout.
    pub connection_timeout: Duration,
    /// Per-command reply timeout.
    pub command_timeout: Duration,
    /// Use PIPELINING when the server advertises it.
    pub enable_pipelining: bool,
    /// STARTTLS policy.
    pub tls: TlsPolicy,
    /// RCPT pacing per recipient domain.
    pub throttle: ProviderThrottle,
}

impl SessionConfig {
    /// Creates a configuration for the given envelope sender.
    ///
    /// The EHLO name defaults to the sender's domain.
    ///
    /// # Errors
    ///
    /// Returns an error if `sender` is not a valid envelope address.
    pub fn new(sender: &str) -> Result<Self> {
        let sender = Address::new(sender)?;
        Ok(Self {
            helo_domain: sender.domain().to_string(),
            sender,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            enable_pipelining: true,
            tls: TlsPolicy::default(),
            throttle: ProviderThrottle::default(),
        })
    }

    /// Sets the EHLO/HELO name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or contains whitespace.
    pub fn helo_domain(mut self, domain: impl Into<String>) -> Result<Self> {
        let domain = domain.into();
        if domain.is_empty() || domain.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::Config(format!("Invalid HELO domain: {domain:?}")));
        }
        self.helo_domain = domain;
        Ok(self)
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets the command timeout.
    #[must_use]
    pub const fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Enables or disables pipelining.
    #[must_use]
    pub const fn enable_pipelining(mut self, enabled: bool) -> Self {
        self.enable_pipelining = enabled;
        self
    }

    /// Sets the TLS policy.
    #[must_use]
    pub fn tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Sets the RCPT pacing table.
    #[must_use]
    pub fn throttle(mut self, throttle: ProviderThrottle) -> Self {
        self.throttle = throttle;
        self
    }
}
