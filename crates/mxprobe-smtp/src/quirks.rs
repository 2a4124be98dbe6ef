//! Provider quirks.
//!
//! Large consumer mailbox providers rate-limit or tarpit clients that fire
//! many RCPT commands back to back. For those domains recipients are probed
//! one at a time with a pause in between, even when PIPELINING is offered.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay applied between RCPT commands for listed providers.
pub const DEFAULT_PROVIDER_DELAY_MS: u64 = 500;

/// Delay applied between sequential RCPT commands for everyone else.
pub const DEFAULT_DELAY_MS: u64 = 200;

/// Domains that get [`DEFAULT_PROVIDER_DELAY_MS`] by default.
pub const THROTTLED_PROVIDERS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "outlook.com",
    "hotmail.com",
    "live.com",
];

/// Per-recipient-domain pacing for RCPT commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderThrottle {
    /// Recipient domain to inter-command delay in milliseconds.
    pub providers: BTreeMap<String, u64>,
    /// Delay between sequential RCPT commands for unlisted domains.
    pub default_delay_ms: u64,
}

impl Default for ProviderThrottle {
    fn default() -> Self {
        Self {
            providers: THROTTLED_PROVIDERS
                .iter()
                .map(|domain| ((*domain).to_string(), DEFAULT_PROVIDER_DELAY_MS))
                .collect(),
            default_delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl ProviderThrottle {
    /// A throttle that never sleeps.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            providers: BTreeMap::new(),
            default_delay_ms: 0,
        }
    }

    /// Returns the provider-specific delay if `domain` is a throttled provider.
    ///
    /// A `Some` result also means pipelining must not be used for the domain.
    #[must_use]
    pub fn provider_delay(&self, domain: &str) -> Option<Duration> {
        self.providers
            .get(&domain.to_ascii_lowercase())
            .map(|ms| Duration::from_millis(*ms))
    }

    /// Delay between sequential RCPT commands for `domain`.
    #[must_use]
    pub fn delay_for(&self, domain: &str) -> Duration {
        self.provider_delay(domain)
            .unwrap_or_else(|| Duration::from_millis(self.default_delay_ms))
    }
}
