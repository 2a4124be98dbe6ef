//! Engine configuration.
//!
//! Loaded from JSON; every field has a default, so `{}` is a valid file.
//! Durations are whole seconds (`*_secs`).

use std::path::Path;
use std::time::Duration;

use mxprobe_smtp::connection::{DEFAULT_PORT, DEFAULT_SENDER};
use mxprobe_smtp::pool::{
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS_PER_HOST, DEFAULT_SWEEP_INTERVAL,
    DEFAULT_WAIT_TIMEOUT,
};
use mxprobe_smtp::{PoolConfig, ProviderThrottle, SessionConfig, TlsPolicy};
use serde::{Deserialize, Serialize};

use crate::cache::CacheBackend;
use crate::{Error, Result};

/// Default key prefix for cached probe results.
pub const DEFAULT_PROBE_KEY_PREFIX: &str = "smtp:probe:";

/// SMTP session and pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// TCP connect timeout.
    pub connection_timeout_secs: u64,
    /// Per-command reply timeout.
    pub command_timeout_secs: u64,
    /// Port used for every mail exchanger.
    pub smtp_port: u16,
    /// Pool size per `host:port`.
    pub max_connections_per_host: usize,
    /// Idle time after which a pooled session is stale.
    pub idle_timeout_secs: u64,
    /// Interval between stale-session sweeps.
    pub sweep_interval_secs: u64,
    /// How long a checkout waits for a free slot.
    pub pool_wait_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 10,
            command_timeout_secs: 5,
            smtp_port: DEFAULT_PORT,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            pool_wait_timeout_secs: DEFAULT_WAIT_TIMEOUT.as_secs(),
        }
    }
}

impl SessionSettings {
    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Command timeout as a [`Duration`].
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Batching and concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// RCPT commands per session chunk.
    pub batch_size: usize,
    /// Lower clamp for `batch_size`.
    pub min_batch_size: usize,
    /// Upper clamp for `batch_size`.
    pub max_batch_size: usize,
    /// Shards probed at the same time.
    pub max_concurrent_shards: usize,
    /// Use PIPELINING when offered.
    pub enable_pipelining: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            min_batch_size: 1,
            max_batch_size: 100,
            max_concurrent_shards: 5,
            enable_pipelining: true,
        }
    }
}

impl BatchSettings {
    /// `batch_size` clamped to `[min_batch_size, max_batch_size]`.
    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        let min = self.min_batch_size.max(1);
        self.batch_size.clamp(min, self.max_batch_size.max(min))
    }
}

/// Mail exchanger selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MxSettings {
    /// TTL of the sharding service's own MX cache.
    pub cache_ttl_secs: u64,
    /// Mail exchangers tried per domain.
    pub max_mx_records: usize,
}

impl Default for MxSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            max_mx_records: 3,
        }
    }
}

/// Resolver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    /// Per-query timeout.
    pub timeout_secs: u64,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

/// Probe result cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Which backend to build.
    pub backend: CacheBackend,
    /// TTL for cached probe results.
    pub probe_ttl_secs: u64,
    /// Prefix for probe result keys.
    pub key_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            probe_ttl_secs: 3600,
            key_prefix: DEFAULT_PROBE_KEY_PREFIX.to_string(),
        }
    }
}

/// Job queue workers and retention of finished jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Concurrent workers.
    pub workers: usize,
    /// Completed jobs kept for status queries.
    pub keep_completed: usize,
    /// Failed or cancelled jobs kept for status queries.
    pub keep_failed: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            keep_completed: 100,
            keep_failed: 50,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Envelope sender; its domain is used for EHLO.
    pub sender: String,
    /// Session and pool settings.
    pub session: SessionSettings,
    /// Batching and concurrency.
    pub batch: BatchSettings,
    /// Mail exchanger selection.
    pub mx: MxSettings,
    /// Resolver settings.
    pub dns: DnsSettings,
    /// STARTTLS policy.
    pub tls: TlsPolicy,
    /// Probe result cache.
    pub cache: CacheSettings,
    /// RCPT pacing per recipient domain.
    pub throttle: ProviderThrottle,
    /// Job queue.
    pub queue: QueueSettings,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            sender: DEFAULT_SENDER.to_string(),
            session: SessionSettings::default(),
            batch: BatchSettings::default(),
            mx: MxSettings::default(),
            dns: DnsSettings::default(),
            tls: TlsPolicy::default(),
            cache: CacheSettings::default(),
            throttle: ProviderThrottle::default(),
            queue: QueueSettings::default(),
        }
    }
}

impl ProbeConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serde`] for malformed JSON and [`Error::Config`] for
    /// invalid values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise as
    /// [`Self::from_json_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Rejects settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.session.max_connections_per_host == 0 {
            return Err(Error::Config("max_connections_per_host must be at least 1".into()));
        }
        if self.batch.max_concurrent_shards == 0 {
            return Err(Error::Config("max_concurrent_shards must be at least 1".into()));
        }
        if self.batch.min_batch_size > self.batch.max_batch_size {
            return Err(Error::Config(format!(
                "min_batch_size {} exceeds max_batch_size {}",
                self.batch.min_batch_size, self.batch.max_batch_size
            )));
        }
        if self.mx.max_mx_records == 0 {
            return Err(Error::Config("max_mx_records must be at least 1".into()));
        }
        if self.session.connection_timeout_secs == 0 || self.session.command_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be at least one second".into()));
        }
        if self.tls.min_version > self.tls.max_version {
            return Err(Error::Config(format!(
                "TLS min_version {} is above max_version {}",
                self.tls.min_version, self.tls.max_version
            )));
        }
        mxprobe_smtp::Address::new(&*self.sender)
            .map_err(|e| Error::Config(format!("sender {:?}: {e}", self.sender)))?;
        Ok(())
    }

    /// Session settings for the SMTP layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender address is invalid.
    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig::new(&self.sender)?
            .connection_timeout(self.session.connection_timeout())
            .command_timeout(self.session.command_timeout())
            .enable_pipelining(self.batch.enable_pipelining)
            .tls(self.tls.clone())
            .throttle(self.throttle.clone()))
    }

    /// Pool settings for the SMTP layer.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .max_connections_per_host(self.session.max_connections_per_host)
            .idle_timeout(Duration::from_secs(self.session.idle_timeout_secs))
            .sweep_interval(Duration::from_secs(self.session.sweep_interval_secs))
            .wait_timeout(Duration::from_secs(self.session.pool_wait_timeout_secs))
    }

    /// TTL for cached probe results.
    #[must_use]
    pub const fn probe_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.probe_ttl_secs)
    }

    /// TTL for the sharding MX cache.
    #[must_use]
    pub const fn mx_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.mx.cache_ttl_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use mxprobe_smtp::TlsVersion;

    #[test]
    fn empty_document_gives_defaults() {
        let config = ProbeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ProbeConfig::default());
        assert_eq!(config.session.smtp_port, 25);
        assert_eq!(config.batch.effective_batch_size(), 20);
        assert_eq!(config.cache.key_prefix, "smtp:probe:");
        assert_eq!(config.mx.max_mx_records, 3);
        assert_eq!(config.queue.keep_completed, 100);
        assert_eq!(config.queue.keep_failed, 50);
        assert_eq!(
            config.throttle.provider_delay("gmail.com"),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = ProbeConfig::from_json_str(
            r#"{
                "sender": "verify@probe.example.net",
                "batch": { "batch_size": 500 },
                "tls": { "enabled": true, "min_version": "TLSv1.3" },
                "cache": { "backend": "disabled" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.batch.effective_batch_size(), 100);
        assert_eq!(config.batch.max_concurrent_shards, 5);
        assert!(config.tls.enabled);
        assert_eq!(config.tls.min_version, TlsVersion::Tls13);
        assert!(config.tls.reject_unauthorized);
        assert_eq!(config.cache.backend, CacheBackend::Disabled);

        let session = config.session_config().unwrap();
        assert_eq!(session.helo_domain, "probe.example.net");
        assert!(session.tls.enabled);
    }

    #[test]
    fn rejects_unusable_settings() {
        let cases = [
            r#"{"session": {"max_connections_per_host": 0}}"#,
            r#"{"batch": {"max_concurrent_shards": 0}}"#,
            r#"{"batch": {"min_batch_size": 10, "max_batch_size": 5}}"#,
            r#"{"mx": {"max_mx_records": 0}}"#,
            r#"{"session": {"command_timeout_secs": 0}}"#,
            r#"{"tls": {"min_version": "TLSv1.3", "max_version": "TLSv1.2"}}"#,
            r#"{"sender": "not-an-address"}"#,
        ];
        for case in cases {
            assert!(
                matches!(ProbeConfig::from_json_str(case), Err(Error::Config(_))),
                "{case} should be rejected"
            );
        }
    }

    #[test]
    fn malformed_json_is_a_serde_error() {
        assert!(matches!(
            ProbeConfig::from_json_str("{"),
            Err(Error::Serde(_))
        ));
    }

    #[test]
    fn pool_settings_carry_over() {
        let mut config = ProbeConfig::default();
        config.session.max_connections_per_host = 4;
        config.session.idle_timeout_secs = 30;
        let pool = config.pool_config();
        assert_eq!(pool.max_connections_per_host, 4);
        assert_eq!(pool.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("mxprobe-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"mx": {"max_mx_records": 2}}"#).unwrap();
        let config = ProbeConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.mx.max_mx_records, 2);
        assert!(matches!(
            ProbeConfig::from_file(&path),
            Err(Error::Io(_))
        ));
    }
}
