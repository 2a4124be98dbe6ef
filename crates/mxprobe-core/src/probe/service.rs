//! Probe orchestration.
//!
//! [`Prober`] ties the pieces together: cached results are served first,
//! addresses are sharded by domain, shards run concurrently (bounded by
//! `max_concurrent_shards`), and each shard walks its mail exchangers in
//! priority order until one of them answers every address.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mxprobe_smtp::{ConnectionPool, PoolStats, TcpTransport, Transport};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::model::{BatchResult, ProbeCacheStats, ProbeResult, ProbeStats, ProbeStatus, StatsRecorder};
use crate::cache::CacheProvider;
use crate::config::ProbeConfig;
use crate::dns::{DnsLookup, DomainResolver, HickoryLookup};
use crate::progress::{Milestone, Progress};
use crate::sharding::{EmailShard, MxSharding, ShardPlan};
use crate::Result;

/// Message reported for addresses whose domain has no mail exchangers.
pub const NO_MX_MESSAGE: &str = "No valid MX records found";

/// Canonical form of an address: trimmed and lowercased.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

struct Inner<T: Transport> {
    config: ProbeConfig,
    cache: Arc<dyn CacheProvider>,
    resolver: Arc<DomainResolver>,
    sharding: MxSharding,
    pool: Arc<ConnectionPool<T>>,
    stats: Mutex<StatsRecorder>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Deliverability probe engine.
///
/// Cheap to clone; clones share the cache, resolver and connection pool.
pub struct Prober<T: Transport = TcpTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Prober<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for Prober<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prober")
            .field("sender", &self.inner.config.sender)
            .field("cache", &self.inner.cache)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

impl Prober<TcpTransport> {
    /// Builds an engine that resolves through the system resolver and
    /// connects over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the system
    /// resolver configuration cannot be read.
    pub fn from_config(config: ProbeConfig) -> Result<Self> {
        let lookup = HickoryLookup::from_system_conf(Duration::from_secs(config.dns.timeout_secs))?;
        Self::new(config, Arc::new(lookup), TcpTransport)
    }
}

impl<T: Transport> Prober<T> {
    /// Builds an engine with the cache backend named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the configuration
    /// is invalid.
    pub fn new(config: ProbeConfig, lookup: Arc<dyn DnsLookup>, transport: T) -> Result<Self> {
        let cache = config.cache.backend.build();
        Self::with_cache(config, lookup, transport, cache)
    }

    /// Builds an engine on an existing cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the configuration
    /// is invalid.
    pub fn with_cache(
        config: ProbeConfig,
        lookup: Arc<dyn DnsLookup>,
        transport: T,
        cache: Arc<dyn CacheProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let session = Arc::new(config.session_config()?);
        let pool = Arc::new(ConnectionPool::new(transport, session, config.pool_config()));
        let resolver = Arc::new(DomainResolver::new(lookup, Arc::clone(&cache)));
        let sharding = MxSharding::new(
            Arc::clone(&resolver),
            Arc::clone(&cache),
            config.mx_cache_ttl(),
            config.mx.max_mx_records,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cache,
                resolver,
                sharding,
                pool,
                stats: Mutex::new(StatsRecorder::default()),
                sweeper: Mutex::new(None),
            }),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &ProbeConfig {
        &self.inner.config
    }

    /// Domain resolver shared with the sharding service.
    #[must_use]
    pub fn resolver(&self) -> &DomainResolver {
        &self.inner.resolver
    }

    /// Sharding service.
    #[must_use]
    pub fn sharding(&self) -> &MxSharding {
        &self.inner.sharding
    }

    fn sweeper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recorder(&self) -> MutexGuard<'_, StatsRecorder> {
        self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the background sweep of stale pooled sessions.
    ///
    /// Calling it again while the sweeper runs does nothing.
    pub fn start_maintenance(&self) {
        let mut sweeper = self.sweeper();
        if sweeper.as_ref().is_none_or(JoinHandle::is_finished) {
            *sweeper = Some(self.inner.pool.spawn_sweeper());
        }
    }

    /// Stops the sweeper and closes every pooled session.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper().take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
        self.inner.pool.close().await;
        tracing::info!("prober shut down");
    }

    fn cache_key(&self, email: &str) -> String {
        format!("{}{email}", self.inner.config.cache.key_prefix)
    }

    async fn cached_result(&self, email: &str) -> Option<ProbeResult> {
        match self.inner.cache.get_as::<ProbeResult>(&self.cache_key(email)).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(email, error = %e, "probe cache read failed");
                None
            }
        }
    }

    async fn store(&self, result: &ProbeResult) {
        let key = self.cache_key(&result.email);
        let ttl = self.inner.config.probe_cache_ttl();
        if let Err(e) = self.inner.cache.set_as(&key, result, Some(ttl)).await {
            tracing::warn!(email = %result.email, error = %e, "probe cache write failed");
        }
    }

    fn record(&self, results: &[ProbeResult]) {
        self.recorder().record(results);
    }

    /// Probes one address.
    pub async fn probe_email(&self, email: &str) -> ProbeResult {
        self.probe_email_with_progress(email, &Progress::silent()).await
    }

    /// Probes one address, reporting milestones to `progress`.
    ///
    /// A cached result is returned as is, marked `cached`. Otherwise the
    /// address is probed as a one-element batch and its result cached.
    pub async fn probe_email_with_progress(&self, email: &str, progress: &Progress) -> ProbeResult {
        let start = Instant::now();
        let email = normalize_email(email);

        progress.reached(Milestone::CacheCheck);
        if let Some(mut hit) = self.cached_result(&email).await {
            tracing::debug!(%email, "probe cache hit");
            hit.cached = true;
            progress.reached(Milestone::Done);
            return hit;
        }

        progress.reached(Milestone::Dns);
        let plan = self
            .inner
            .sharding
            .shard_emails_by_mx(std::slice::from_ref(&email))
            .await;

        progress.reached(Milestone::SmtpProbe);
        let mut results = self.run_plan(plan).await;

        progress.reached(Milestone::Finalizing);
        let result = results.pop().unwrap_or_else(|| {
            ProbeResult::failure(
                email.as_str(),
                ProbeStatus::Error,
                "No result produced",
                start.elapsed(),
            )
        });
        self.store(&result).await;
        self.record(std::slice::from_ref(&result));

        tracing::info!(
            %email,
            status = %result.status,
            mx = result.mx_host.as_deref().unwrap_or_default(),
            elapsed_ms = start.elapsed().as_millis(),
            "probe finished"
        );
        progress.completed(format!("{email}: {}", result.status));
        result
    }

    /// Probes a batch of addresses.
    pub async fn probe_batch(&self, emails: &[String]) -> BatchResult {
        self.probe_batch_with_progress(emails, &Progress::silent()).await
    }

    /// Probes a batch, reporting milestones to `progress`.
    ///
    /// Every input yields exactly one result. Results are always probed
    /// fresh and then cached per address. Result order follows shard
    /// completion, not input order.
    pub async fn probe_batch_with_progress(&self, emails: &[String], progress: &Progress) -> BatchResult {
        let start = Instant::now();
        if emails.is_empty() {
            progress.completed("Empty batch");
            return BatchResult::default();
        }

        let emails: Vec<String> = emails.iter().map(|e| normalize_email(e)).collect();

        progress.reached(Milestone::Dns);
        let plan = self.inner.sharding.shard_emails_by_mx(&emails).await;

        progress.reached(Milestone::SmtpProbe);
        let results = self.run_plan(plan).await;

        progress.reached(Milestone::Finalizing);
        for result in &results {
            self.store(result).await;
        }
        self.record(&results);

        let batch = BatchResult::from_results(results, start.elapsed());
        tracing::info!(
            processed = batch.total_processed,
            valid = batch.total_valid,
            invalid = batch.total_invalid,
            catch_all = batch.total_catch_all,
            errors = batch.total_errors,
            elapsed_ms = batch.total_time_ms,
            "batch finished"
        );
        progress.completed(format!("Processed {} addresses", batch.total_processed));
        batch
    }

    async fn run_plan(&self, plan: ShardPlan) -> Vec<ProbeResult> {
        let mut results: Vec<ProbeResult> = plan
            .malformed
            .into_iter()
            .map(|m| ProbeResult::failure(m.email, ProbeStatus::Error, m.reason, Duration::ZERO))
            .collect();
        results.extend(self.probe_sharded_emails(plan.shards).await);
        results
    }

    /// Probes already sharded addresses.
    ///
    /// At most `max_concurrent_shards` shards run at a time. A shard whose
    /// task dies reports every address as `error`; other shards are not
    /// affected.
    pub async fn probe_sharded_emails(&self, shards: Vec<EmailShard>) -> Vec<ProbeResult> {
        let limit = Arc::new(Semaphore::new(self.inner.config.batch.max_concurrent_shards));

        let tasks: Vec<(Vec<String>, JoinHandle<Vec<ProbeResult>>)> = shards
            .into_iter()
            .map(|shard| {
                let emails = shard.emails.clone();
                let prober = self.clone();
                let limit = Arc::clone(&limit);
                let handle = tokio::spawn(async move {
                    let _permit = limit.acquire_owned().await.ok();
                    prober.probe_shard(shard).await
                });
                (emails, handle)
            })
            .collect();

        let mut results = Vec::new();
        for (emails, handle) in tasks {
            match handle.await {
                Ok(shard_results) => results.extend(shard_results),
                Err(e) => {
                    tracing::error!(error = %e, addresses = emails.len(), "shard task failed");
                    let message = format!("Shard task failed: {e}");
                    results.extend(emails.into_iter().map(|email| {
                        ProbeResult::failure(email, ProbeStatus::Error, message.as_str(), Duration::ZERO)
                    }));
                }
            }
        }
        results
    }

    async fn probe_shard(&self, shard: EmailShard) -> Vec<ProbeResult> {
        let start = Instant::now();
        let EmailShard {
            domain,
            emails,
            mx_records,
        } = shard;

        if mx_records.is_empty() {
            tracing::warn!(%domain, addresses = emails.len(), "no mail exchangers");
            return emails
                .into_iter()
                .map(|email| ProbeResult::failure(email, ProbeStatus::Error, NO_MX_MESSAGE, start.elapsed()))
                .collect();
        }

        let settings = &self.inner.config.session;
        let chunks: Vec<&[String]> = emails
            .chunks(self.inner.config.batch.effective_batch_size())
            .collect();
        let mut next = 0;
        let mut results = Vec::with_capacity(emails.len());
        let mut last_error: Option<mxprobe_smtp::Error> = None;

        for mx in &mx_records {
            if next == chunks.len() {
                break;
            }

            let connection = self
                .inner
                .pool
                .get_connection(&mx.exchange, settings.smtp_port, settings.connection_timeout(), false)
                .await;
            let mut conn = match connection {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(%domain, mx = %mx.exchange, error = %e, "mail exchanger unavailable, trying next");
                    last_error = Some(e);
                    continue;
                }
            };

            while next < chunks.len() {
                let outcome = conn.session_mut().probe_rcpt_batch(chunks[next]).await;
                match outcome {
                    Ok(outcomes) => {
                        results.extend(outcomes.iter().map(|o| ProbeResult::from_outcome(o, mx)));
                        next += 1;
                    }
                    Err(e) => {
                        tracing::warn!(%domain, mx = %mx.exchange, error = %e, "probe failed, trying next mail exchanger");
                        last_error = Some(e);
                        break;
                    }
                }
            }
            self.inner.pool.release_connection(conn).await;
        }

        if next < chunks.len() {
            let status = match &last_error {
                Some(mxprobe_smtp::Error::Timeout { .. }) => ProbeStatus::Timeout,
                _ => ProbeStatus::Error,
            };
            let message = last_error.as_ref().map_or_else(
                || "All mail exchangers failed".to_string(),
                |e| format!("All mail exchangers failed: {e}"),
            );
            let remaining: Vec<&String> = chunks[next..].iter().flat_map(|chunk| chunk.iter()).collect();
            tracing::error!(%domain, addresses = remaining.len(), %message, "shard exhausted its mail exchangers");
            results.extend(remaining.into_iter().map(|email| {
                ProbeResult::failure(email.as_str(), status, message.as_str(), start.elapsed())
            }));
        }

        results
    }

    /// Drops the cached result for `email`, or every cached result plus
    /// the sharding MX cache. Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns the cache backend's error.
    pub async fn clear_cache(&self, email: Option<&str>) -> Result<usize> {
        if let Some(email) = email {
            let key = self.cache_key(&normalize_email(email));
            return Ok(usize::from(self.inner.cache.delete(&key).await?));
        }

        let keys = self
            .inner
            .cache
            .keys_with_prefix(&self.inner.config.cache.key_prefix)
            .await?;
        let probes = self.inner.cache.delete_many(&keys).await?;
        let mx = self.inner.sharding.clear_mx_cache(None).await?;
        tracing::info!(probes, mx, "cleared probe cache");
        Ok(probes + mx)
    }

    /// Lists the addresses held in the probe cache.
    ///
    /// # Errors
    ///
    /// Returns the cache backend's error.
    pub async fn cache_stats(&self) -> Result<ProbeCacheStats> {
        let prefix = &self.inner.config.cache.key_prefix;
        let mut emails: Vec<String> = self
            .inner
            .cache
            .keys_with_prefix(prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect();
        emails.sort();
        Ok(ProbeCacheStats {
            size: emails.len(),
            emails,
        })
    }

    /// Engine-wide counters.
    #[must_use]
    pub fn probe_stats(&self) -> ProbeStats {
        let active = self.inner.pool.stats().in_use;
        self.recorder().snapshot(active)
    }

    /// Connection pool occupancy.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::dns::StaticLookup;

    fn prober(lookup: StaticLookup) -> Prober {
        Prober::with_cache(
            ProbeConfig::default(),
            Arc::new(lookup),
            TcpTransport,
            Arc::new(MemoryCache::new()),
        )
        .unwrap()
    }

    #[test]
    fn normalizes_addresses() {
        assert_eq!(normalize_email("  User@Example.COM "), "user@example.com");
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = ProbeConfig::default();
        config.batch.max_concurrent_shards = 0;
        let result = Prober::new(config, Arc::new(StaticLookup::new()), TcpTransport);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn domain_without_mx_is_an_error_result() {
        let prober = prober(StaticLookup::new());
        let result = prober.probe_email("user@nohost.invalid").await;
        assert_eq!(result.status, ProbeStatus::Error);
        assert_eq!(result.error.as_deref(), Some(NO_MX_MESSAGE));
        assert!(!result.cached);

        let again = prober.probe_email("USER@nohost.invalid").await;
        assert!(again.cached);
        assert_eq!(again.status, result.status);

        let stats = prober.probe_stats();
        assert_eq!(stats.total_probes, 1);
        assert_eq!(stats.failed_probes, 1);
    }

    #[tokio::test]
    async fn malformed_addresses_never_reach_the_network() {
        let prober = prober(StaticLookup::new());
        let batch = prober
            .probe_batch(&["not-an-address".to_string(), "a@b@c".to_string()])
            .await;
        assert_eq!(batch.total_processed, 2);
        assert_eq!(batch.total_errors, 2);
        assert!(batch.results.iter().all(|r| r.mx_host.is_none()));
    }

    #[tokio::test]
    async fn empty_batch() {
        let prober = prober(StaticLookup::new());
        let batch = prober.probe_batch(&[]).await;
        assert_eq!(batch.total_processed, 0);
        assert_eq!(prober.probe_stats().total_probes, 0);
    }

    #[tokio::test]
    async fn cache_management() {
        let prober = prober(StaticLookup::new());
        prober
            .probe_batch(&["a@none.invalid".to_string(), "b@none.invalid".to_string()])
            .await;

        let stats = prober.cache_stats().await.unwrap();
        assert_eq!(stats.emails, vec!["a@none.invalid", "b@none.invalid"]);

        assert_eq!(prober.clear_cache(Some("A@none.invalid")).await.unwrap(), 1);
        assert_eq!(prober.clear_cache(Some("a@none.invalid")).await.unwrap(), 0);
        assert_eq!(prober.clear_cache(None).await.unwrap(), 1);
        assert_eq!(prober.cache_stats().await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_maintenance() {
        let prober = prober(StaticLookup::new());
        prober.start_maintenance();
        prober.start_maintenance();
        prober.shutdown().await;
        assert!(prober.sweeper().is_none());
        assert_eq!(prober.pool_stats(), PoolStats::default());
    }
}
