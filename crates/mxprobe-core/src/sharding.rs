//! Grouping addresses by destination domain and mail exchanger.
//!
//! Every distinct domain in a batch becomes one [`EmailShard`] carrying its
//! mail exchangers in priority order. Domains without mail exchangers still
//! get a shard, with an empty list, so their addresses are reported rather
//! than dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::cache::CacheProvider;
use crate::dns::{DomainResolver, MxRecord, ResolutionSource, normalize_domain};
use crate::{Error, Result};

/// Prefix of the sharding service's MX cache keys.
pub const MX_CACHE_PREFIX: &str = "mx:";

/// Addresses for one domain and where to probe them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailShard {
    /// Normalized destination domain.
    pub domain: String,
    /// Addresses in input order.
    pub emails: Vec<String>,
    /// Mail exchangers, lowest priority value first.
    pub mx_records: Vec<MxRecord>,
}

/// An input that could not be assigned to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedEmail {
    /// The address as given.
    pub email: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Output of [`MxSharding::shard_emails_by_mx`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardPlan {
    /// One shard per distinct domain, in order of first appearance.
    pub shards: Vec<EmailShard>,
    /// Addresses without exactly one `@` or with an empty part.
    pub malformed: Vec<MalformedEmail>,
}

/// Domains held in the MX cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MxCacheStats {
    /// Number of cached domains.
    pub size: usize,
    /// Cached domains, sorted.
    pub domains: Vec<String>,
}

/// Returns the normalized domain of `email`.
///
/// # Errors
///
/// Returns [`Error::InvalidEmail`] unless `email` has exactly one `@` with
/// text on both sides.
pub fn domain_of(email: &str) -> Result<String> {
    let email = email.trim();
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) if !local.is_empty() && !domain.trim().is_empty() => {
            Ok(normalize_domain(domain))
        }
        _ => Err(Error::InvalidEmail(email.to_string())),
    }
}

/// Shards address batches by mail exchanger.
#[derive(Debug)]
pub struct MxSharding {
    resolver: Arc<DomainResolver>,
    cache: Arc<dyn CacheProvider>,
    cache_ttl: Duration,
    max_mx_records: usize,
}

impl MxSharding {
    /// Creates the service.
    ///
    /// `cache_ttl` applies to this service's own `mx:` entries, which are
    /// independent of the resolver's DNS cache.
    #[must_use]
    pub fn new(
        resolver: Arc<DomainResolver>,
        cache: Arc<dyn CacheProvider>,
        cache_ttl: Duration,
        max_mx_records: usize,
    ) -> Self {
        Self {
            resolver,
            cache,
            cache_ttl,
            max_mx_records: max_mx_records.max(1),
        }
    }

    fn cache_key(domain: &str) -> String {
        format!("{MX_CACHE_PREFIX}{domain}")
    }

    /// Groups `emails` by domain and resolves each domain's mail exchangers.
    ///
    /// Domains are resolved concurrently. A failed resolution yields a
    /// shard with no mail exchangers; it never affects other domains.
    pub async fn shard_emails_by_mx(&self, emails: &[String]) -> ShardPlan {
        let mut plan = ShardPlan::default();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();

        for email in emails {
            match domain_of(email) {
                Ok(domain) => {
                    let slot = *index.entry(domain.clone()).or_insert_with(|| {
                        groups.push((domain, Vec::new()));
                        groups.len() - 1
                    });
                    groups[slot].1.push(email.trim().to_string());
                }
                Err(e) => plan.malformed.push(MalformedEmail {
                    email: email.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        let lookups = groups.iter().map(|(domain, _)| self.mx_for_domain(domain));
        let resolved = join_all(lookups).await;

        plan.shards = groups
            .into_iter()
            .zip(resolved)
            .map(|((domain, emails), mx_records)| EmailShard {
                domain,
                emails,
                mx_records,
            })
            .collect();

        tracing::debug!(
            shards = plan.shards.len(),
            malformed = plan.malformed.len(),
            "sharded batch"
        );
        plan
    }

    /// Mail exchangers for `domain`, sorted and capped.
    pub async fn mx_for_domain(&self, domain: &str) -> Vec<MxRecord> {
        let domain = normalize_domain(domain);
        let key = Self::cache_key(&domain);

        match self.cache.get_as::<Vec<MxRecord>>(&key).await {
            Ok(Some(mut records)) => {
                tracing::debug!(%domain, "MX cache hit");
                records.truncate(self.max_mx_records);
                return records;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(%domain, error = %e, "MX cache read failed"),
        }

        let resolution = self.resolver.resolve_mx(&domain).await;
        if resolution.source == ResolutionSource::Error {
            tracing::warn!(
                %domain,
                error = resolution.error.as_deref().unwrap_or_default(),
                "MX resolution failed"
            );
        }

        let mut records = resolution.records;
        records.sort_by_key(|mx| mx.priority);

        if !records.is_empty() {
            if let Err(e) = self.cache.set_as(&key, &records, Some(self.cache_ttl)).await {
                tracing::warn!(%domain, error = %e, "MX cache write failed");
            }
        }

        records.truncate(self.max_mx_records);
        records
    }

    /// Drops cached mail exchangers for `domain`, or for every domain.
    ///
    /// # Errors
    ///
    /// Returns the cache backend's error.
    pub async fn clear_mx_cache(&self, domain: Option<&str>) -> Result<usize> {
        let keys = match domain {
            Some(domain) => vec![Self::cache_key(&normalize_domain(domain))],
            None => self.cache.keys_with_prefix(MX_CACHE_PREFIX).await?,
        };
        self.cache.delete_many(&keys).await
    }

    /// Lists the domains held in the MX cache.
    ///
    /// # Errors
    ///
    /// Returns the cache backend's error.
    pub async fn cache_stats(&self) -> Result<MxCacheStats> {
        let mut domains: Vec<String> = self
            .cache
            .keys_with_prefix(MX_CACHE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(MX_CACHE_PREFIX).map(str::to_string))
            .collect();
        domains.sort();
        Ok(MxCacheStats {
            size: domains.len(),
            domains,
        })
    }
}
