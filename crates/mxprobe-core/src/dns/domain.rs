//! Whole-domain resolution across record types.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::lookup::DnsLookup;
use super::model::{
    DomainResolution, MxRecord, RecordKind, RecordResolution, ResolutionSource, millis,
    normalize_domain,
};
use super::record::{A, AAAA, DNS_CACHE_PREFIX, MX, RecordCacheStats, RecordResolver, TXT};
use crate::Result;
use crate::cache::CacheProvider;

/// Aggregate DNS cache occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DnsCacheStats {
    /// Cached entries across all record types.
    pub total_size: usize,
    /// Every domain with at least one cached type.
    pub domains: BTreeSet<String>,
    /// Per-type breakdown.
    pub by_type: BTreeMap<RecordKind, RecordCacheStats>,
}

/// Cache key of a combined resolution: `dns:{domain}`.
fn domain_key(domain: &str) -> String {
    format!("{DNS_CACHE_PREFIX}{domain}")
}

/// Domain part of a combined-resolution key. Per-type keys carry a `:`.
fn domain_from_domain_key(key: &str) -> Option<&str> {
    key.strip_prefix(DNS_CACHE_PREFIX)
        .filter(|domain| !domain.contains(':'))
}

/// Resolves MX, A, AAAA and TXT for a domain concurrently.
///
/// The combined result is cached under its own key for the shortest
/// TTL among the four answers.
#[derive(Debug)]
pub struct DomainResolver {
    mx: RecordResolver<MxRecord>,
    a: RecordResolver<Ipv4Addr>,
    aaaa: RecordResolver<Ipv6Addr>,
    txt: RecordResolver<String>,
    cache: Arc<dyn CacheProvider>,
}

impl DomainResolver {
    /// Builds the four record resolvers over one lookup and cache.
    #[must_use]
    pub fn new(lookup: Arc<dyn DnsLookup>, cache: Arc<dyn CacheProvider>) -> Self {
        Self {
            mx: RecordResolver::new(MX, Arc::clone(&lookup), Arc::clone(&cache)),
            a: RecordResolver::new(A, Arc::clone(&lookup), Arc::clone(&cache)),
            aaaa: RecordResolver::new(AAAA, Arc::clone(&lookup), Arc::clone(&cache)),
            txt: RecordResolver::new(TXT, lookup, Arc::clone(&cache)),
            cache,
        }
    }

    /// Resolves every record type for `domain`.
    ///
    /// A failing type contributes an empty list and an error note; the
    /// other types are still used. Results with a failing type are not
    /// cached.
    pub async fn resolve_domain(&self, domain: &str) -> DomainResolution {
        let started = Instant::now();
        let domain = normalize_domain(domain);
        let key = domain_key(&domain);

        match self.cache.get_as::<DomainResolution>(&key).await {
            Ok(Some(cached)) => {
                tracing::debug!(%domain, "domain cache hit");
                return DomainResolution {
                    resolution_time_ms: millis(started.elapsed()),
                    source: ResolutionSource::Cache,
                    ..cached
                };
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(%domain, error = %e, "domain cache read failed"),
        }

        let (mx, a, aaaa, txt) = tokio::join!(
            self.mx.resolve(&domain),
            self.a.resolve(&domain),
            self.aaaa.resolve(&domain),
            self.txt.resolve(&domain),
        );

        let parts = [
            (RecordKind::Mx, mx.source, mx.error.as_deref()),
            (RecordKind::A, a.source, a.error.as_deref()),
            (RecordKind::Aaaa, aaaa.source, aaaa.error.as_deref()),
            (RecordKind::Txt, txt.source, txt.error.as_deref()),
        ];
        let errors: Vec<String> = parts
            .iter()
            .filter_map(|(kind, _, error)| error.map(|e| format!("{kind}: {e}")))
            .collect();
        let source = if parts.iter().any(|(_, s, _)| *s == ResolutionSource::Error) {
            ResolutionSource::Error
        } else if parts.iter().any(|(_, s, _)| *s == ResolutionSource::Cache) {
            ResolutionSource::Cache
        } else {
            ResolutionSource::Dns
        };
        let error = (!errors.is_empty()).then(|| errors.join("; "));
        let ttl = [mx.ttl_seconds, a.ttl_seconds, aaaa.ttl_seconds, txt.ttl_seconds]
            .into_iter()
            .filter(|ttl| *ttl > 0)
            .min()
            .map_or_else(|| RecordKind::Mx.default_ttl(), Duration::from_secs);

        if mx.records.is_empty() {
            tracing::warn!(%domain, "no MX records");
        }

        let resolution = DomainResolution {
            has_valid_mx: !mx.records.is_empty(),
            has_valid_a: !a.records.is_empty(),
            has_valid_aaaa: !aaaa.records.is_empty(),
            domain,
            mx_records: mx.records,
            a_records: a.records,
            aaaa_records: aaaa.records,
            txt_records: txt.records,
            resolution_time_ms: millis(started.elapsed()),
            source,
            error,
        };
        if resolution.source != ResolutionSource::Error
            && let Err(e) = self.cache.set_as(&key, &resolution, Some(ttl)).await
        {
            tracing::warn!(domain = %resolution.domain, error = %e, "domain cache write failed");
        }
        resolution
    }

    /// MX records only.
    pub async fn resolve_mx(&self, domain: &str) -> RecordResolution<MxRecord> {
        self.mx.resolve(domain).await
    }

    /// A records only.
    pub async fn resolve_a(&self, domain: &str) -> RecordResolution<Ipv4Addr> {
        self.a.resolve(domain).await
    }

    /// AAAA records only.
    pub async fn resolve_aaaa(&self, domain: &str) -> RecordResolution<Ipv6Addr> {
        self.aaaa.resolve(domain).await
    }

    /// TXT records only.
    pub async fn resolve_txt(&self, domain: &str) -> RecordResolution<String> {
        self.txt.resolve(domain).await
    }

    /// Clears one record type, for `domain` or for all domains.
    ///
    /// Combined resolutions for the same domains are dropped with it and
    /// counted.
    ///
    /// # Errors
    ///
    /// Returns the cache backend's error.
    pub async fn clear_cache_by_type(&self, kind: RecordKind, domain: Option<&str>) -> Result<usize> {
        let removed = match kind {
            RecordKind::Mx => self.mx.clear_cache(domain).await?,
            RecordKind::A => self.a.clear_cache(domain).await?,
            RecordKind::Aaaa => self.aaaa.clear_cache(domain).await?,
            RecordKind::Txt => self.txt.clear_cache(domain).await?,
        };
        Ok(removed + self.clear_domain_entries(domain).await?)
    }

    /// Clears every record type and the combined resolution cached for
    /// `domain`.
    ///
    /// # Errors
    ///
    /// Returns the cache backend's error.
    pub async fn clear_cache_by_domain(&self, domain: &str) -> Result<usize> {
        let mut removed = 0;
        for kind in RecordKind::ALL {
            removed += self.clear_cache_by_type(kind, Some(domain)).await?;
        }
        Ok(removed)
    }

    /// Clears every record type for every domain.
    ///
    /// # Errors
    ///
    /// Returns the cache backend's error.
    pub async fn clear_cache(&self) -> Result<usize> {
        let mut removed = 0;
        for kind in RecordKind::ALL {
            removed += self.clear_cache_by_type(kind, None).await?;
        }
        Ok(removed)
    }

    async fn clear_domain_entries(&self, domain: Option<&str>) -> Result<usize> {
        let keys = match domain {
            Some(domain) => vec![domain_key(&normalize_domain(domain))],
            None => self
                .cache
                .keys_with_prefix(DNS_CACHE_PREFIX)
                .await?
                .into_iter()
                .filter(|key| domain_from_domain_key(key).is_some())
                .collect(),
        };
        self.cache.delete_many(&keys).await
    }

    /// Merges the per-type cache statistics.
    ///
    /// # Errors
    ///
    /// Returns the cache backend's error.
    pub async fn cache_stats(&self) -> Result<DnsCacheStats> {
        let by_type = BTreeMap::from([
            (RecordKind::Mx, self.mx.cache_stats().await?),
            (RecordKind::A, self.a.cache_stats().await?),
            (RecordKind::Aaaa, self.aaaa.cache_stats().await?),
            (RecordKind::Txt, self.txt.cache_stats().await?),
        ]);
        let total_size = by_type.values().map(|stats| stats.size).sum();
        let domains = by_type
            .values()
            .flat_map(|stats| stats.domains.iter().cloned())
            .collect();
        Ok(DnsCacheStats {
            total_size,
            domains,
            by_type,
        })
    }
}
