//! Cached resolution of a single record type.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::lookup::{DnsAnswer, DnsLookup, LookupError};
use super::model::{MxRecord, RecordKind, RecordResolution, ResolutionSource, millis, normalize_domain};
use crate::Result;
use crate::cache::CacheProvider;

/// Prefix shared by every per-type resolver cache key.
pub const DNS_CACHE_PREFIX: &str = "dns:";

type QueryFn<T> = for<'a> fn(
    &'a dyn DnsLookup,
    &'a str,
) -> BoxFuture<'a, std::result::Result<DnsAnswer<T>, LookupError>>;

/// Describes how to query and cache one record type.
pub struct RecordType<T> {
    /// Which type this is.
    pub kind: RecordKind,
    /// TTL when the answer carries none.
    pub default_ttl: Duration,
    /// Whether per-record TTLs from the answer are honoured.
    pub uses_answer_ttl: bool,
    query: QueryFn<T>,
}

impl<T> Clone for RecordType<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RecordType<T> {}

impl<T> fmt::Debug for RecordType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordType")
            .field("kind", &self.kind)
            .field("default_ttl", &self.default_ttl)
            .field("uses_answer_ttl", &self.uses_answer_ttl)
            .finish_non_exhaustive()
    }
}

fn query_mx<'a>(
    lookup: &'a dyn DnsLookup,
    domain: &'a str,
) -> BoxFuture<'a, std::result::Result<DnsAnswer<MxRecord>, LookupError>> {
    lookup.mx(domain)
}

fn query_a<'a>(
    lookup: &'a dyn DnsLookup,
    domain: &'a str,
) -> BoxFuture<'a, std::result::Result<DnsAnswer<Ipv4Addr>, LookupError>> {
    lookup.a(domain)
}

fn query_aaaa<'a>(
    lookup: &'a dyn DnsLookup,
    domain: &'a str,
) -> BoxFuture<'a, std::result::Result<DnsAnswer<Ipv6Addr>, LookupError>> {
    lookup.aaaa(domain)
}

fn query_txt<'a>(
    lookup: &'a dyn DnsLookup,
    domain: &'a str,
) -> BoxFuture<'a, std::result::Result<DnsAnswer<String>, LookupError>> {
    lookup.txt(domain)
}

/// MX records. Resolvers rarely expose per-record TTLs for these.
pub const MX: RecordType<MxRecord> = RecordType {
    kind: RecordKind::Mx,
    default_ttl: RecordKind::Mx.default_ttl(),
    uses_answer_ttl: false,
    query: query_mx,
};

/// A records, cached for the smallest TTL in the answer.
pub const A: RecordType<Ipv4Addr> = RecordType {
    kind: RecordKind::A,
    default_ttl: RecordKind::A.default_ttl(),
    uses_answer_ttl: true,
    query: query_a,
};

/// AAAA records, cached for the smallest TTL in the answer.
pub const AAAA: RecordType<Ipv6Addr> = RecordType {
    kind: RecordKind::Aaaa,
    default_ttl: RecordKind::Aaaa.default_ttl(),
    uses_answer_ttl: true,
    query: query_aaaa,
};

/// TXT records.
pub const TXT: RecordType<String> = RecordType {
    kind: RecordKind::Txt,
    default_ttl: RecordKind::Txt.default_ttl(),
    uses_answer_ttl: false,
    query: query_txt,
};

impl<T> RecordType<T> {
    /// Cache key for `domain` (already normalized).
    #[must_use]
    pub fn cache_key(&self, domain: &str) -> String {
        format!("{DNS_CACHE_PREFIX}{domain}:{}", self.kind.label())
    }

    /// Extracts the domain from one of this type's cache keys.
    #[must_use]
    pub fn domain_from_key<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(DNS_CACHE_PREFIX)?
            .strip_suffix(self.kind.label())?
            .strip_suffix(':')
    }

    fn effective_ttl(&self, answer_ttl: Option<u32>) -> Duration {
        match answer_ttl {
            Some(ttl) if self.uses_answer_ttl => Duration::from_secs(u64::from(ttl)),
            _ => self.default_ttl,
        }
    }
}

/// Cached domains for one record type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordCacheStats {
    /// Number of cached domains.
    pub size: usize,
    /// The cached domains, sorted.
    pub domains: Vec<String>,
}

/// Resolves one record type with caching.
///
/// Failures never propagate: a failed query yields an empty record list
/// tagged [`ResolutionSource::Error`] and is not cached.
pub struct RecordResolver<T> {
    record_type: RecordType<T>,
    lookup: Arc<dyn DnsLookup>,
    cache: Arc<dyn CacheProvider>,
}

impl<T> fmt::Debug for RecordResolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordResolver")
            .field("record_type", &self.record_type)
            .finish_non_exhaustive()
    }
}

impl<T> RecordResolver<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a resolver for `record_type`.
    #[must_use]
    pub fn new(
        record_type: RecordType<T>,
        lookup: Arc<dyn DnsLookup>,
        cache: Arc<dyn CacheProvider>,
    ) -> Self {
        Self {
            record_type,
            lookup,
            cache,
        }
    }

    /// Record type handled by this resolver.
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        self.record_type.kind
    }

    /// Resolves `domain`, consulting the cache first.
    pub async fn resolve(&self, domain: &str) -> RecordResolution<T> {
        let started = Instant::now();
        let domain = normalize_domain(domain);
        let kind = self.record_type.kind;
        let key = self.record_type.cache_key(&domain);

        match self.cache.get_as::<Vec<T>>(&key).await {
            Ok(Some(records)) => {
                tracing::debug!(%domain, %kind, "DNS cache hit");
                return RecordResolution {
                    domain,
                    records,
                    ttl_seconds: self.record_type.default_ttl.as_secs(),
                    resolution_time_ms: millis(started.elapsed()),
                    source: ResolutionSource::Cache,
                    error: None,
                };
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(%domain, %kind, error = %e, "DNS cache read failed"),
        }

        match (self.record_type.query)(self.lookup.as_ref(), &domain).await {
            Ok(answer) => {
                let ttl = self.record_type.effective_ttl(answer.min_ttl);
                if let Err(e) = self.cache.set_as(&key, &answer.records, Some(ttl)).await {
                    tracing::warn!(%domain, %kind, error = %e, "DNS cache write failed");
                }
                tracing::debug!(%domain, %kind, count = answer.records.len(), ttl = ttl.as_secs(), "resolved");
                RecordResolution {
                    domain,
                    records: answer.records,
                    ttl_seconds: ttl.as_secs(),
                    resolution_time_ms: millis(started.elapsed()),
                    source: ResolutionSource::Dns,
                    error: None,
                }
            }
            Err(e) => {
                tracing::debug!(%domain, %kind, error = %e, "lookup failed");
                RecordResolution {
                    domain,
                    records: Vec::new(),
                    ttl_seconds: 0,
                    resolution_time_ms: millis(started.elapsed()),
                    source: ResolutionSource::Error,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Drops cached answers for `domain`, or for every domain.
    ///
    /// # Errors
    ///
    /// Returns the cache backend's error.
    pub async fn clear_cache(&self, domain: Option<&str>) -> Result<usize> {
        let keys = match domain {
            Some(domain) => vec![self.record_type.cache_key(&normalize_domain(domain))],
            None => self.cached_keys().await?,
        };
        self.cache.delete_many(&keys).await
    }

    /// Lists the domains cached for this record type.
    ///
    /// # Errors
    ///
    /// Returns the cache backend's error.
    pub async fn cache_stats(&self) -> Result<RecordCacheStats> {
        let mut domains: Vec<String> = self
            .cached_keys()
            .await?
            .iter()
            .filter_map(|key| self.record_type.domain_from_key(key))
            .map(str::to_string)
            .collect();
        domains.sort();
        Ok(RecordCacheStats {
            size: domains.len(),
            domains,
        })
    }

    async fn cached_keys(&self) -> Result<Vec<String>> {
        let keys = self.cache.keys_with_prefix(DNS_CACHE_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter(|key| self.record_type.domain_from_key(key).is_some())
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::dns::StaticLookup;

    fn cache() -> Arc<dyn CacheProvider> {
        Arc::new(MemoryCache::new())
    }

    #[test]
    fn keys_are_type_scoped() {
        assert_eq!(MX.cache_key("example.com"), "dns:example.com:mx");
        assert_eq!(MX.domain_from_key("dns:example.com:mx"), Some("example.com"));
        assert_eq!(A.domain_from_key("dns:example.com:mx"), None);
        assert_eq!(A.domain_from_key("dns:example.com:aaaa"), None);
        assert_eq!(AAAA.domain_from_key("dns:example.com:aaaa"), Some("example.com"));
    }

    #[test]
    fn answer_ttl_only_for_address_records() {
        assert_eq!(A.effective_ttl(Some(120)), Duration::from_secs(120));
        assert_eq!(A.effective_ttl(None), Duration::from_secs(3600));
        assert_eq!(MX.effective_ttl(Some(120)), Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let lookup = Arc::new(StaticLookup::new().with_mx("example.com", &[("mx1.example.com", 10)]));
        let resolver = RecordResolver::new(MX, lookup.clone(), cache());

        let first = resolver.resolve(" Example.com ").await;
        assert_eq!(first.source, ResolutionSource::Dns);
        assert_eq!(first.domain, "example.com");
        assert_eq!(first.records, vec![MxRecord::new("mx1.example.com", 10)]);

        let second = resolver.resolve("example.com").await;
        assert_eq!(second.source, ResolutionSource::Cache);
        assert_eq!(second.records, first.records);
        assert_eq!(second.ttl_seconds, 86_400);
        assert_eq!(lookup.queries(), 1);
    }

    #[tokio::test]
    async fn address_ttl_comes_from_answer() {
        let lookup = Arc::new(StaticLookup::new().with_a_ttl(
            "example.com",
            &[Ipv4Addr::new(192, 0, 2, 1)],
            90,
        ));
        let resolver = RecordResolver::new(A, lookup, cache());
        let resolution = resolver.resolve("example.com").await;
        assert_eq!(resolution.ttl_seconds, 90);
        assert_eq!(resolution.records, vec![Ipv4Addr::new(192, 0, 2, 1)]);
    }

    #[tokio::test]
    async fn failures_degrade_and_are_not_cached() {
        let lookup = Arc::new(StaticLookup::new());
        let resolver = RecordResolver::new(MX, lookup.clone(), cache());

        let resolution = resolver.resolve("nohost.invalid").await;
        assert_eq!(resolution.source, ResolutionSource::Error);
        assert!(resolution.records.is_empty());
        assert!(resolution.error.unwrap().contains("nohost.invalid"));

        resolver.resolve("nohost.invalid").await;
        assert_eq!(lookup.queries(), 2);
    }

    #[tokio::test]
    async fn clear_and_stats() {
        let lookup = Arc::new(
            StaticLookup::new()
                .with_mx("a.com", &[("mx.a.com", 1)])
                .with_mx("b.com", &[("mx.b.com", 1)]),
        );
        let resolver = RecordResolver::new(MX, lookup, cache());
        resolver.resolve("b.com").await;
        resolver.resolve("a.com").await;

        let stats = resolver.cache_stats().await.unwrap();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.domains, vec!["a.com", "b.com"]);

        assert_eq!(resolver.clear_cache(Some("A.com")).await.unwrap(), 1);
        assert_eq!(resolver.cache_stats().await.unwrap().domains, vec!["b.com"]);
        assert_eq!(resolver.clear_cache(None).await.unwrap(), 1);
        assert_eq!(resolver.cache_stats().await.unwrap().size, 0);
    }
}
