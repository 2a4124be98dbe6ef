//! Fixed in-memory record table.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::lookup::{DnsAnswer, DnsLookup, LookupError};
use super::model::{MxRecord, RecordKind, normalize_domain};

#[derive(Debug, Default)]
struct Zone {
    mx: Option<Vec<MxRecord>>,
    a: Option<(Vec<Ipv4Addr>, Option<u32>)>,
    aaaa: Option<(Vec<Ipv6Addr>, Option<u32>)>,
    txt: Option<Vec<String>>,
}

/// [`DnsLookup`] that answers from a table built up front.
///
/// Unknown domains are NXDOMAIN; known domains without a record type
/// report no records. Useful for pinning mail exchangers and in tests.
#[derive(Debug, Default)]
pub struct StaticLookup {
    zones: HashMap<String, Zone>,
    queries: AtomicUsize,
}

impl StaticLookup {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn zone(&mut self, domain: &str) -> &mut Zone {
        self.zones.entry(normalize_domain(domain)).or_default()
    }

    /// Adds MX records as `(exchange, priority)` pairs.
    #[must_use]
    pub fn with_mx(mut self, domain: &str, records: &[(&str, u16)]) -> Self {
        let records = records
            .iter()
            .map(|(exchange, priority)| MxRecord::new(*exchange, *priority))
            .collect();
        self.zone(domain).mx = Some(records);
        self
    }

    /// Adds A records without TTL information.
    #[must_use]
    pub fn with_a(mut self, domain: &str, records: &[Ipv4Addr]) -> Self {
        self.zone(domain).a = Some((records.to_vec(), None));
        self
    }

    /// Adds A records answered with `ttl`.
    #[must_use]
    pub fn with_a_ttl(mut self, domain: &str, records: &[Ipv4Addr], ttl: u32) -> Self {
        self.zone(domain).a = Some((records.to_vec(), Some(ttl)));
        self
    }

    /// Adds AAAA records without TTL information.
    #[must_use]
    pub fn with_aaaa(mut self, domain: &str, records: &[Ipv6Addr]) -> Self {
        self.zone(domain).aaaa = Some((records.to_vec(), None));
        self
    }

    /// Adds TXT records.
    #[must_use]
    pub fn with_txt(mut self, domain: &str, records: &[&str]) -> Self {
        self.zone(domain).txt = Some(records.iter().map(|r| (*r).to_string()).collect());
        self
    }

    /// Number of queries answered so far.
    #[must_use]
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn answer<T: Clone>(
        &self,
        domain: &str,
        kind: RecordKind,
        pick: impl Fn(&Zone) -> Option<(Vec<T>, Option<u32>)>,
    ) -> Result<DnsAnswer<T>, LookupError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let domain = normalize_domain(domain);
        let zone = self
            .zones
            .get(&domain)
            .ok_or_else(|| LookupError::NxDomain(domain.clone()))?;
        match pick(zone) {
            Some((records, ttl)) if !records.is_empty() => Ok(DnsAnswer {
                records,
                min_ttl: ttl,
            }),
            _ => Err(LookupError::NoRecords { domain, kind }),
        }
    }
}

#[async_trait]
impl DnsLookup for StaticLookup {
    async fn mx(&self, domain: &str) -> Result<DnsAnswer<MxRecord>, LookupError> {
        self.answer(domain, RecordKind::Mx, |zone| {
            zone.mx.clone().map(|records| (records, None))
        })
    }

    async fn a(&self, domain: &str) -> Result<DnsAnswer<Ipv4Addr>, LookupError> {
        self.answer(domain, RecordKind::A, |zone| zone.a.clone())
    }

    async fn aaaa(&self, domain: &str) -> Result<DnsAnswer<Ipv6Addr>, LookupError> {
        self.answer(domain, RecordKind::Aaaa, |zone| zone.aaaa.clone())
    }

    async fn txt(&self, domain: &str) -> Result<DnsAnswer<String>, LookupError> {
        self.answer(domain, RecordKind::Txt, |zone| {
            zone.txt.clone().map(|records| (records, None))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_domain_is_nxdomain() {
        let lookup = StaticLookup::new();
        assert_eq!(
            lookup.mx("nohost.invalid").await.unwrap_err(),
            LookupError::NxDomain("nohost.invalid".into())
        );
    }

    #[tokio::test]
    async fn missing_type_is_no_records() {
        let lookup = StaticLookup::new().with_mx("example.com", &[("mx.example.com", 5)]);
        assert!(matches!(
            lookup.aaaa("example.com").await,
            Err(LookupError::NoRecords { kind: RecordKind::Aaaa, .. })
        ));
        assert_eq!(lookup.mx("EXAMPLE.com").await.unwrap().records.len(), 1);
        assert_eq!(lookup.queries(), 2);
    }
}
