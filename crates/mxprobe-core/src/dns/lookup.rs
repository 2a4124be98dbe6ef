//! Raw DNS queries.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::Record;
use hickory_resolver::{ResolveError, TokioResolver};
use thiserror::Error;

use super::model::{MxRecord, RecordKind};
use crate::{Error, Result};

/// Records from one query plus the smallest TTL among them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer<T> {
    /// Answer records.
    pub records: Vec<T>,
    /// Minimum per-record TTL in seconds, when the resolver reports one.
    pub min_ttl: Option<u32>,
}

impl<T> DnsAnswer<T> {
    /// An answer without TTL information.
    #[must_use]
    pub const fn new(records: Vec<T>) -> Self {
        Self {
            records,
            min_ttl: None,
        }
    }

    /// Attaches a minimum TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.min_ttl = Some(ttl);
        self
    }
}

/// Why a query produced no answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// The domain exists but has no records of this type.
    #[error("no {kind} records found for {domain}")]
    NoRecords {
        /// Queried domain.
        domain: String,
        /// Queried type.
        kind: RecordKind,
    },

    /// Domain does not exist (NXDOMAIN).
    #[error("domain does not exist: {0}")]
    NxDomain(String),

    /// Network or resolver failure.
    #[error("DNS lookup failed: {0}")]
    Failed(String),
}

/// The queries the resolvers need.
///
/// [`HickoryLookup`] talks to real name servers; tests substitute an
/// in-memory table.
#[async_trait]
pub trait DnsLookup: Send + Sync + std::fmt::Debug {
    /// MX records for `domain`.
    async fn mx(&self, domain: &str) -> std::result::Result<DnsAnswer<MxRecord>, LookupError>;

    /// A records for `domain`.
    async fn a(&self, domain: &str) -> std::result::Result<DnsAnswer<Ipv4Addr>, LookupError>;

    /// AAAA records for `domain`.
    async fn aaaa(&self, domain: &str) -> std::result::Result<DnsAnswer<Ipv6Addr>, LookupError>;

    /// TXT records for `domain`, each flattened to one string.
    async fn txt(&self, domain: &str) -> std::result::Result<DnsAnswer<String>, LookupError>;
}

/// [`DnsLookup`] backed by `hickory-resolver`.
#[derive(Debug)]
pub struct HickoryLookup {
    resolver: TokioResolver,
}

impl HickoryLookup {
    /// Uses the system resolver configuration with the given query timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dns`] if the system configuration cannot be read.
    pub fn from_system_conf(timeout: Duration) -> Result<Self> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|e| Error::Dns(e.to_string()))?
            .with_options(opts)
            .build();
        Ok(Self { resolver })
    }

    /// Uses an explicit name server configuration.
    #[must_use]
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        let resolver =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();
        Self { resolver }
    }
}

fn lookup_error(domain: &str, kind: RecordKind, err: &ResolveError) -> LookupError {
    if err.is_nx_domain() {
        LookupError::NxDomain(domain.to_string())
    } else if err.is_no_records_found() {
        LookupError::NoRecords {
            domain: domain.to_string(),
            kind,
        }
    } else {
        LookupError::Failed(err.to_string())
    }
}

fn min_ttl<'a>(records: impl Iterator<Item = &'a Record>) -> Option<u32> {
    records.map(Record::ttl).min()
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn mx(&self, domain: &str) -> std::result::Result<DnsAnswer<MxRecord>, LookupError> {
        let lookup = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|e| lookup_error(domain, RecordKind::Mx, &e))?;
        let ttl = min_ttl(lookup.as_lookup().records().iter());
        let records = lookup
            .iter()
            .map(|mx| MxRecord::new(mx.exchange().to_utf8(), mx.preference()))
            .collect();
        Ok(DnsAnswer {
            records,
            min_ttl: ttl,
        })
    }

    async fn a(&self, domain: &str) -> std::result::Result<DnsAnswer<Ipv4Addr>, LookupError> {
        let lookup = self
            .resolver
            .ipv4_lookup(domain)
            .await
            .map_err(|e| lookup_error(domain, RecordKind::A, &e))?;
        let ttl = min_ttl(lookup.as_lookup().records().iter());
        Ok(DnsAnswer {
            records: lookup.iter().map(|a| a.0).collect(),
            min_ttl: ttl,
        })
    }

    async fn aaaa(&self, domain: &str) -> std::result::Result<DnsAnswer<Ipv6Addr>, LookupError> {
        let lookup = self
            .resolver
            .ipv6_lookup(domain)
            .await
            .map_err(|e| lookup_error(domain, RecordKind::Aaaa, &e))?;
        let ttl = min_ttl(lookup.as_lookup().records().iter());
        Ok(DnsAnswer {
            records: lookup.iter().map(|aaaa| aaaa.0).collect(),
            min_ttl: ttl,
        })
    }

    async fn txt(&self, domain: &str) -> std::result::Result<DnsAnswer<String>, LookupError> {
        let lookup = self
            .resolver
            .txt_lookup(domain)
            .await
            .map_err(|e| lookup_error(domain, RecordKind::Txt, &e))?;
        let ttl = min_ttl(lookup.as_lookup().records().iter());
        Ok(DnsAnswer {
            records: lookup.iter().map(ToString::to_string).collect(),
            min_ttl: ttl,
        })
    }
}
