//! DNS resolution with per-record-type caching.
//!
//! One generic [`RecordResolver`] is instantiated per record type from a
//! [`RecordType`] descriptor ([`record::MX`], [`record::A`],
//! [`record::AAAA`], [`record::TXT`]). [`DomainResolver`] fans out to all
//! four. Per-type cache keys have the form `dns:{domain}:{type}`; the
//! combined resolution is kept under `dns:{domain}`.

mod domain;
mod fixed;
mod lookup;
mod model;
pub mod record;

pub(crate) use model::millis;

pub use domain::{DnsCacheStats, DomainResolver};
pub use fixed::StaticLookup;
pub use lookup::{DnsAnswer, DnsLookup, HickoryLookup, LookupError};
pub use model::{
    DomainResolution, MxRecord, RecordKind, RecordResolution, ResolutionSource, normalize_domain,
};
pub use record::{RecordCacheStats, RecordResolver, RecordType};
