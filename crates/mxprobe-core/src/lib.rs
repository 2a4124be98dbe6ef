//! # mxprobe-core
//!
//! Mailbox deliverability probing on top of `mxprobe-smtp`.
//!
//! This crate provides:
//! - DNS resolution for MX, A, AAAA and TXT records with per-type caching
//! - Sharding of address batches by destination domain and mail exchanger
//! - Batch probe orchestration with bounded shard concurrency and
//!   mail exchanger fallthrough
//! - Result classification (`valid`, `invalid`, `catch_all`, ...)
//! - A pluggable cache boundary with in-memory and disabled backends
//! - Progress events and an in-process job queue
//!
//! ## Quick Start
//!
//! ```ignore
//! use mxprobe_core::{ProbeConfig, Prober};
//!
//! let prober = Prober::from_config(ProbeConfig::default())?;
//! prober.start_maintenance();
//!
//! let result = prober.probe_email("someone@example.com").await;
//! println!("{}: {}", result.email, result.status);
//!
//! let batch = prober.probe_batch(&emails).await;
//! println!("{} valid of {}", batch.total_valid, batch.total_processed);
//!
//! prober.shutdown().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod dns;
mod error;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod sharding;

pub use cache::{CacheBackend, CacheProvider, MemoryCache, NullCache};
pub use config::{ProbeConfig, QueueSettings};
pub use dns::{DnsLookup, DomainResolution, DomainResolver, HickoryLookup, MxRecord, StaticLookup};
pub use error::{Error, Result};
pub use probe::{
    BatchResult, ProbeCacheStats, ProbeResult, ProbeStats, ProbeStatus, Prober, Verdict,
    VerdictScore, classify,
};
pub use progress::{Milestone, Progress, ProgressEvent, ProgressSink, ProgressStatus};
pub use queue::{BatchJob, JobOutcome, JobQueue, JobResult, JobStatus, ProbeExecutor, ProbeJob, QueueStats};
pub use sharding::{EmailShard, MxSharding, ShardPlan};
