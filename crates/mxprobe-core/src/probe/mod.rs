//! Address probing: classification, results and the orchestrator.

mod classify;
mod model;
mod service;

pub use classify::classify;
pub use model::{BatchResult, ProbeCacheStats, ProbeResult, ProbeStats, ProbeStatus, Verdict, VerdictScore};
pub use service::{NO_MX_MESSAGE, Prober, normalize_email};
