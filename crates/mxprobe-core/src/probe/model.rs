//! Probe data models.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mxprobe_smtp::{RcptOutcome, SmtpResponse};
use serde::{Deserialize, Serialize};

use super::classify::classify;
use crate::dns::{MxRecord, millis};

/// Per-address outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Mailbox accepted.
    Valid,
    /// Mailbox rejected.
    Invalid,
    /// Server accepts any recipient.
    CatchAll,
    /// Server asked to try later.
    TemporaryFailure,
    /// Server refused for a reason other than the mailbox.
    PermanentFailure,
    /// Every mail exchanger timed out.
    Timeout,
    /// No usable answer (DNS, connection, malformed address).
    Error,
    /// Reply outside the known code ranges.
    Unknown,
}

impl ProbeStatus {
    /// Returns true for a definitive answer about the mailbox.
    #[must_use]
    pub const fn is_conclusive(self) -> bool {
        matches!(self, Self::Valid | Self::Invalid | Self::CatchAll)
    }

    /// Coarse deliverability verdict.
    #[must_use]
    pub const fn verdict(self) -> Verdict {
        match self {
            Self::Valid => Verdict::Deliverable,
            Self::Invalid => Verdict::Undeliverable,
            Self::CatchAll => Verdict::Risky,
            _ => Verdict::Unknown,
        }
    }

    /// Verdict with a 0-100 confidence that the address receives mail.
    ///
    /// Inconclusive SMTP answers sit at 50; outcomes that never reached a
    /// usable reply score 0.
    #[must_use]
    pub const fn verdict_score(self) -> VerdictScore {
        let score = match self {
            Self::Valid => 100,
            Self::Invalid | Self::Error => 0,
            Self::CatchAll
            | Self::TemporaryFailure
            | Self::PermanentFailure
            | Self::Timeout
            | Self::Unknown => 50,
        };
        VerdictScore {
            verdict: self.verdict(),
            score,
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::CatchAll => "catch_all",
            Self::TemporaryFailure => "temporary_failure",
            Self::PermanentFailure => "permanent_failure",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Deliverability verdict derived from a [`ProbeStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The mailbox exists.
    Deliverable,
    /// The mailbox does not exist.
    Undeliverable,
    /// Accepted, but the domain accepts everything.
    Risky,
    /// Could not tell.
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deliverable => "deliverable",
            Self::Undeliverable => "undeliverable",
            Self::Risky => "risky",
            Self::Unknown => "unknown",
        })
    }
}

/// A verdict and its score out of 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictScore {
    /// Coarse verdict.
    pub verdict: Verdict,
    /// 100 for deliverable, 0 for undeliverable or unreachable.
    pub score: u8,
}

/// Outcome for one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Address probed.
    pub email: String,
    /// Classified outcome.
    pub status: ProbeStatus,
    /// RCPT reply code, when the server answered.
    pub response_code: Option<u16>,
    /// RCPT reply text, when the server answered.
    pub response_message: Option<String>,
    /// Mail exchanger that answered.
    pub mx_host: Option<String>,
    /// Its MX priority.
    pub mx_priority: Option<u16>,
    /// Time spent on this address.
    pub probe_time_ms: u64,
    /// Failure description for non-SMTP outcomes.
    pub error: Option<String>,
    /// Served from the probe cache.
    #[serde(default)]
    pub cached: bool,
    /// When the probe ran.
    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    /// Verdict and score for this outcome.
    #[must_use]
    pub const fn verdict_score(&self) -> VerdictScore {
        self.status.verdict_score()
    }

    /// Result for an address that never reached an SMTP reply.
    #[must_use]
    pub fn failure(
        email: impl Into<String>,
        status: ProbeStatus,
        error: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            email: email.into(),
            status,
            response_code: None,
            response_message: None,
            mx_host: None,
            mx_priority: None,
            probe_time_ms: millis(elapsed),
            error: Some(error.into()),
            cached: false,
            checked_at: Utc::now(),
        }
    }

    /// Result for one RCPT outcome from `mx`.
    #[must_use]
    pub fn from_outcome(outcome: &RcptOutcome, mx: &MxRecord) -> Self {
        let answered = !outcome.is_synthetic();
        Self {
            email: outcome.email.clone(),
            status: classify(&outcome.response),
            response_code: answered.then_some(outcome.response.code),
            response_message: Some(outcome.response.message.clone()),
            mx_host: Some(mx.exchange.clone()),
            mx_priority: Some(mx.priority),
            probe_time_ms: millis(outcome.response_time),
            error: outcome.error.clone(),
            cached: false,
            checked_at: Utc::now(),
        }
    }

    /// Classified response, when the server answered.
    #[must_use]
    pub fn response(&self) -> Option<SmtpResponse> {
        let code = self.response_code?;
        Some(SmtpResponse::new(
            code,
            self.response_message.clone().unwrap_or_default(),
        ))
    }
}

/// Aggregate over a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Per-address results; order is not significant.
    pub results: Vec<ProbeResult>,
    /// Number of results.
    pub total_processed: usize,
    /// `valid` results.
    pub total_valid: usize,
    /// `invalid` results.
    pub total_invalid: usize,
    /// `catch_all` results.
    pub total_catch_all: usize,
    /// Everything else.
    pub total_errors: usize,
    /// Wall time for the batch.
    pub total_time_ms: u64,
    /// Mail exchangers that answered, in first-seen order.
    pub mx_hosts: Vec<String>,
    /// Mean of `probe_time_ms`.
    pub average_response_time_ms: f64,
}

impl BatchResult {
    /// Aggregates `results`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_results(results: Vec<ProbeResult>, elapsed: Duration) -> Self {
        let mut batch = Self {
            total_processed: results.len(),
            total_time_ms: millis(elapsed),
            ..Self::default()
        };

        let mut seen = HashSet::new();
        let mut total_time = 0u64;
        for result in &results {
            match result.status {
                ProbeStatus::Valid => batch.total_valid += 1,
                ProbeStatus::Invalid => batch.total_invalid += 1,
                ProbeStatus::CatchAll => batch.total_catch_all += 1,
                _ => batch.total_errors += 1,
            }
            if let Some(host) = &result.mx_host {
                if seen.insert(host.clone()) {
                    batch.mx_hosts.push(host.clone());
                }
            }
            total_time = total_time.saturating_add(result.probe_time_ms);
        }

        if !results.is_empty() {
            batch.average_response_time_ms = total_time as f64 / results.len() as f64;
        }
        batch.results = results;
        batch
    }
}

/// Engine-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeStats {
    /// Addresses probed (cache hits excluded).
    pub total_probes: u64,
    /// Probes with a conclusive answer.
    pub successful_probes: u64,
    /// Probes without one.
    pub failed_probes: u64,
    /// Running mean of per-address probe time.
    pub average_response_time_ms: f64,
    /// Sessions currently checked out of the pool.
    pub active_connections: usize,
}

/// Addresses held in the probe result cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeCacheStats {
    /// Number of cached results.
    pub size: usize,
    /// Cached addresses, sorted.
    pub emails: Vec<String>,
}

/// Accumulates [`ProbeStats`] counters.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    total: u64,
    successful: u64,
    failed: u64,
    total_time_ms: u64,
}

impl StatsRecorder {
    pub(crate) fn record(&mut self, results: &[ProbeResult]) {
        for result in results {
            self.total += 1;
            if result.status.is_conclusive() {
                self.successful += 1;
            } else {
                self.failed += 1;
            }
            self.total_time_ms = self.total_time_ms.saturating_add(result.probe_time_ms);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn snapshot(&self, active_connections: usize) -> ProbeStats {
        let average = if self.total == 0 {
            0.0
        } else {
            self.total_time_ms as f64 / self.total as f64
        };
        ProbeStats {
            total_probes: self.total,
            successful_probes: self.successful,
            failed_probes: self.failed,
            average_response_time_ms: average,
            active_connections,
        }
    }
}
