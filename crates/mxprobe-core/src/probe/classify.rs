//! Mapping SMTP replies to probe statuses.

use mxprobe_smtp::SmtpResponse;

use super::model::ProbeStatus;

/// Status for a classified RCPT reply.
///
/// | reply | status |
/// |---|---|
/// | 2xx with a catch-all indicator | `catch_all` |
/// | 2xx | `valid` |
/// | 421 | `permanent_failure` |
/// | 450, 451, 452 | `temporary_failure` |
/// | other 4xx | `invalid` |
/// | 550 to 554 | `invalid` |
/// | other 5xx | `permanent_failure` |
/// | code 0 (no reply) | `error` |
/// | anything else | `unknown` |
#[must_use]
pub const fn classify(response: &SmtpResponse) -> ProbeStatus {
    match response.code {
        0 => ProbeStatus::Error,
        200..=299 if response.is_catch_all => ProbeStatus::CatchAll,
        200..=299 => ProbeStatus::Valid,
        421 => ProbeStatus::PermanentFailure,
        450..=452 => ProbeStatus::TemporaryFailure,
        400..=499 | 550..=554 => ProbeStatus::Invalid,
        500..=599 => ProbeStatus::PermanentFailure,
        _ => ProbeStatus::Unknown,
    }
}
