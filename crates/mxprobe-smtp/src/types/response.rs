//! Classified SMTP responses.

use serde::{Deserialize, Serialize};

use super::{Reply, ReplyCode};

/// Phrases that mark a server as accepting every recipient.
///
/// Matched case-insensitively against the reply text.
pub const CATCH_ALL_INDICATORS: &[&str] = &[
    "catch-all",
    "catch all",
    "accept all",
    "accept-all",
    "deliverable",
    "relay",
];

/// Coarse class of a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCategory {
    /// 2xx.
    Success,
    /// 4xx.
    TemporaryFailure,
    /// 5xx.
    PermanentFailure,
    /// Anything else.
    Unknown,
}

impl ResponseCategory {
    /// Categorizes a numeric reply code.
    #[must_use]
    pub const fn of(code: u16) -> Self {
        match code {
            200..=299 => Self::Success,
            400..=499 => Self::TemporaryFailure,
            500..=599 => Self::PermanentFailure,
            _ => Self::Unknown,
        }
    }
}

/// A reply reduced to what the verdict logic needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpResponse {
    /// Three-digit reply code.
    pub code: u16,
    /// Text of the reply (may be empty).
    pub message: String,
    /// Category derived from the code.
    pub category: ResponseCategory,
    /// Whether the text mentions a catch-all policy.
    pub is_catch_all: bool,
    /// Whether the code is worth retrying later.
    pub is_retryable: bool,
}

impl SmtpResponse {
    /// Builds a classified response from a code and text.
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code,
            category: ResponseCategory::of(code),
            is_catch_all: is_catch_all_text(&message),
            is_retryable: ReplyCode::new(code).is_retryable(),
            message,
        }
    }

    /// Returns true for a 2xx reply.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.category, ResponseCategory::Success)
    }

    /// Returns true for a 4xx reply.
    #[must_use]
    pub const fn is_temporary_failure(&self) -> bool {
        matches!(self.category, ResponseCategory::TemporaryFailure)
    }

    /// Returns true for a 5xx reply.
    #[must_use]
    pub const fn is_permanent_failure(&self) -> bool {
        matches!(self.category, ResponseCategory::PermanentFailure)
    }

    /// The recipient was accepted outright with a plain 250.
    #[must_use]
    pub const fn is_deliverable(&self) -> bool {
        self.code == 250
    }

    /// Human-readable description, falling back to the server text.
    #[must_use]
    pub fn description(&self) -> &str {
        match ReplyCode::new(self.code).description() {
            Some(text) => text,
            None if self.message.is_empty() => "Unknown response",
            None => &self.message,
        }
    }
}

/// Only the final line of a multi-line reply carries the verdict text.
impl From<&Reply> for SmtpResponse {
    fn from(reply: &Reply) -> Self {
        Self::new(reply.code.as_u16(), reply.last_line())
    }
}

/// Returns true if `text` contains any catch-all indicator.
#[must_use]
pub fn is_catch_all_text(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    CATCH_ALL_INDICATORS.iter().any(|needle| lower.contains(needle))
}
