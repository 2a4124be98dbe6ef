//! SMTP extension types.

/// SMTP extensions discovered from EHLO response.
///
/// Only the keywords that change how a probe is run get their own variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// STARTTLS - TLS upgrade
    StartTls,
    /// PIPELINING - Command pipelining
    Pipelining,
    /// SIZE - Maximum message size
    Size(Option<usize>),
    /// SMTPUTF8 - UTF-8 email addresses
    SmtpUtf8,
    /// ENHANCEDSTATUSCODES - `x.y.z` codes in reply text
    EnhancedStatusCodes,
    /// Unknown extension
    Unknown(String),
}

impl Extension {
    /// Parses an extension line from EHLO response.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let Some(keyword) = parts.next() else {
            return Self::Unknown(line.to_string());
        };

        match keyword.to_ascii_uppercase().as_str() {
            "STARTTLS" => Self::StartTls,
            "PIPELINING" => Self::Pipelining,
            "SIZE" => Self::Size(parts.next().and_then(|s| s.parse().ok())),
            "SMTPUTF8" => Self::SmtpUtf8,
            "ENHANCEDSTATUSCODES" => Self::EnhancedStatusCodes,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_keywords() {
        assert_eq!(Extension::parse("STARTTLS"), Extension::StartTls);
        assert_eq!(Extension::parse("pipelining"), Extension::Pipelining);
        assert_eq!(Extension::parse("SMTPUTF8"), Extension::SmtpUtf8);
        assert_eq!(
            Extension::parse("ENHANCEDSTATUSCODES"),
            Extension::EnhancedStatusCodes
        );
    }

    #[test]
    fn parse_size() {
        assert_eq!(Extension::parse("SIZE 35882577"), Extension::Size(Some(35_882_577)));
        assert_eq!(Extension::parse("SIZE"), Extension::Size(None));
    }

    #[test]
    fn parse_unknown_and_empty() {
        assert_eq!(
            Extension::parse("X-CUSTOM foo"),
            Extension::Unknown("X-CUSTOM foo".to_string())
        );
        assert!(matches!(Extension::parse(""), Extension::Unknown(_)));
    }
}
