//! SMTP response parser.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode, SmtpResponse};

/// Final line of a reply: three digits, then optional whitespace and text.
static FINAL_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d{3})(?:\s+(.*))?$").ok());

/// Parses an SMTP reply from response lines.
///
/// SMTP replies can be single-line or multi-line:
/// - Single: `250 OK\r\n`
/// - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
///
/// # Errors
///
/// Returns an error if the reply is malformed.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    let Some(first) = lines.first() else {
        return Err(Error::Protocol("Empty reply".into()));
    };

    let code_str = first
        .get(0..3)
        .ok_or_else(|| Error::Protocol(format!("Reply too short: {first}")))?;
    let code = code_str
        .parse::<u16>()
        .map_err(|_| Error::Protocol(format!("Invalid reply code: {code_str}")))?;

    let mut message = Vec::with_capacity(lines.len());
    for line in lines {
        if !line.starts_with(code_str) {
            return Err(Error::Protocol(format!(
                "Reply line does not continue code {code_str}: {line}"
            )));
        }
        // Skip code and separator (e.g., "250-" or "250 ")
        message.push(line.get(4..).unwrap_or_default().to_string());
    }

    Ok(Reply::new(ReplyCode::new(code), message))
}

/// Checks if a line is the last line of a multi-line reply.
///
/// Multi-line replies use `-` separator for continuation and ` ` for the last line.
/// A bare three-digit code is also final.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    (bytes.len() == 3 || (bytes.len() >= 4 && bytes[3] == b' '))
        && bytes[..3].iter().all(u8::is_ascii_digit)
}

/// Parses raw reply text (possibly several CRLF-separated lines) into a
/// classified response.
///
/// Only the final line is inspected: its code and text decide the result.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the final line does not start with a
/// three-digit code.
pub fn parse_response(raw: &str) -> Result<SmtpResponse> {
    let last = raw
        .trim()
        .split("\r\n")
        .last()
        .unwrap_or_default()
        .trim_end();

    let regex = FINAL_LINE
        .as_ref()
        .ok_or_else(|| Error::Protocol("reply pattern failed to compile".into()))?;
    let captures = regex
        .captures(last)
        .ok_or_else(|| Error::Protocol(format!("Invalid SMTP response format: {raw}")))?;

    let code = captures[1]
        .parse::<u16>()
        .map_err(|_| Error::Protocol(format!("Invalid reply code in: {last}")))?;
    let message = captures.get(2).map_or("", |m| m.as_str());

    Ok(SmtpResponse::new(code, message))
}
