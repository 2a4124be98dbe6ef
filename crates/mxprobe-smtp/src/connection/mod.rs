//! SMTP connection management.

mod config;
mod framed;
mod session;
mod stream;

pub use config::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_PORT, DEFAULT_SENDER,
    SessionConfig, TlsPolicy, TlsVersion,
};
pub use framed::ReplyReader;
pub use session::{
    CONNECTION_ERROR_MESSAGE, ProbeSession, RcptOutcome, SessionState, SessionStats,
};
pub use stream::{SmtpStream, create_tls_connector};

use crate::types::{Extension, Reply};
use std::collections::HashSet;

/// Server capabilities from EHLO response.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Server hostname from greeting.
    pub hostname: String,
    /// Supported extensions.
    pub extensions: HashSet<Extension>,
}

impl ServerInfo {
    /// Builds capabilities from a successful EHLO reply.
    ///
    /// The first line is the server's greeting; each later line is one
    /// extension keyword with optional parameters.
    #[must_use]
    pub fn from_ehlo(reply: &Reply) -> Self {
        Self {
            hostname: String::new(),
            extensions: reply
                .message
                .iter()
                .skip(1)
                .map(|line| Extension::parse(line))
                .collect(),
        }
    }

    /// Checks if the server supports an extension.
    #[must_use]
    pub fn supports(&self, ext: &Extension) -> bool {
        self.extensions.contains(ext)
    }

    /// Checks if STARTTLS is supported.
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.supports(&Extension::StartTls)
    }

    /// Checks if PIPELINING is supported.
    #[must_use]
    pub fn supports_pipelining(&self) -> bool {
        self.supports(&Extension::Pipelining)
    }

    /// Returns the maximum message size, if advertised.
    #[must_use]
    pub fn max_message_size(&self) -> Option<usize> {
        self.extensions.iter().find_map(|ext| match ext {
            Extension::Size(size) => *size,
            _ => None,
        })
    }
}
