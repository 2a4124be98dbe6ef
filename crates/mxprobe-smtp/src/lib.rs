//! # mxprobe-smtp
//!
//! SMTP plumbing for recipient probing: ask a mail exchanger whether it
//! would accept a recipient, without ever sending a message.
//!
//! ## Features
//!
//! - **Probe sessions**: greeting, EHLO with HELO fallback, opportunistic
//!   STARTTLS, then `MAIL FROM` + `RCPT TO` only
//! - **Pipelining**: RCPT batches go out in one write when the server
//!   advertises PIPELINING; replies are paired by emission order
//! - **Provider pacing**: sequential RCPT with a pause for large consumer
//!   mailbox providers
//! - **Reply classification**: category, catch-all detection, retryable codes
//! - **Connection pool**: bounded per `host:port`, idle reuse with RSET,
//!   background eviction of stale sessions
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mxprobe_smtp::{ConnectionPool, PoolConfig, SessionConfig, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> mxprobe_smtp::Result<()> {
//!     let session = Arc::new(SessionConfig::new("probe@example.com")?);
//!     let pool = ConnectionPool::new(TcpTransport, session, PoolConfig::default());
//!
//!     let mut conn = pool
//!         .get_connection("mx.example.org", 25, std::time::Duration::from_secs(10), false)
//!         .await?;
//!     let outcomes = conn
//!         .session_mut()
//!         .probe_rcpt_batch(&["user@example.org".to_string()])
//!         .await?;
//!     for outcome in &outcomes {
//!         println!("{} -> {}", outcome.email, outcome.response.code);
//!     }
//!
//!     pool.release_connection(conn).await;
//!     pool.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`command`]: SMTP command builders
//! - [`connection`]: Sessions, streams and configuration
//! - [`parser`]: Reply parsing
//! - [`pool`]: Per-host connection pool
//! - [`quirks`]: Provider pacing
//! - [`types`]: Replies, classified responses, extensions, addresses

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
mod error;
pub mod parser;
pub mod pool;
pub mod quirks;
pub mod types;

pub use connection::{
    ProbeSession, RcptOutcome, ServerInfo, SessionConfig, SessionState, SessionStats, TlsPolicy,
    TlsVersion,
};
pub use error::{Error, Result};
pub use parser::parse_response;
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection, TcpTransport, Transport};
pub use quirks::ProviderThrottle;
pub use types::{Address, Extension, Reply, ReplyCode, ResponseCategory, SmtpResponse};
