//! A single probing session against one mail exchanger.
//!
//! A session greets the server (EHLO, falling back to HELO), optionally
//! upgrades with STARTTLS, and then asks about recipients with
//! `MAIL FROM` + `RCPT TO` without ever sending `DATA`.
//!
//! After the handshake the stream is split: a reader task pulls replies
//! off the wire and hands each one to the oldest waiting command. Waiters
//! are queued before their command is written, so replies pair with
//! commands in emission order even when many RCPTs are in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::config::SessionConfig;
use super::framed::ReplyReader;
use super::stream::SmtpStream;
use super::ServerInfo;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::types::{Address, Reply, ReplyCode, SmtpResponse};

/// Message used for recipients lost to a transport failure.
pub const CONNECTION_ERROR_MESSAGE: &str = "Connection error";

type ReplySender = oneshot::Sender<Result<Reply>>;
type ReplyReceiver = oneshot::Receiver<Result<Reply>>;

/// Observable state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Mail exchanger host.
    pub host: String,
    /// Mail exchanger port.
    pub port: u16,
    /// Handshake completed and the transport has not failed.
    pub connected: bool,
    /// The stream is encrypted.
    pub tls_active: bool,
    /// RCPT commands may be pipelined.
    pub pipelining_supported: bool,
    /// Time of the last command or reply.
    pub last_activity: Instant,
}

/// Command counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Commands that got a reply (including the greeting).
    pub total_commands: u64,
    /// Replies in the 2xx or 3xx range.
    pub successful_commands: u64,
    /// Any other reply.
    pub failed_commands: u64,
    /// Sum of reply latencies.
    pub total_response_time: Duration,
}

impl SessionStats {
    fn record(&mut self, code: ReplyCode, elapsed: Duration) {
        self.total_commands += 1;
        if code.is_success() || code.is_intermediate() {
            self.successful_commands += 1;
        } else {
            self.failed_commands += 1;
        }
        self.total_response_time += elapsed;
    }

    /// Mean reply latency over every recorded command.
    #[must_use]
    pub fn average_response_time(&self) -> Duration {
        u32::try_from(self.total_commands)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| self.total_response_time / n)
    }
}

/// What the server said about one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcptOutcome {
    /// Recipient as given.
    pub email: String,
    /// Classified reply. Code `0` means no reply was received.
    pub response: SmtpResponse,
    /// Time from sending RCPT to its reply.
    pub response_time: Duration,
    /// Why no reply was received, when `response.code == 0`.
    pub error: Option<String>,
}

impl RcptOutcome {
    fn from_reply(email: &str, reply: &Reply, response_time: Duration) -> Self {
        Self {
            email: email.to_string(),
            response: SmtpResponse::from(reply),
            response_time,
            error: None,
        }
    }

    fn connection_error(email: &str, error: &Error) -> Self {
        Self {
            email: email.to_string(),
            response: SmtpResponse::new(0, CONNECTION_ERROR_MESSAGE),
            response_time: Duration::ZERO,
            error: Some(error.to_string()),
        }
    }

    fn invalid_address(email: &str, error: &Error) -> Self {
        Self {
            email: email.to_string(),
            response: SmtpResponse::new(0, error.to_string()),
            response_time: Duration::ZERO,
            error: Some(error.to_string()),
        }
    }

    /// Returns true if this outcome was synthesized rather than replied to.
    #[must_use]
    pub const fn is_synthetic(&self) -> bool {
        self.response.code == 0
    }
}

/// Split transport used after the handshake.
struct Link<S> {
    writer: WriteHalf<SmtpStream<S>>,
    waiters: mpsc::UnboundedSender<ReplySender>,
    reader: JoinHandle<()>,
}

impl<S> Drop for Link<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// An established SMTP session used for recipient probing.
pub struct ProbeSession<S> {
    config: Arc<SessionConfig>,
    state: SessionState,
    server_info: ServerInfo,
    stats: SessionStats,
    transaction_open: bool,
    link: Option<Link<S>>,
}

impl<S> std::fmt::Debug for ProbeSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSession")
            .field("state", &self.state)
            .field("stats", &self.stats)
            .field("transaction_open", &self.transaction_open)
            .finish_non_exhaustive()
    }
}

impl<S> ProbeSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Runs the greeting, EHLO/HELO and optional STARTTLS over `stream`.
    ///
    /// With `implicit_tls` the TLS handshake happens before the greeting
    /// (port 465 style) and STARTTLS is skipped.
    ///
    /// # Errors
    ///
    /// Fails if the greeting or both EHLO and HELO are rejected, if any
    /// handshake reply times out, or if a TLS handshake fails.
    pub async fn handshake(
        stream: S,
        host: &str,
        port: u16,
        config: Arc<SessionConfig>,
        implicit_tls: bool,
    ) -> Result<Self> {
        let mut stats = SessionStats::default();
        let mut stream = SmtpStream::Plain(stream);
        if implicit_tls {
            stream = stream.upgrade_to_tls(host, &config.tls).await?;
        }
        let mut reader = ReplyReader::new(stream);

        let started = Instant::now();
        let greeting = tokio::time::timeout(config.command_timeout, reader.read_reply())
            .await
            .map_err(|_| Error::timeout("greeting"))??;
        stats.record(greeting.code, started.elapsed());
        if !greeting.is_success() {
            return Err(Error::smtp_error(
                greeting.code.as_u16(),
                greeting.message_text(),
            ));
        }

        let mut server_info = greet(&mut reader, &config, &mut stats).await?;
        if let Some(hostname) = greeting
            .message
            .first()
            .and_then(|msg| msg.split_whitespace().next())
        {
            server_info.hostname = hostname.to_string();
        }

        let mut tls_active = implicit_tls;
        if config.tls.enabled && !tls_active {
            if server_info.supports_starttls() {
                match exchange(&mut reader, &Command::StartTls, config.command_timeout, &mut stats)
                    .await
                {
                    Ok(reply) if reply.code == ReplyCode::SERVICE_READY => {
                        if reader.has_buffered_data() {
                            return Err(Error::Protocol(
                                "data received before TLS handshake".into(),
                            ));
                        }
                        let stream = reader.into_inner().upgrade_to_tls(host, &config.tls).await?;
                        reader = ReplyReader::new(stream);
                        tls_active = true;
                        let hostname = std::mem::take(&mut server_info.hostname);
                        server_info = greet(&mut reader, &config, &mut stats).await?;
                        server_info.hostname = hostname;
                        tracing::debug!(host, "STARTTLS negotiated");
                    }
                    Ok(reply) => {
                        tracing::warn!(host, code = %reply.code, "STARTTLS refused, continuing in plaintext");
                    }
                    Err(Error::Timeout { .. }) => {
                        tracing::warn!(host, "STARTTLS timed out, continuing in plaintext");
                    }
                    Err(e) => return Err(e),
                }
            } else {
                tracing::debug!(host, "STARTTLS not offered, continuing in plaintext");
            }
        }

        if reader.has_buffered_data() {
            return Err(Error::Protocol("unexpected data after handshake".into()));
        }

        let pipelining_supported = config.enable_pipelining && server_info.supports_pipelining();
        let (read_half, writer) = tokio::io::split(reader.into_inner());
        let (waiters, queue) = mpsc::unbounded_channel();
        let reader = tokio::spawn(demux(ReplyReader::new(read_half), queue));

        tracing::debug!(host, port, tls_active, pipelining_supported, "SMTP session established");

        Ok(Self {
            state: SessionState {
                host: host.to_string(),
                port,
                connected: true,
                tls_active,
                pipelining_supported,
                last_activity: Instant::now(),
            },
            config,
            server_info,
            stats,
            transaction_open: false,
            link: Some(Link {
                writer,
                waiters,
                reader,
            }),
        })
    }

    /// Probes a batch of recipients inside one `MAIL FROM` transaction.
    ///
    /// Outcomes come back in input order. Recipients of throttled
    /// providers, or any batch on a server without PIPELINING, are probed
    /// one at a time with the configured pause. If the transport fails
    /// mid-batch, that recipient and all later ones get a synthetic
    /// connection-error outcome and the session is marked disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not connected, if resetting a
    /// previous transaction fails, or if `MAIL FROM` fails or is rejected.
    pub async fn probe_rcpt_batch(&mut self, recipients: &[String]) -> Result<Vec<RcptOutcome>> {
        self.ensure_connected()?;
        if recipients.is_empty() {
            return Ok(Vec::new());
        }
        if self.transaction_open {
            self.reset().await?;
        }

        let mail_from = Command::MailFrom {
            from: self.config.sender.clone(),
        };
        let mail = self.execute(&mail_from).await?;
        if !mail.is_success() {
            return Err(Error::smtp_error(mail.code.as_u16(), mail.message_text()));
        }
        self.transaction_open = true;

        let throttled = recipients
            .iter()
            .any(|r| self.config.throttle.provider_delay(domain_of(r)).is_some());

        if self.state.pipelining_supported && !throttled {
            Ok(self.rcpt_pipelined(recipients).await)
        } else {
            Ok(self.rcpt_sequential(recipients).await)
        }
    }

    async fn rcpt_sequential(&mut self, recipients: &[String]) -> Vec<RcptOutcome> {
        let mut outcomes = Vec::with_capacity(recipients.len());

        for (i, email) in recipients.iter().enumerate() {
            if i > 0 {
                let delay = self.config.throttle.delay_for(domain_of(email));
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let to = match Address::new(email.as_str()) {
                Ok(to) => to,
                Err(e) => {
                    outcomes.push(RcptOutcome::invalid_address(email, &e));
                    continue;
                }
            };

            let started = Instant::now();
            match self.execute(&Command::RcptTo { to }).await {
                Ok(reply) => {
                    outcomes.push(RcptOutcome::from_reply(email, &reply, started.elapsed()));
                }
                Err(e) => {
                    tracing::warn!(host = %self.state.host, error = %e, remaining = recipients.len() - i, "RCPT failed, abandoning batch");
                    outcomes.extend(
                        recipients[i..]
                            .iter()
                            .map(|r| RcptOutcome::connection_error(r, &e)),
                    );
                    break;
                }
            }
        }

        outcomes
    }

    async fn rcpt_pipelined(&mut self, recipients: &[String]) -> Vec<RcptOutcome> {
        enum Slot {
            Rejected(Error),
            Sent(ReplyReceiver),
        }

        let mut buffer = Vec::new();
        let mut slots = Vec::with_capacity(recipients.len());
        let mut failure = None;

        for email in recipients {
            match Address::new(email.as_str()) {
                Ok(to) => match self.register_waiter() {
                    Ok(rx) => {
                        buffer.extend_from_slice(&Command::RcptTo { to }.serialize());
                        slots.push(Slot::Sent(rx));
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                },
                Err(e) => slots.push(Slot::Rejected(e)),
            }
        }

        let started = Instant::now();
        if failure.is_none() && !buffer.is_empty() {
            if let Err(e) = self.write_raw(&buffer, "RCPT").await {
                failure = Some(e);
            }
        }

        let mut outcomes = Vec::with_capacity(recipients.len());
        let mut slots = slots.into_iter();
        for email in recipients {
            if let Some(e) = &failure {
                outcomes.push(RcptOutcome::connection_error(email, e));
                continue;
            }
            match slots.next() {
                Some(Slot::Rejected(e)) => outcomes.push(RcptOutcome::invalid_address(email, &e)),
                Some(Slot::Sent(rx)) => match self.await_reply(rx, "RCPT", started).await {
                    Ok(reply) => {
                        outcomes.push(RcptOutcome::from_reply(email, &reply, started.elapsed()));
                    }
                    Err(e) => {
                        tracing::warn!(host = %self.state.host, error = %e, "pipelined RCPT failed, abandoning batch");
                        outcomes.push(RcptOutcome::connection_error(email, &e));
                        failure = Some(e);
                    }
                },
                None => {
                    let e = Error::ConnectionClosed;
                    outcomes.push(RcptOutcome::connection_error(email, &e));
                    failure = Some(e);
                }
            }
        }

        outcomes
    }

    /// Sends `RSET`, ending any open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is disconnected or the server does
    /// not accept the reset.
    pub async fn reset(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let reply = self.execute(&Command::Rset).await?;
        if !reply.is_success() {
            return Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()));
        }
        self.transaction_open = false;
        Ok(())
    }

    /// Sends `QUIT` if still connected and tears the transport down.
    ///
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state.connected && self.link.is_some() {
            if let Err(e) = self.execute(&Command::Quit).await {
                tracing::debug!(host = %self.state.host, error = %e, "QUIT failed during close");
            }
        }
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.writer.shutdown().await {
                tracing::trace!(error = %e, "shutdown after QUIT");
            }
        }
        self.state.connected = false;
        self.transaction_open = false;
    }

    async fn execute(&mut self, command: &Command) -> Result<Reply> {
        tracing::trace!(command = command.verb(), "C:");
        let started = Instant::now();
        let rx = self.register_waiter()?;
        self.write_raw(&command.serialize(), command.verb()).await?;
        self.await_reply(rx, command.verb(), started).await
    }

    fn register_waiter(&mut self) -> Result<ReplyReceiver> {
        let link = self.link.as_ref().ok_or(Error::ConnectionClosed)?;
        let (tx, rx) = oneshot::channel();
        if link.waiters.send(tx).is_err() {
            self.mark_broken();
            return Err(Error::ConnectionClosed);
        }
        Ok(rx)
    }

    async fn write_raw(&mut self, bytes: &[u8], verb: &str) -> Result<()> {
        let timeout = self.config.command_timeout;
        let link = self.link.as_mut().ok_or(Error::ConnectionClosed)?;
        let write = async {
            link.writer.write_all(bytes).await?;
            link.writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        let result = match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::timeout(verb)),
        };
        if result.is_err() {
            self.mark_broken();
        }
        result
    }

    async fn await_reply(&mut self, rx: ReplyReceiver, verb: &str, started: Instant) -> Result<Reply> {
        let result = match tokio::time::timeout(self.config.command_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::timeout(verb)),
        };
        match result {
            Ok(reply) => {
                self.stats.record(reply.code, started.elapsed());
                self.state.last_activity = Instant::now();
                Ok(reply)
            }
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state.connected && self.link.is_some() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "session with {}:{} is not connected",
                self.state.host, self.state.port
            )))
        }
    }
}

impl<S> ProbeSession<S> {
    /// Drops the transport after a failure; the session cannot be reused.
    fn mark_broken(&mut self) {
        self.state.connected = false;
        self.link = None;
    }

    /// Returns true while the session can still carry commands.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected
            && self
                .link
                .as_ref()
                .is_some_and(|link| !link.reader.is_finished())
    }

    /// Current session state.
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// Server capabilities from the last EHLO.
    #[must_use]
    pub const fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Command counters.
    #[must_use]
    pub const fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Returns true if `MAIL FROM` was accepted and no `RSET` followed yet.
    #[must_use]
    pub const fn has_open_transaction(&self) -> bool {
        self.transaction_open
    }
}

/// Hands each incoming reply to the oldest waiting command.
async fn demux<S>(
    mut reader: ReplyReader<ReadHalf<SmtpStream<S>>>,
    mut waiters: mpsc::UnboundedReceiver<ReplySender>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(waiter) = waiters.recv().await {
        let reply = reader.read_reply().await;
        let fatal = reply.is_err();
        if waiter.send(reply).is_err() {
            tracing::trace!("reply arrived after its command was abandoned");
        }
        if fatal {
            break;
        }
    }
}

/// EHLO, falling back to HELO.
async fn greet<S>(
    reader: &mut ReplyReader<SmtpStream<S>>,
    config: &SessionConfig,
    stats: &mut SessionStats,
) -> Result<ServerInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ehlo = Command::Ehlo {
        hostname: config.helo_domain.clone(),
    };
    let reply = exchange(reader, &ehlo, config.command_timeout, stats).await?;
    if reply.is_success() {
        return Ok(ServerInfo::from_ehlo(&reply));
    }

    tracing::debug!(code = %reply.code, "EHLO rejected, falling back to HELO");
    let helo = Command::Helo {
        hostname: config.helo_domain.clone(),
    };
    let reply = exchange(reader, &helo, config.command_timeout, stats).await?;
    if reply.is_success() {
        Ok(ServerInfo::default())
    } else {
        Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()))
    }
}

/// Write one command and read its reply during the handshake.
async fn exchange<S>(
    reader: &mut ReplyReader<SmtpStream<S>>,
    command: &Command,
    timeout: Duration,
    stats: &mut SessionStats,
) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::trace!(command = command.verb(), "C:");
    let started = Instant::now();
    let reply = tokio::time::timeout(timeout, round_trip(reader, command))
        .await
        .map_err(|_| Error::timeout(command.verb()))??;
    stats.record(reply.code, started.elapsed());
    Ok(reply)
}

async fn round_trip<S>(reader: &mut ReplyReader<SmtpStream<S>>, command: &Command) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = reader.get_mut();
    stream.write_all(&command.serialize()).await?;
    stream.flush().await?;
    reader.read_reply().await
}

fn domain_of(email: &str) -> &str {
    email.rsplit_once('@').map_or("", |(_, domain)| domain)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::connection::TlsPolicy;
    use crate::quirks::ProviderThrottle;
    use tokio_test::io::Builder;

    fn config() -> Arc<SessionConfig> {
        Arc::new(
            SessionConfig::new("probe@example.com")
                .unwrap()
                .command_timeout(Duration::from_secs(2))
                .throttle(ProviderThrottle::disabled()),
        )
    }

    fn emails(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn handshake_with_ehlo() {
        let mock = Builder::new()
            .read(b"220 mx.example.com ESMTP\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250-mx.example.com\r\n250-PIPELINING\r\n250 SIZE 1000\r\n")
            .build();

        let session = ProbeSession::handshake(mock, "mx.example.com", 25, config(), false)
            .await
            .unwrap();
        assert!(session.state().connected);
        assert!(session.state().pipelining_supported);
        assert!(!session.state().tls_active);
        assert_eq!(session.server_info().hostname, "mx.example.com");
        assert_eq!(session.stats().total_commands, 2);
    }

    #[tokio::test]
    async fn handshake_falls_back_to_helo() {
        let mock = Builder::new()
            .read(b"220 old.example.com\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"502 command not implemented\r\n")
            .write(b"HELO example.com\r\n")
            .read(b"250 old.example.com\r\n")
            .build();

        let session = ProbeSession::handshake(mock, "old.example.com", 25, config(), false)
            .await
            .unwrap();
        assert!(!session.state().pipelining_supported);
        assert_eq!(session.stats().failed_commands, 1);
    }

    #[tokio::test]
    async fn handshake_rejected_greeting() {
        let mock = Builder::new().read(b"554 go away\r\n").build();
        let err = ProbeSession::handshake(mock, "mx", 25, config(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SmtpError { code: 554, .. }));
    }

    #[tokio::test]
    async fn pipelining_disabled_by_config() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250-mx\r\n250 PIPELINING\r\n")
            .build();
        let config = Arc::new((*config()).clone().enable_pipelining(false));
        let session = ProbeSession::handshake(mock, "mx", 25, config, false)
            .await
            .unwrap();
        assert!(!session.state().pipelining_supported);
    }

    #[tokio::test]
    async fn sequential_batch_pairs_replies() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250 mx\r\n")
            .write(b"MAIL FROM:<probe@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<a@example.org>\r\n")
            .read(b"250 2.1.5 OK\r\n")
            .write(b"RCPT TO:<b@example.org>\r\n")
            .read(b"550 5.1.1 unknown\r\n")
            .build();

        let mut session = ProbeSession::handshake(mock, "mx", 25, config(), false)
            .await
            .unwrap();
        let outcomes = session
            .probe_rcpt_batch(&emails(&["a@example.org", "b@example.org"]))
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].email, "a@example.org");
        assert_eq!(outcomes[0].response.code, 250);
        assert_eq!(outcomes[1].response.code, 550);
        assert!(outcomes.iter().all(|o| !o.is_synthetic()));
    }

    #[tokio::test]
    async fn pipelined_batch_writes_once() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250-mx\r\n250 PIPELINING\r\n")
            .write(b"MAIL FROM:<probe@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<a@example.org>\r\nRCPT TO:<b@example.org>\r\nRCPT TO:<c@example.org>\r\n")
            .read(b"250 OK\r\n451 4.7.1 greylisted\r\n550 no such user\r\n")
            .build();

        let mut session = ProbeSession::handshake(mock, "mx", 25, config(), false)
            .await
            .unwrap();
        let outcomes = session
            .probe_rcpt_batch(&emails(&["a@example.org", "b@example.org", "c@example.org"]))
            .await
            .unwrap();

        let codes: Vec<u16> = outcomes.iter().map(|o| o.response.code).collect();
        assert_eq!(codes, vec![250, 451, 550]);
        assert_eq!(outcomes[1].email, "b@example.org");
    }

    #[tokio::test]
    async fn mid_batch_disconnect_fills_remaining() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250 mx\r\n")
            .write(b"MAIL FROM:<probe@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<a@example.org>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<b@example.org>\r\n")
            .build();

        let mut session = ProbeSession::handshake(mock, "mx", 25, config(), false)
            .await
            .unwrap();
        let outcomes = session
            .probe_rcpt_batch(&emails(&["a@example.org", "b@example.org", "c@example.org"]))
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].response.code, 250);
        assert!(outcomes[1].is_synthetic());
        assert!(outcomes[2].is_synthetic());
        assert_eq!(outcomes[2].response.message, CONNECTION_ERROR_MESSAGE);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn rejected_sender_is_error() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250 mx\r\n")
            .write(b"MAIL FROM:<probe@example.com>\r\n")
            .read(b"553 sender rejected\r\n")
            .build();

        let mut session = ProbeSession::handshake(mock, "mx", 25, config(), false)
            .await
            .unwrap();
        let err = session
            .probe_rcpt_batch(&emails(&["a@example.org"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SmtpError { code: 553, .. }));
    }

    #[tokio::test]
    async fn second_batch_resets_transaction() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250 mx\r\n")
            .write(b"MAIL FROM:<probe@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<a@example.org>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RSET\r\n")
            .read(b"250 flushed\r\n")
            .write(b"MAIL FROM:<probe@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<b@example.org>\r\n")
            .read(b"250 OK\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 bye\r\n")
            .build();

        let mut session = ProbeSession::handshake(mock, "mx", 25, config(), false)
            .await
            .unwrap();
        session.probe_rcpt_batch(&emails(&["a@example.org"])).await.unwrap();
        session.probe_rcpt_batch(&emails(&["b@example.org"])).await.unwrap();
        session.close().await;
        session.close().await;
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn invalid_recipient_is_local_error() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250 mx\r\n")
            .write(b"MAIL FROM:<probe@example.com>\r\n")
            .read(b"250 OK\r\n")
            .build();

        let mut session = ProbeSession::handshake(mock, "mx", 25, config(), false)
            .await
            .unwrap();
        let outcomes = session
            .probe_rcpt_batch(&emails(&["bad address@example.org"]))
            .await
            .unwrap();
        assert!(outcomes[0].is_synthetic());
        assert!(outcomes[0].error.is_some());
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn probing_closed_session_fails() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250 mx\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 bye\r\n")
            .build();
        let mut session = ProbeSession::handshake(mock, "mx", 25, config(), false)
            .await
            .unwrap();
        session.close().await;
        assert!(matches!(
            session.probe_rcpt_batch(&emails(&["a@example.org"])).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn multi_line_rcpt_reply_uses_final_line() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250 mx\r\n")
            .write(b"MAIL FROM:<probe@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<a@example.org>\r\n")
            .read(b"250-relay policy notice\r\n250 2.1.5 Recipient OK\r\n")
            .build();

        let mut session = ProbeSession::handshake(mock, "mx", 25, config(), false)
            .await
            .unwrap();
        let outcomes = session
            .probe_rcpt_batch(&emails(&["a@example.org"]))
            .await
            .unwrap();

        assert_eq!(outcomes[0].response.code, 250);
        assert_eq!(outcomes[0].response.message, "2.1.5 Recipient OK");
        assert!(!outcomes[0].response.is_catch_all);
    }

    fn starttls_config(timeout: Duration) -> Arc<SessionConfig> {
        let tls = TlsPolicy {
            enabled: true,
            ..TlsPolicy::default()
        };
        Arc::new((*config()).clone().command_timeout(timeout).tls(tls))
    }

    #[tokio::test]
    async fn refused_starttls_continues_in_plaintext() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250-mx\r\n250 STARTTLS\r\n")
            .write(b"STARTTLS\r\n")
            .read(b"454 4.7.0 TLS not available\r\n")
            .write(b"MAIL FROM:<probe@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<a@example.org>\r\n")
            .read(b"250 2.1.5 OK\r\n")
            .build();

        let mut session =
            ProbeSession::handshake(mock, "mx", 25, starttls_config(Duration::from_secs(2)), false)
                .await
                .unwrap();
        assert!(!session.state().tls_active);
        assert!(session.state().connected);

        let outcomes = session
            .probe_rcpt_batch(&emails(&["a@example.org"]))
            .await
            .unwrap();
        assert_eq!(outcomes[0].response.code, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_starttls_continues_in_plaintext() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO example.com\r\n")
            .read(b"250-mx\r\n250 STARTTLS\r\n")
            .write(b"STARTTLS\r\n")
            .wait(Duration::from_millis(1500))
            .write(b"MAIL FROM:<probe@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<a@example.org>\r\n")
            .read(b"550 5.1.1 unknown\r\n")
            .build();

        let mut session =
            ProbeSession::handshake(mock, "mx", 25, starttls_config(Duration::from_secs(1)), false)
                .await
                .unwrap();
        assert!(!session.state().tls_active);
        assert!(session.state().connected);
        assert_eq!(session.stats().failed_commands, 0);

        // The server stays silent until its pause ends.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let outcomes = session
            .probe_rcpt_batch(&emails(&["a@example.org"]))
            .await
            .unwrap();
        assert_eq!(outcomes[0].response.code, 550);
    }

    #[test]
    fn stats_average() {
        let mut stats = SessionStats::default();
        stats.record(ReplyCode::OK, Duration::from_millis(100));
        stats.record(ReplyCode::MAILBOX_UNAVAILABLE, Duration::from_millis(300));
        assert_eq!(stats.average_response_time(), Duration::from_millis(200));
        assert_eq!(stats.successful_commands, 1);
        assert_eq!(stats.failed_commands, 1);
        assert_eq!(SessionStats::default().average_response_time(), Duration::ZERO);
    }
}
