//! Plain or TLS transport under an SMTP session.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use super::config::TlsPolicy;
use crate::error::{Error, Result};

/// A stream that can be either plaintext or TLS.
///
/// Generic over the transport so sessions run the same way over TCP in
/// production and over in-memory or loopback streams in tests.
#[derive(Debug)]
pub enum SmtpStream<S> {
    /// Plaintext stream.
    Plain(S),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<S>>),
}

impl<S> SmtpStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Upgrades a plaintext stream to TLS.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already TLS, the policy is
    /// unusable, or the handshake fails.
    pub async fn upgrade_to_tls(self, host: &str, policy: &TlsPolicy) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let connector = create_tls_connector(policy)?;
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|_| Error::Protocol(format!("Invalid hostname: {host}")))?;
                let tls = connector.connect(server_name, stream).await?;
                Ok(Self::Tls(Box::new(tls)))
            }
            Self::Tls(_) => Err(Error::InvalidState("Stream is already TLS".to_string())),
        }
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl<S> AsyncRead for SmtpStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for SmtpStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Creates a TLS connector honoring the version range and certificate
/// policy.
///
/// # Errors
///
/// Returns [`Error::Config`] if the version range is empty and
/// [`Error::Tls`] if rustls rejects the configuration.
pub fn create_tls_connector(policy: &TlsPolicy) -> Result<TlsConnector> {
    let versions = policy.protocol_versions();
    if versions.is_empty() {
        return Err(Error::Config(format!(
            "TLS minimum version {} is above maximum {}",
            policy.min_version, policy.max_version
        )));
    }

    let provider = CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)?;

    let config = if policy.reject_unauthorized {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Skips chain and hostname checks but still verifies handshake signatures.
///
/// Mail exchangers routinely present self-signed or mismatched
/// certificates; this is only installed when `reject_unauthorized` is off.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::connection::config::TlsVersion;

    #[test]
    fn connector_for_default_policy() {
        assert!(create_tls_connector(&TlsPolicy::default()).is_ok());
    }

    #[test]
    fn connector_without_verification() {
        let policy = TlsPolicy {
            reject_unauthorized: false,
            ..TlsPolicy::default()
        };
        assert!(create_tls_connector(&policy).is_ok());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let policy = TlsPolicy {
            min_version: TlsVersion::Tls13,
            max_version: TlsVersion::Tls12,
            ..TlsPolicy::default()
        };
        assert!(matches!(
            create_tls_connector(&policy),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn plain_stream_is_not_tls() {
        let mock = tokio_test::io::Builder::new().build();
        let stream = SmtpStream::Plain(mock);
        assert!(!stream.is_tls());
    }
}
