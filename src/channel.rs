//! Secured channels over raw byte streams.
//!
//! A [`SecureChannelFactory`] is built once per process from the immutable
//! [`ChannelConfig`]. For each raw connection it runs the TLS handshake and
//! hands back a [`SecuredChannel`], the only thing a transfer session talks to.
//!
//! The factory is generic over the raw stream so the same code runs over TCP
//! in production and over in-memory pipes in tests.

use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{AlertDescription, CipherSuite, PeerIncompatible, ProtocolVersion};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::debug;

use crate::error::{Error, HandshakeFailure, Result};
use crate::protocol::{frame_header, parse_frame_header, FRAME_HEADER_LEN};
use crate::tls::{CertificateMaterial, ChannelConfig};

/// Which side of the handshake a factory performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

enum Handshaker {
    Server(TlsAcceptor),
    Client {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

/// Performs handshakes according to one [`ChannelConfig`].
pub struct SecureChannelFactory {
    config: Arc<ChannelConfig>,
    handshaker: Handshaker,
}

impl SecureChannelFactory {
    /// Build the rustls configuration for `role` once.
    ///
    /// The server role needs certificate material; the client role uses it
    /// only for mutual authentication.
    pub fn new(
        role: Role,
        config: Arc<ChannelConfig>,
        material: Option<&CertificateMaterial>,
    ) -> Result<Self> {
        let handshaker = match role {
            Role::Server => {
                let material = material.ok_or_else(|| {
                    Error::configuration("server role requires a certificate and private key")
                })?;
                let tls = config.server_config(material)?;
                Handshaker::Server(TlsAcceptor::from(Arc::new(tls)))
            }
            Role::Client => {
                let tls = config.client_config(material)?;
                Handshaker::Client {
                    connector: TlsConnector::from(Arc::new(tls)),
                    server_name: config.server_name()?,
                }
            }
        };

        Ok(Self { config, handshaker })
    }

    pub fn server(config: Arc<ChannelConfig>, material: &CertificateMaterial) -> Result<Self> {
        Self::new(Role::Server, config, Some(material))
    }

    pub fn client(config: Arc<ChannelConfig>, material: Option<&CertificateMaterial>) -> Result<Self> {
        Self::new(Role::Client, config, material)
    }

    pub fn role(&self) -> Role {
        match self.handshaker {
            Handshaker::Server(_) => Role::Server,
            Handshaker::Client { .. } => Role::Client,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Run the handshake over `raw`, bounded by the handshake timeout.
    pub async fn establish<S>(&self, raw: S) -> Result<SecuredChannel<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = async {
            match &self.handshaker {
                Handshaker::Server(acceptor) => acceptor.accept(raw).await.map(TlsStream::from),
                Handshaker::Client {
                    connector,
                    server_name,
                } => connector
                    .connect(server_name.clone(), raw)
                    .await
                    .map(TlsStream::from),
            }
        };

        let stream = match timeout(self.config.handshake_timeout(), handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(match tls_failure(&e) {
                    Some(err) => err,
                    None => Error::handshake(HandshakeFailure::Negotiation, e.to_string()),
                })
            }
            Err(_) => {
                return Err(Error::handshake(
                    HandshakeFailure::Timeout,
                    format!(
                        "no handshake within {:?}",
                        self.config.handshake_timeout()
                    ),
                ))
            }
        };

        let channel = SecuredChannel {
            stream,
            io_timeout: self.config.io_timeout(),
        };
        debug!(
            "Handshake complete: {:?}, {:?}",
            channel.protocol_version(),
            channel.cipher_suite()
        );
        Ok(channel)
    }
}

/// An established TLS session over one raw connection.
///
/// Dropping the channel releases the connection; [`SecuredChannel::close`]
/// additionally sends `close_notify` first.
pub struct SecuredChannel<S> {
    stream: TlsStream<S>,
    io_timeout: std::time::Duration,
}

impl<S> SecuredChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.stream.get_ref().1.protocol_version()
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.stream
            .get_ref()
            .1
            .negotiated_cipher_suite()
            .map(|suite| suite.suite())
    }

    /// Read exactly `n` bytes.
    pub async fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_exactly_into(&mut buf).await?;
        Ok(buf)
    }

    /// Fill `buf` completely. Fails with `ConnectionClosed` if the peer
    /// closes first and `Timeout` if the I/O timeout expires.
    pub async fn read_exactly_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let io_timeout = self.io_timeout;
        timeout(io_timeout, self.fill(buf))
            .await
            .map_err(|_| Error::Timeout("read"))?
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]).await {
                Ok(0) => {
                    return Err(Error::ConnectionClosed {
                        expected: buf.len(),
                        received: filled,
                    })
                }
                Ok(n) => filled += n,
                Err(e) => return Err(transport_failure(e, buf.len(), filled)),
            }
        }
        Ok(())
    }

    /// Hand all of `bytes` to the transport. A peer that hung up surfaces
    /// as `ConnectionClosed`.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        timeout(self.io_timeout, self.stream.write_all(bytes))
            .await
            .map_err(|_| Error::Timeout("write"))?
            .map_err(|e| transport_failure(e, bytes.len(), 0))
    }

    pub async fn flush(&mut self) -> Result<()> {
        timeout(self.io_timeout, self.stream.flush())
            .await
            .map_err(|_| Error::Timeout("flush"))?
            .map_err(|e| transport_failure(e, 0, 0))
    }

    /// Write one length-prefixed frame.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let header = frame_header(payload.len())?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(payload);
        self.write(&frame).await
    }

    /// Read one frame whose payload may not exceed `max_len`.
    pub async fn recv_frame(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.read_exactly_into(&mut header).await?;
        let len = parse_frame_header(header, max_len)?;
        self.read_exactly(len).await
    }

    /// Send `close_notify` and shut the transport down.
    pub async fn close(mut self) -> Result<()> {
        timeout(self.io_timeout, self.stream.shutdown())
            .await
            .map_err(|_| Error::Timeout("close"))?
            .map_err(io_failure)
    }
}

fn io_failure(e: io::Error) -> Error {
    tls_failure(&e).unwrap_or(Error::Io(e))
}

/// Classify a read or write failure: TLS alert, lost peer, or plain I/O.
fn transport_failure(e: io::Error, expected: usize, transferred: usize) -> Error {
    if let Some(err) = tls_failure(&e) {
        return err;
    }
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => Error::ConnectionClosed {
            expected,
            received: transferred,
        },
        _ => Error::Io(e),
    }
}

/// Extract a TLS-level failure carried inside an I/O error.
fn tls_failure(e: &io::Error) -> Option<Error> {
    let tls = e.get_ref()?.downcast_ref::<rustls::Error>()?;
    Some(Error::handshake(classify(tls), tls.to_string()))
}

fn classify(err: &rustls::Error) -> HandshakeFailure {
    use rustls::Error as E;

    match err {
        E::PeerIncompatible(PeerIncompatible::NoCipherSuitesInCommon) => {
            HandshakeFailure::CipherMismatch
        }
        E::PeerIncompatible(
            PeerIncompatible::SupportedVersionsExtensionRequired
            | PeerIncompatible::Tls12NotOffered
            | PeerIncompatible::Tls12NotOfferedOrEnabled
            | PeerIncompatible::ServerDoesNotSupportTls12Or13
            | PeerIncompatible::ServerTlsVersionIsDisabledByOurConfig,
        ) => HandshakeFailure::ProtocolVersionRejected,
        E::InvalidCertificate(_) | E::NoCertificatesPresented => {
            HandshakeFailure::CertificateValidationFailed
        }
        E::AlertReceived(alert) => match alert {
            AlertDescription::ProtocolVersion => HandshakeFailure::ProtocolVersionRejected,
            AlertDescription::HandshakeFailure | AlertDescription::InsufficientSecurity => {
                HandshakeFailure::CipherMismatch
            }
            AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateUnknown
            | AlertDescription::CertificateRequired
            | AlertDescription::UnknownCA
            | AlertDescription::AccessDenied => HandshakeFailure::CertificateValidationFailed,
            _ => HandshakeFailure::Negotiation,
        },
        _ => HandshakeFailure::Negotiation,
    }
}
