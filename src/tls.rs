//! TLS material and policy.
//!
//! This module owns the two values that are built once at startup and shared
//! read-only by every session:
//!
//! - [`CertificateMaterial`]: the local certificate chain and private key,
//!   loaded by [`CertificateStore`] from PEM files.
//! - [`ChannelConfig`]: minimum protocol version, allowed cipher suites, peer
//!   verification mode and timeouts.
//!
//! It also turns a `ChannelConfig` into rustls client/server configurations,
//! including the certificate verifiers behind each [`VerifyMode`].
//!
//! ## Verification modes
//!
//! | mode                   | client role                       | server role                         |
//! |------------------------|-----------------------------------|-------------------------------------|
//! | `none`                 | any server certificate accepted   | no client certificate requested     |
//! | `check-chain`          | chain must reach a trust root     | client chain must reach a trust root |
//! | `check-chain+hostname` | chain + server name must match    | chain + client cert must name peer  |

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};
use rustls::{
    CipherSuite, DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme,
    SupportedProtocolVersion,
};
use rustls_pemfile::{certs, private_key};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default handshake and per-frame I/O timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cipher suites allowed when the caller does not restrict them.
pub const DEFAULT_CIPHER_SUITES: &[&str] = &[
    "TLS13_AES_256_GCM_SHA384",
    "TLS13_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
];

static TLS12_AND_UP: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];

/// Certificate chain and private key presented during the handshake.
pub struct CertificateMaterial {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl CertificateMaterial {
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub(crate) fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Loads certificate material and trust anchors from PEM.
pub struct CertificateStore;

impl CertificateStore {
    /// Load a certificate chain and its private key from PEM files.
    ///
    /// # Security Notes
    /// - The private key should be protected with appropriate file permissions (600)
    /// - The key is checked against the leaf certificate's public key
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<CertificateMaterial> {
        let chain = parse_certs(&mut open_pem(cert_path)?, cert_path)?;
        info!("Loaded {} certificate(s) from {:?}", chain.len(), cert_path);

        let key = parse_key(&mut open_pem(key_path)?, key_path)?;
        info!("Loaded private key from {:?}", key_path);

        check_key_matches(&chain, &key).map_err(|reason| Error::CertificateLoad {
            path: key_path.to_path_buf(),
            reason,
        })?;

        Ok(CertificateMaterial { chain, key })
    }

    /// Same as [`CertificateStore::load`] for PEM already in memory.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<CertificateMaterial> {
        let origin = PathBuf::from("<memory>");
        let chain = parse_certs(&mut BufReader::new(cert_pem.as_bytes()), &origin)?;
        let key = parse_key(&mut BufReader::new(key_pem.as_bytes()), &origin)?;

        check_key_matches(&chain, &key)
            .map_err(|reason| Error::CertificateLoad { path: origin, reason })?;

        Ok(CertificateMaterial { chain, key })
    }

    /// Load CA certificates used to validate the peer.
    pub fn load_trust_roots(path: &Path) -> Result<RootCertStore> {
        let certs = parse_certs(&mut open_pem(path)?, path)?;
        let roots = build_root_store(certs, path)?;
        info!("Loaded {} trust root(s) from {:?}", roots.len(), path);
        Ok(roots)
    }

    pub fn trust_roots_from_pem(ca_pem: &str) -> Result<RootCertStore> {
        let origin = PathBuf::from("<memory>");
        let certs = parse_certs(&mut BufReader::new(ca_pem.as_bytes()), &origin)?;
        build_root_store(certs, &origin)
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| Error::CertificateLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(BufReader::new(file))
}

fn parse_certs(reader: &mut dyn BufRead, origin: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let chain = certs(reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::CertificateLoad {
            path: origin.to_path_buf(),
            reason: format!("invalid PEM: {}", e),
        })?;

    if chain.is_empty() {
        return Err(Error::CertificateLoad {
            path: origin.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }

    Ok(chain)
}

fn parse_key(reader: &mut dyn BufRead, origin: &Path) -> Result<PrivateKeyDer<'static>> {
    private_key(reader)
        .map_err(|e| Error::CertificateLoad {
            path: origin.to_path_buf(),
            reason: format!("invalid PEM: {}", e),
        })?
        .ok_or_else(|| Error::CertificateLoad {
            path: origin.to_path_buf(),
            reason: "no private key found".to_string(),
        })
}

fn check_key_matches(
    chain: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> std::result::Result<(), String> {
    let provider = rustls::crypto::ring::default_provider();
    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| format!("unsupported private key: {}", e))?;

    CertifiedKey::new(chain.to_vec(), signing_key)
        .keys_match()
        .map_err(|e| format!("private key does not match certificate: {}", e))
}

fn build_root_store(certs: Vec<CertificateDer<'static>>, origin: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert).map_err(|e| Error::CertificateLoad {
            path: origin.to_path_buf(),
            reason: format!("unusable trust root: {}", e),
        })?;
    }
    Ok(roots)
}

/// Lowest TLS version a channel will negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn enabled_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12 => TLS12_AND_UP,
            TlsVersion::Tls13 => TLS13_ONLY,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().trim_start_matches("tls") {
            "1.2" | "12" => Ok(TlsVersion::Tls12),
            "1.3" | "13" => Ok(TlsVersion::Tls13),
            _ => Err(format!("unsupported TLS version {:?} (expected 1.2 or 1.3)", s)),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => f.write_str("TLS1.2"),
            TlsVersion::Tls13 => f.write_str("TLS1.3"),
        }
    }
}

/// How the peer's certificate is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    None,
    CheckChain,
    CheckChainAndHostname,
}

impl FromStr for VerifyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(VerifyMode::None),
            "check-chain" => Ok(VerifyMode::CheckChain),
            "check-chain+hostname" => Ok(VerifyMode::CheckChainAndHostname),
            _ => Err(format!(
                "unknown verify mode {:?} (expected none, check-chain or check-chain+hostname)",
                s
            )),
        }
    }
}

impl fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyMode::None => f.write_str("none"),
            VerifyMode::CheckChain => f.write_str("check-chain"),
            VerifyMode::CheckChainAndHostname => f.write_str("check-chain+hostname"),
        }
    }
}

/// Immutable TLS policy shared by every channel of a process.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    min_version: TlsVersion,
    cipher_suites: Vec<CipherSuite>,
    verify_mode: VerifyMode,
    expected_hostname: Option<String>,
    trust_roots: Option<Arc<RootCertStore>>,
    handshake_timeout: Duration,
    io_timeout: Duration,
}

impl ChannelConfig {
    /// Start a config. The verification mode is always an explicit choice.
    pub fn builder(verify_mode: VerifyMode) -> ChannelConfigBuilder {
        ChannelConfigBuilder {
            min_version: TlsVersion::Tls12,
            cipher_suites: DEFAULT_CIPHER_SUITES.iter().map(|s| s.to_string()).collect(),
            verify_mode,
            expected_hostname: None,
            trust_roots: None,
            handshake_timeout: DEFAULT_TIMEOUT,
            io_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn min_version(&self) -> TlsVersion {
        self.min_version
    }

    pub fn cipher_suites(&self) -> &[CipherSuite] {
        &self.cipher_suites
    }

    pub fn verify_mode(&self) -> VerifyMode {
        self.verify_mode
    }

    pub fn expected_hostname(&self) -> Option<&str> {
        self.expected_hostname.as_deref()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Name sent as SNI and, in `check-chain+hostname`, matched against the
    /// server certificate.
    pub(crate) fn server_name(&self) -> Result<ServerName<'static>> {
        let host = self.expected_hostname.as_deref().unwrap_or("localhost");
        ServerName::try_from(host.to_string())
            .map_err(|_| Error::configuration(format!("invalid peer hostname {:?}", host)))
    }

    fn crypto_provider(&self) -> Arc<CryptoProvider> {
        let mut provider = rustls::crypto::ring::default_provider();
        provider
            .cipher_suites
            .retain(|suite| self.cipher_suites.contains(&suite.suite()));
        Arc::new(provider)
    }

    fn roots(&self) -> Result<Arc<RootCertStore>> {
        self.trust_roots.clone().ok_or_else(|| {
            Error::configuration(format!(
                "verify mode {} requires trust roots (CA certificates)",
                self.verify_mode
            ))
        })
    }

    pub(crate) fn server_config(
        &self,
        material: &CertificateMaterial,
    ) -> Result<rustls::ServerConfig> {
        let provider = self.crypto_provider();

        let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(self.min_version.enabled_versions())
            .map_err(|e| Error::configuration(format!("TLS protocol versions: {}", e)))?;

        let builder = match self.verify_mode {
            VerifyMode::None => builder.with_no_client_auth(),
            mode => {
                let chain_verifier =
                    WebPkiClientVerifier::builder_with_provider(self.roots()?, provider.clone())
                        .build()
                        .map_err(|e| {
                            Error::configuration(format!("client certificate verifier: {}", e))
                        })?;

                let verifier: Arc<dyn ClientCertVerifier> =
                    if mode == VerifyMode::CheckChainAndHostname {
                        Arc::new(HostnameClientVerifier {
                            inner: chain_verifier,
                            expected: self.server_name()?,
                        })
                    } else {
                        chain_verifier
                    };

                builder.with_client_cert_verifier(verifier)
            }
        };

        builder
            .with_single_cert(material.chain().to_vec(), material.key())
            .map_err(|e| Error::configuration(format!("server certificate: {}", e)))
    }

    pub(crate) fn client_config(
        &self,
        material: Option<&CertificateMaterial>,
    ) -> Result<rustls::ClientConfig> {
        let provider = self.crypto_provider();
        let algorithms = provider.signature_verification_algorithms;

        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(self.min_version.enabled_versions())
            .map_err(|e| Error::configuration(format!("TLS protocol versions: {}", e)))?;

        let verifier: Arc<dyn ServerCertVerifier> = match self.verify_mode {
            VerifyMode::None => {
                warn!("Server certificate verification DISABLED (verify mode none)");
                Arc::new(AcceptAnyServerCert { algorithms })
            }
            VerifyMode::CheckChain => Arc::new(ChainOnlyServerVerifier {
                roots: self.roots()?,
                algorithms,
            }),
            VerifyMode::CheckChainAndHostname => {
                WebPkiServerVerifier::builder_with_provider(self.roots()?, provider.clone())
                    .build()
                    .map_err(|e| {
                        Error::configuration(format!("server certificate verifier: {}", e))
                    })?
            }
        };

        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        match material {
            Some(material) => builder
                .with_client_auth_cert(material.chain().to_vec(), material.key())
                .map_err(|e| Error::configuration(format!("client certificate: {}", e))),
            None => Ok(builder.with_no_client_auth()),
        }
    }
}

/// Builder for [`ChannelConfig`]; `build` validates the combination.
#[derive(Debug, Clone)]
pub struct ChannelConfigBuilder {
    min_version: TlsVersion,
    cipher_suites: Vec<String>,
    verify_mode: VerifyMode,
    expected_hostname: Option<String>,
    trust_roots: Option<RootCertStore>,
    handshake_timeout: Duration,
    io_timeout: Duration,
}

impl ChannelConfigBuilder {
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Replace the allowed suites. Names follow rustls, e.g.
    /// `TLS13_AES_256_GCM_SHA384`.
    pub fn cipher_suites<I, S>(mut self, suites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cipher_suites = suites.into_iter().map(Into::into).collect();
        self
    }

    pub fn expected_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.expected_hostname = Some(hostname.into());
        self
    }

    pub fn trust_roots(mut self, roots: RootCertStore) -> Self {
        self.trust_roots = Some(roots);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ChannelConfig> {
        let available = rustls::crypto::ring::default_provider().cipher_suites;

        let mut resolved = Vec::with_capacity(self.cipher_suites.len());
        for name in &self.cipher_suites {
            let suite = available
                .iter()
                .find(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(name))
                .ok_or_else(|| Error::configuration(format!("unknown cipher suite {:?}", name)))?;
            resolved.push(*suite);
        }

        let versions = self.min_version.enabled_versions();
        if !resolved
            .iter()
            .any(|s| versions.iter().any(|v| v.version == s.version().version))
        {
            return Err(Error::configuration(format!(
                "no configured cipher suite is usable with minimum version {}",
                self.min_version
            )));
        }

        if self.verify_mode != VerifyMode::None && self.trust_roots.is_none() {
            return Err(Error::configuration(format!(
                "verify mode {} requires trust roots (CA certificates)",
                self.verify_mode
            )));
        }

        if let Some(host) = &self.expected_hostname {
            ServerName::try_from(host.clone())
                .map_err(|_| Error::configuration(format!("invalid peer hostname {:?}", host)))?;
        } else if self.verify_mode == VerifyMode::CheckChainAndHostname {
            return Err(Error::configuration(
                "verify mode check-chain+hostname requires an expected hostname",
            ));
        }

        if self.handshake_timeout.is_zero() || self.io_timeout.is_zero() {
            return Err(Error::configuration("timeouts must be non-zero"));
        }

        debug!(
            "Channel policy: min {}, {} suite(s), verify {}",
            self.min_version,
            resolved.len(),
            self.verify_mode
        );

        Ok(ChannelConfig {
            min_version: self.min_version,
            cipher_suites: resolved.iter().map(|s| s.suite()).collect(),
            verify_mode: self.verify_mode,
            expected_hostname: self.expected_hostname,
            trust_roots: self.trust_roots.map(Arc::new),
            handshake_timeout: self.handshake_timeout,
            io_timeout: self.io_timeout,
        })
    }
}

/// Accepts any server certificate, but still checks handshake signatures
/// against the presented key.
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl fmt::Debug for AcceptAnyServerCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AcceptAnyServerCert")
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Validates the server chain against the trust roots, ignoring the name.
struct ChainOnlyServerVerifier {
    roots: Arc<RootCertStore>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl fmt::Debug for ChainOnlyServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainOnlyServerVerifier")
            .field("roots", &self.roots.len())
            .finish()
    }
}

impl ServerCertVerifier for ChainOnlyServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.algorithms.all,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client certificate verifier that also requires the certificate to name
/// the expected peer.
struct HostnameClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    expected: ServerName<'static>,
}

impl fmt::Debug for HostnameClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostnameClientVerifier")
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for HostnameClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_name(&cert, &self.expected)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
