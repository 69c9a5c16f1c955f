//! Error taxonomy for the transfer tool.
//!
//! Every failure a session can hit maps onto one [`Error`] variant. The
//! variant decides the log `kind` and the process exit code, so callers never
//! need to inspect messages.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a TLS handshake (or a late TLS alert) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// Peer offered or selected a protocol version below our minimum.
    ProtocolVersionRejected,
    /// No cipher suite in common with the configured list.
    CipherMismatch,
    /// Peer certificate failed chain or hostname validation, or was missing.
    CertificateValidationFailed,
    /// Handshake did not complete within the configured timeout.
    Timeout,
    /// Any other negotiation failure.
    Negotiation,
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProtocolVersionRejected => "protocol-version-rejected",
            Self::CipherMismatch => "cipher-mismatch",
            Self::CertificateValidationFailed => "certificate-validation-failed",
            Self::Timeout => "timeout",
            Self::Negotiation => "negotiation-failed",
        };
        f.write_str(s)
    }
}

/// Library error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to load certificate material from {path:?}: {reason}")]
    CertificateLoad { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("TLS handshake failed ({kind}): {detail}")]
    Handshake {
        kind: HandshakeFailure,
        detail: String,
    },

    #[error("unsafe filename {name:?}: {reason}")]
    UnsafeFilename { name: String, reason: &'static str },

    #[error("declared size {declared} exceeds limit of {limit} bytes")]
    FileTooLarge { declared: u64, limit: u64 },

    #[error("source file size changed: declared {declared} bytes, read {actual}")]
    SourceSizeMismatch { declared: u64, actual: u64 },

    #[error("transfer aborted after {received} of {declared} bytes: {reason}")]
    TransferAborted {
        received: u64,
        declared: u64,
        reason: String,
    },

    #[error("digest mismatch: expected {expected}, computed {actual}")]
    Integrity { expected: String, actual: String },

    #[error("receiver rejected the transfer: {0}")]
    Rejected(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("connection closed after {received} of {expected} bytes")]
    ConnectionClosed { expected: usize, received: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Stable, machine-friendly name used in log records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::CertificateLoad { .. } | Error::Configuration(_) => "configuration",
            Error::Handshake { .. } => "handshake",
            Error::UnsafeFilename { .. } => "unsafe-filename",
            Error::FileTooLarge { .. } => "file-too-large",
            Error::SourceSizeMismatch { .. } => "source-size-mismatch",
            Error::TransferAborted { .. } => "transfer-aborted",
            Error::Integrity { .. } => "integrity",
            Error::Rejected(_) => "rejected",
            Error::Timeout(_) => "timeout",
            Error::ConnectionClosed { .. } => "connection-closed",
            Error::MalformedFrame(_) => "malformed-frame",
            Error::Io(_) => "io",
        }
    }

    /// Process exit code the CLI reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::CertificateLoad { .. } | Error::Configuration(_) => 2,
            Error::Handshake { .. } => 3,
            Error::UnsafeFilename { .. } | Error::FileTooLarge { .. } | Error::Rejected(_) => 4,
            Error::SourceSizeMismatch { .. } => 5,
            Error::TransferAborted { .. } | Error::ConnectionClosed { .. } => 6,
            Error::Integrity { .. } => 7,
            Error::Timeout(_) => 8,
            Error::MalformedFrame(_) | Error::Io(_) => 1,
        }
    }

    pub(crate) fn handshake(kind: HandshakeFailure, detail: impl Into<String>) -> Self {
        Error::Handshake {
            kind,
            detail: detail.into(),
        }
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}
