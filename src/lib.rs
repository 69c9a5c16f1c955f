//! Secure point-to-point file transfer
//!
//! One server receives, one client sends, one file per TLS connection.
//!
//! ## Features
//! - TLS 1.2/1.3 with a configurable minimum version and cipher suite list
//! - Explicit peer verification modes: `none`, `check-chain`,
//!   `check-chain+hostname` (optionally mutual)
//! - Length-prefixed framing with completion by declared size
//! - End-to-end SHA-256 verification with a receiver verdict
//!
//! ## Usage
//!
//! ```bash
//! # Receive into ./storage
//! sxfer server 8443 --cert ./certs/server.pem --key ./certs/server.key
//!
//! # Send a file, validating the server against a CA
//! sxfer client files.example.org 8443 report.pdf --ca ./certs/ca.pem
//! ```

pub mod channel;
pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tls;

pub use channel::{Role, SecureChannelFactory, SecuredChannel};
pub use client::{Client, ClientConfig};
pub use error::{Error, HandshakeFailure, Result};
pub use protocol::TransferMetadata;
pub use server::{Server, ServerConfig};
pub use session::{SessionOptions, TransferReport, TransferSession};
pub use tls::{CertificateMaterial, CertificateStore, ChannelConfig, TlsVersion, VerifyMode};
