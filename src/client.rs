//! Sending client.
//!
//! Opens one TCP connection, performs the TLS handshake with the configured
//! verification mode, sends one file and closes. There is no connection reuse
//! and no retry; a caller that wants another attempt runs the client again.

use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::channel::{Role, SecureChannelFactory};
use crate::error::{Error, Result};
use crate::session::{SessionOptions, TransferReport, TransferSession};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or IP address
    pub host: String,
    pub port: u16,
    pub session: SessionOptions,
}

/// Secure file transfer client
pub struct Client {
    config: ClientConfig,
    factory: SecureChannelFactory,
}

impl Client {
    pub fn new(config: ClientConfig, factory: SecureChannelFactory) -> Result<Self> {
        if factory.role() != Role::Client {
            return Err(Error::configuration(
                "client needs a channel factory in the client role",
            ));
        }
        config.session.validate()?;
        Ok(Self { config, factory })
    }

    /// Send `path` to the server. Succeeds only once the server accepted
    /// the digest.
    pub async fn send(&self, path: &Path, progress: &ProgressBar) -> Result<TransferReport> {
        let host = self.config.host.as_str();
        let port = self.config.port;
        info!("🔗 Connecting to {}:{}...", host, port);

        let tcp_stream = timeout(
            self.factory.config().handshake_timeout(),
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| Error::Timeout("connect"))??;
        tcp_stream.set_nodelay(true)?;
        debug!("TCP connection established");

        let mut channel = self.factory.establish(tcp_stream).await?;

        info!("🔐 TLS connection established");
        if let Some(protocol) = channel.protocol_version() {
            info!("  Protocol: {:?}", protocol);
        }
        if let Some(cipher) = channel.cipher_suite() {
            info!("  Cipher: {:?}", cipher);
        }

        let result = TransferSession::send(&mut channel, path, &self.config.session, progress).await;

        if let Err(e) = channel.close().await {
            debug!("Closing channel failed: {}", e);
        }

        let report = result?;
        info!(
            "✅ Transfer verified: {} ({}, sha256: {})",
            report.name,
            format_size(report.bytes),
            report.digest
        );
        Ok(report)
    }
}

/// Create progress bar for transfers
pub fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Format file size for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}
