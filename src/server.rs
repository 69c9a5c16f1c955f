//! Receiving server.
//!
//! Accepts TCP connections, runs the TLS handshake and one receive session
//! per connection, each in its own tokio task. A failing connection is logged
//! and closed; it never stops the accept loop.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ accept loop (until shutdown)                  │
//! │   │                                           │
//! │   ├─ task: handshake ─ receive session ─ close│
//! │   ├─ task: handshake ─ receive session ─ close│
//! │   └─ ...                                      │
//! └──────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::channel::{Role, SecureChannelFactory};
use crate::error::{Error, Result};
use crate::session::{SessionOptions, TransferReport, TransferSession};

/// Maximum concurrent connections
const MAX_CONNECTIONS: usize = 100;

/// Pause after a failed `accept` before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory received files are written to
    pub storage_dir: PathBuf,
    pub session: SessionOptions,
}

/// Secure file receiving server
pub struct Server {
    listener: TcpListener,
    storage_dir: PathBuf,
    session: SessionOptions,
    factory: Arc<SecureChannelFactory>,
    connection_semaphore: Arc<Semaphore>,
}

impl Server {
    /// Prepare storage and bind the listening socket.
    pub async fn bind(config: ServerConfig, factory: SecureChannelFactory) -> Result<Self> {
        if factory.role() != Role::Server {
            return Err(Error::configuration(
                "server needs a channel factory in the server role",
            ));
        }
        config.session.validate()?;

        setup_storage_directory(&config.storage_dir).await?;

        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("failed to bind to {}: {}", config.bind_addr, e),
            ))
        })?;

        info!(
            "🔒 Secure file transfer server listening on {}",
            listener.local_addr()?
        );
        info!("📁 Storage directory: {:?}", config.storage_dir);

        Ok(Self {
            listener,
            storage_dir: config.storage_dir,
            session: config.session,
            factory: Arc::new(factory),
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then wait for the
    /// sessions still in flight.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {}", e);
                    }
                }
                accepted = self.listener.accept() => {
                    let (tcp_stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            // Back off so descriptor exhaustion does not spin the loop.
                            sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };

                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Connection limit reached, rejecting {}", peer_addr);
                            continue;
                        }
                    };

                    let factory = self.factory.clone();
                    let storage_dir = self.storage_dir.clone();
                    let options = self.session.clone();

                    sessions.spawn(async move {
                        let _permit = permit;

                        match handle_connection(tcp_stream, peer_addr, &factory, &storage_dir, &options).await {
                            Ok(report) => info!(
                                peer = %peer_addr,
                                "Transfer of {} complete ({} bytes)",
                                report.name,
                                report.bytes
                            ),
                            Err(e) => warn!(
                                peer = %peer_addr,
                                kind = e.kind(),
                                "Connection failed: {}",
                                e
                            ),
                        }
                    });
                }
            }
        }

        if !sessions.is_empty() {
            info!("Waiting for {} in-flight session(s)", sessions.len());
        }
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("Session task failed: {}", e);
            }
        }

        Ok(())
    }
}

/// Create the storage directory, owner-only on Unix. An existing path must
/// be a directory.
async fn setup_storage_directory(storage_dir: &Path) -> Result<()> {
    match fs::metadata(storage_dir).await {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(Error::configuration(format!(
                "storage path {:?} exists and is not a directory",
                storage_dir
            )))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }

    fs::create_dir_all(storage_dir).await?;
    info!("Created storage directory: {:?}", storage_dir);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(storage_dir).await?.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(storage_dir, permissions).await?;
    }

    Ok(())
}

/// Handshake, receive one file, close. The channel is closed on every path
/// once the handshake succeeded.
async fn handle_connection(
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    factory: &SecureChannelFactory,
    storage_dir: &Path,
    options: &SessionOptions,
) -> Result<TransferReport> {
    info!("📥 New connection from {}", peer_addr);
    if let Err(e) = tcp_stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    let mut channel = factory.establish(tcp_stream).await?;
    info!(
        "🔐 TLS established with {} ({:?}, {:?})",
        peer_addr,
        channel.protocol_version(),
        channel.cipher_suite()
    );

    let result = TransferSession::receive(&mut channel, storage_dir, options).await;

    if let Err(e) = channel.close().await {
        debug!("Closing channel with {} failed: {}", peer_addr, e);
    }

    result
}
