//! sxfer - command line entry point.
//!
//! ```text
//! sxfer server <PORT> --cert <PEM> --key <PEM> [options]
//! sxfer client <ADDRESS> <PORT> <FILE> [options]
//! ```
//!
//! Exit status is 0 only for a clean server shutdown or a transfer the server
//! verified. Failures exit with a code per error kind (see
//! `securexfer::Error::exit_code`).

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use securexfer::client::create_progress_bar;
use securexfer::protocol::DEFAULT_CHUNK_SIZE;
use securexfer::session::DEFAULT_MAX_FILE_SIZE;
use securexfer::{
    CertificateStore, ChannelConfig, Client, ClientConfig, Error, SecureChannelFactory, Server,
    ServerConfig, SessionOptions, TlsVersion, VerifyMode,
};

/// Point-to-point secure file transfer over TLS
#[derive(Parser)]
#[command(name = "sxfer")]
#[command(version)]
#[command(about = "Point-to-point secure file transfer over TLS", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// TLS policy options shared by both roles
#[derive(Args)]
struct TlsArgs {
    /// Lowest TLS version to negotiate (1.2 or 1.3)
    #[arg(long, default_value = "1.2")]
    min_tls: TlsVersion,

    /// Allowed cipher suite, repeatable (e.g. TLS13_AES_256_GCM_SHA384)
    #[arg(long = "cipher")]
    ciphers: Vec<String>,

    /// CA certificate(s) used to validate the peer (PEM)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Handshake timeout in seconds
    #[arg(long, default_value = "30")]
    handshake_timeout: u64,

    /// Per-frame read/write timeout in seconds
    #[arg(long, default_value = "30")]
    io_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive files until interrupted
    Server {
        /// Port to listen on
        #[arg(value_parser = clap::value_parser!(u16).range(1024..))]
        port: u16,

        /// Path to the server certificate chain (PEM)
        #[arg(long)]
        cert: PathBuf,

        /// Path to the server private key (PEM)
        #[arg(long)]
        key: PathBuf,

        /// Address to bind to
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Storage directory for received files
        #[arg(short, long, default_value = "./storage")]
        storage: PathBuf,

        /// Maximum accepted file size in MB
        #[arg(long, default_value_t = DEFAULT_MAX_FILE_SIZE / (1024 * 1024))]
        max_size: u64,

        /// Client certificate verification: none, check-chain, check-chain+hostname
        #[arg(long, default_value = "none")]
        verify: VerifyMode,

        /// Name the client certificate must carry (check-chain+hostname)
        #[arg(long)]
        peer_hostname: Option<String>,

        #[command(flatten)]
        tls: TlsArgs,
    },

    /// Send one file to a server
    Client {
        /// Server host name or IP address
        address: String,

        /// Server port
        #[arg(value_parser = clap::value_parser!(u16).range(1024..))]
        port: u16,

        /// Local file to send
        file: PathBuf,

        /// Server certificate verification: none, check-chain, check-chain+hostname
        #[arg(long, default_value = "check-chain+hostname")]
        verify: VerifyMode,

        /// Name the server certificate must carry (defaults to ADDRESS)
        #[arg(long)]
        hostname: Option<String>,

        /// Client certificate for mutual authentication (PEM)
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// Client private key for mutual authentication (PEM)
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,

        /// Data frame size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        #[command(flatten)]
        tls: TlsArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Pin the process-wide provider to the one every config is built with.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {}", e);
    }

    let result = match cli.command {
        Commands::Server {
            port,
            cert,
            key,
            bind,
            storage,
            max_size,
            verify,
            peer_hostname,
            tls,
        } => {
            let config = ServerConfig {
                bind_addr: SocketAddr::new(bind, port),
                storage_dir: storage,
                session: SessionOptions {
                    max_file_size: max_size.saturating_mul(1024 * 1024),
                    ..SessionOptions::default()
                },
            };
            run_server(config, cert, key, verify, peer_hostname, tls).await
        }
        Commands::Client {
            address,
            port,
            file,
            verify,
            hostname,
            cert,
            key,
            chunk_size,
            tls,
        } => {
            let hostname = hostname.unwrap_or_else(|| address.clone());
            let config = ClientConfig {
                host: address,
                port,
                session: SessionOptions {
                    chunk_size,
                    ..SessionOptions::default()
                },
            };
            let identity = cert.zip(key);
            run_client(config, &file, verify, hostname, identity, tls).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            let code = err
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn channel_config(
    verify: VerifyMode,
    hostname: Option<String>,
    tls: &TlsArgs,
) -> Result<ChannelConfig> {
    let mut builder = ChannelConfig::builder(verify)
        .min_version(tls.min_tls)
        .handshake_timeout(Duration::from_secs(tls.handshake_timeout))
        .io_timeout(Duration::from_secs(tls.io_timeout));

    if !tls.ciphers.is_empty() {
        builder = builder.cipher_suites(tls.ciphers.iter().cloned());
    }
    if let Some(hostname) = hostname {
        builder = builder.expected_hostname(hostname);
    }
    if let Some(ca) = &tls.ca {
        let roots = CertificateStore::load_trust_roots(ca)
            .with_context(|| format!("loading trust roots from {:?}", ca))?;
        builder = builder.trust_roots(roots);
    }

    Ok(builder.build()?)
}

async fn run_server(
    config: ServerConfig,
    cert: PathBuf,
    key: PathBuf,
    verify: VerifyMode,
    peer_hostname: Option<String>,
    tls: TlsArgs,
) -> Result<()> {
    info!("🚀 Starting secure file transfer server...");

    let material = CertificateStore::load(&cert, &key).context("loading server certificate")?;
    let channel = Arc::new(channel_config(verify, peer_hostname, &tls)?);
    let factory = SecureChannelFactory::server(channel, &material)?;

    let server = Server::bind(config, factory).await?;
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn run_client(
    config: ClientConfig,
    file: &Path,
    verify: VerifyMode,
    hostname: String,
    identity: Option<(PathBuf, PathBuf)>,
    tls: TlsArgs,
) -> Result<()> {
    let material = match identity {
        Some((cert, key)) => {
            Some(CertificateStore::load(&cert, &key).context("loading client certificate")?)
        }
        None => None,
    };

    let channel = Arc::new(channel_config(verify, Some(hostname), &tls)?);
    let factory = SecureChannelFactory::client(channel, material.as_ref())?;
    let client = Client::new(config, factory)?;

    let progress = create_progress_bar(0);
    let result = client.send(file, &progress).await;
    if result.is_err() {
        progress.abandon();
    }
    result?;

    Ok(())
}
