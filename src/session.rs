//! Transfer session: one file moved over one secured channel.
//!
//! The sender writes `Metadata`, then `Data` frames, then the `Trailer`
//! (SHA-256 of every data byte), and waits for the receiver's `Receipt`.
//! The receiver stops reading data exactly at the declared size, so a
//! connection that ends early is an aborted transfer and never a complete one.
//!
//! Files on the receiving side move through three names:
//!
//! - `<name>.part` while bytes arrive, and kept there if the transfer aborts
//! - `<name>.corrupt` if the trailer digest does not match
//! - `<name>` once the digest matched

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use crate::channel::SecuredChannel;
use crate::error::{Error, Result};
use crate::protocol::{
    validate_filename, Receipt, TransferDigest, TransferMetadata, DEFAULT_CHUNK_SIZE, DIGEST_LEN,
    MAX_FRAME_LEN, MAX_METADATA_LEN,
};

/// Default limit on declared file size (1 GB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

const PART_SUFFIX: &str = ".part";
const CORRUPT_SUFFIX: &str = ".corrupt";

/// Knobs shared by both roles.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Payload size of every data frame except possibly the last.
    pub chunk_size: usize,
    /// Largest declared size a receiver accepts.
    pub max_file_size: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl SessionOptions {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_FRAME_LEN {
            return Err(Error::configuration(format!(
                "chunk size must be between 1 and {} bytes, got {}",
                MAX_FRAME_LEN, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Outcome of a successful session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub name: String,
    pub bytes: u64,
    /// Hex-encoded SHA-256 of the content.
    pub digest: String,
    /// Where the receiver stored the file; `None` on the sending side.
    pub destination: Option<PathBuf>,
}

/// Per-connection progress: declared size, bytes moved, running digest.
pub struct TransferSession {
    metadata: TransferMetadata,
    digest: TransferDigest,
}

impl TransferSession {
    fn new(metadata: TransferMetadata) -> Self {
        Self {
            metadata,
            digest: TransferDigest::new(),
        }
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    pub fn bytes_moved(&self) -> u64 {
        self.digest.bytes_processed()
    }

    fn remaining(&self) -> u64 {
        self.metadata.size - self.bytes_moved()
    }

    fn record(&mut self, chunk: &[u8]) {
        debug_assert!(chunk.len() as u64 <= self.remaining());
        self.digest.update(chunk);
    }

    /// Turn a lost connection into an aborted transfer.
    fn aborted(&self, err: Error) -> Error {
        match err {
            Error::ConnectionClosed { .. } | Error::Io(_) => Error::TransferAborted {
                received: self.bytes_moved(),
                declared: self.metadata.size,
                reason: err.to_string(),
            },
            other => other,
        }
    }

    /// Send `path` over `channel` and wait for the receiver's verdict.
    pub async fn send<S>(
        channel: &mut SecuredChannel<S>,
        path: &Path,
        options: &SessionOptions,
        progress: &ProgressBar,
    ) -> Result<TransferReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let file_meta = fs::metadata(path).await?;
        if file_meta.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot send a directory: {:?}", path),
            )));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::UnsafeFilename {
                name: path.display().to_string(),
                reason: "path has no UTF-8 file name",
            })?
            .to_string();

        let reader = BufReader::new(File::open(path).await?);
        Self::send_stream(channel, name, file_meta.len(), reader, options, progress).await
    }

    /// Send exactly `size` bytes from `reader` under `name`.
    ///
    /// A reader that ends early or still has bytes after `size` fails with
    /// `SourceSizeMismatch` before the trailer is written.
    pub async fn send_stream<S, R>(
        channel: &mut SecuredChannel<S>,
        name: String,
        size: u64,
        mut reader: R,
        options: &SessionOptions,
        progress: &ProgressBar,
    ) -> Result<TransferReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        options.validate()?;
        validate_filename(&name)?;

        let mut session = TransferSession::new(TransferMetadata::new(name, size));
        channel.send_frame(&session.metadata.encode()?).await?;
        info!("📤 Sending {} ({} bytes)", session.metadata.name, size);
        progress.set_length(size);

        let digest = match session
            .send_body(channel, &mut reader, options, progress)
            .await
        {
            Ok(digest) => digest,
            Err(e @ Error::ConnectionClosed { .. }) => {
                return Err(session.refusal_or(channel, e).await)
            }
            Err(e) => return Err(e),
        };

        debug!("Trailer sent for {}, awaiting receipt", session.metadata.name);
        let receipt = Receipt::decode(&channel.recv_frame(1).await?)?;
        let digest_hex = hex::encode(digest);
        session.verdict(receipt, Some(&digest_hex))?;

        progress.finish_with_message("Upload complete");
        Ok(TransferReport {
            name: session.metadata.name,
            bytes: size,
            digest: digest_hex,
            destination: None,
        })
    }

    /// Write data frames and the trailer, returning the digest sent.
    async fn send_body<S, R>(
        &mut self,
        channel: &mut SecuredChannel<S>,
        reader: &mut R,
        options: &SessionOptions,
        progress: &ProgressBar,
    ) -> Result<[u8; DIGEST_LEN]>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let size = self.metadata.size;
        let mut buffer = vec![0u8; options.chunk_size];

        while self.remaining() > 0 {
            let want = self.remaining().min(options.chunk_size as u64) as usize;
            let got = read_full(reader, &mut buffer[..want]).await?;
            if got < want {
                return Err(Error::SourceSizeMismatch {
                    declared: size,
                    actual: self.bytes_moved() + got as u64,
                });
            }

            self.record(&buffer[..want]);
            channel.send_frame(&buffer[..want]).await?;
            progress.set_position(self.bytes_moved());
        }

        let mut probe = [0u8; 1];
        if reader.read(&mut probe).await? != 0 {
            let extra = tokio::io::copy(reader, &mut tokio::io::sink()).await?;
            return Err(Error::SourceSizeMismatch {
                declared: size,
                actual: size + 1 + extra,
            });
        }

        let digest = std::mem::take(&mut self.digest).finalize();
        channel.send_frame(&digest).await?;
        channel.flush().await?;
        Ok(digest)
    }

    /// Map a receipt onto the sender's outcome.
    fn verdict(&self, receipt: Receipt, digest_hex: Option<&str>) -> Result<()> {
        match receipt {
            Receipt::Accepted => Ok(()),
            Receipt::IntegrityFailed => Err(Error::Integrity {
                expected: digest_hex.unwrap_or("unknown").to_string(),
                actual: "a different digest on the receiver".to_string(),
            }),
            Receipt::Rejected => Err(Error::Rejected(format!(
                "{} ({} bytes)",
                self.metadata.name, self.metadata.size
            ))),
        }
    }

    /// A receiver that refuses a transfer answers and hangs up while the
    /// sender may still be writing. Prefer its receipt or TLS alert over the
    /// failed write.
    async fn refusal_or<S>(&self, channel: &mut SecuredChannel<S>, write_err: Error) -> Error
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match channel.recv_frame(1).await {
            Ok(payload) => match Receipt::decode(&payload) {
                Ok(receipt) => match self.verdict(receipt, None) {
                    Err(e) => e,
                    Ok(()) => write_err,
                },
                Err(_) => write_err,
            },
            Err(e @ Error::Handshake { .. }) => e,
            Err(e) => {
                debug!("No receipt after failed write: {}", e);
                write_err
            }
        }
    }

    /// Receive one file into `storage_dir`.
    pub async fn receive<S>(
        channel: &mut SecuredChannel<S>,
        storage_dir: &Path,
        options: &SessionOptions,
    ) -> Result<TransferReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let metadata = match channel
            .recv_frame(MAX_METADATA_LEN)
            .await
            .and_then(|payload| TransferMetadata::decode(&payload))
        {
            Ok(metadata) => metadata,
            Err(e @ Error::MalformedFrame(_)) => {
                send_receipt(channel, Receipt::Rejected).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let relative = match validate_filename(&metadata.name) {
            Ok(relative) => relative,
            Err(e) => {
                send_receipt(channel, Receipt::Rejected).await;
                return Err(e);
            }
        };

        if metadata.size > options.max_file_size {
            send_receipt(channel, Receipt::Rejected).await;
            return Err(Error::FileTooLarge {
                declared: metadata.size,
                limit: options.max_file_size,
            });
        }

        let final_path = storage_dir.join(&relative);
        let part_path = with_suffix(&final_path, PART_SUFFIX);

        let file = match open_exclusive(&part_path).await {
            Ok(file) => file,
            Err(e) => {
                send_receipt(channel, Receipt::Rejected).await;
                return Err(Error::Io(e));
            }
        };

        info!(
            "📥 Receiving {} ({} bytes) into {:?}",
            metadata.name, metadata.size, part_path
        );

        let mut session = TransferSession::new(metadata);
        let mut writer = BufWriter::new(file);

        let trailer = match session.receive_body(channel, &mut writer).await {
            Ok(trailer) => trailer,
            Err(e) => {
                if let Err(flush_err) = writer.flush().await {
                    warn!("Failed to flush {:?}: {}", part_path, flush_err);
                }
                warn!(
                    "Incomplete transfer kept at {:?} ({} of {} bytes)",
                    part_path,
                    session.bytes_moved(),
                    session.metadata.size
                );
                return Err(e);
            }
        };

        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        drop(file);

        let TransferSession { metadata, digest } = session;
        let computed = digest.finalize();

        if computed[..] != trailer[..] {
            let corrupt_path = with_suffix(&final_path, CORRUPT_SUFFIX);
            if let Err(e) = fs::rename(&part_path, &corrupt_path).await {
                warn!("Failed to mark {:?} as corrupt: {}", part_path, e);
            }
            send_receipt(channel, Receipt::IntegrityFailed).await;
            return Err(Error::Integrity {
                expected: hex::encode(&trailer),
                actual: hex::encode(computed),
            });
        }

        fs::rename(&part_path, &final_path).await?;
        send_receipt(channel, Receipt::Accepted).await;

        let digest_hex = hex::encode(computed);
        info!(
            "✅ File received: {} ({} bytes, sha256: {})",
            metadata.name, metadata.size, digest_hex
        );

        Ok(TransferReport {
            name: metadata.name,
            bytes: metadata.size,
            digest: digest_hex,
            destination: Some(final_path),
        })
    }

    /// Read data frames up to the declared size, then the trailer.
    async fn receive_body<S, W>(
        &mut self,
        channel: &mut SecuredChannel<S>,
        writer: &mut W,
    ) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        W: AsyncWrite + Unpin,
    {
        while self.remaining() > 0 {
            let chunk = channel
                .recv_frame(MAX_FRAME_LEN)
                .await
                .map_err(|e| self.aborted(e))?;

            if chunk.is_empty() {
                return Err(Error::MalformedFrame("empty data frame".to_string()));
            }
            if chunk.len() as u64 > self.remaining() {
                return Err(Error::TransferAborted {
                    received: self.bytes_moved(),
                    declared: self.metadata.size,
                    reason: format!(
                        "data frame of {} bytes overruns the declared size",
                        chunk.len()
                    ),
                });
            }

            self.record(&chunk);
            writer.write_all(&chunk).await?;
        }

        let trailer = channel
            .recv_frame(DIGEST_LEN)
            .await
            .map_err(|e| self.aborted(e))?;
        if trailer.len() != DIGEST_LEN {
            return Err(Error::MalformedFrame(format!(
                "trailer of {} bytes, expected {}",
                trailer.len(),
                DIGEST_LEN
            )));
        }
        Ok(trailer)
    }
}

/// Best-effort verdict for the sender; the local outcome does not depend on it.
async fn send_receipt<S>(channel: &mut SecuredChannel<S>, receipt: Receipt)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let sent = async {
        channel.send_frame(&[receipt.to_byte()]).await?;
        channel.flush().await
    };
    if let Err(e) = sent.await {
        warn!("Failed to send {:?} receipt: {}", receipt, e);
    }
}

async fn open_exclusive(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
