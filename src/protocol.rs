//! Wire format of a transfer session.
//!
//! Everything on the wire is a frame: a 4-byte big-endian length followed by
//! exactly that many payload bytes. A frame carries no type tag; its meaning
//! comes from its position in the session.
//!
//! ```text
//! Sender                                    Receiver
//!   |                                          |
//!   |== TLS handshake ========================|
//!   |                                          |
//!   |-- Metadata(nameLen, name, size) -------->|
//!   |-- Data(chunk 0) ------------------------>|
//!   |-- ...                                    |
//!   |-- Data(chunk n) ------------------------>|
//!   |-- Trailer(sha256 of all chunk bytes) --->|
//!   |<---------------------------- Receipt ----|
//! ```
//!
//! The receiver decides completion from the declared size, never from the
//! transport closing: a stream that ends early is always an aborted transfer.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Largest frame payload either side will accept (16 MB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Default data frame size (64 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Longest accepted file name, in UTF-8 bytes.
pub const MAX_NAME_LEN: usize = 4096;

/// Length of the trailer payload (SHA-256).
pub const DIGEST_LEN: usize = 32;

pub const FRAME_HEADER_LEN: usize = 4;

/// Largest possible metadata payload: name length, name, size.
pub const MAX_METADATA_LEN: usize = 4 + MAX_NAME_LEN + 8;

/// Encode the length prefix of a frame.
pub fn frame_header(len: usize) -> Result<[u8; FRAME_HEADER_LEN]> {
    if len > MAX_FRAME_LEN {
        return Err(Error::MalformedFrame(format!(
            "frame of {} bytes exceeds maximum of {}",
            len, MAX_FRAME_LEN
        )));
    }
    Ok((len as u32).to_be_bytes())
}

/// Decode a length prefix and check it against `max_len`.
pub fn parse_frame_header(header: [u8; FRAME_HEADER_LEN], max_len: usize) -> Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(Error::MalformedFrame(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_len
        )));
    }
    Ok(len)
}

/// First frame of every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub name: String,
    pub size: u64,
}

impl TransferMetadata {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// `u32 nameLength || name || u64 size`, all big-endian.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.name.as_bytes();
        if name.len() > MAX_NAME_LEN {
            return Err(Error::UnsafeFilename {
                name: self.name.clone(),
                reason: "name longer than 4096 bytes",
            });
        }

        let mut payload = Vec::with_capacity(4 + name.len() + 8);
        payload.extend_from_slice(&(name.len() as u32).to_be_bytes());
        payload.extend_from_slice(name);
        payload.extend_from_slice(&self.size.to_be_bytes());
        Ok(payload)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 + 8 {
            return Err(Error::MalformedFrame(format!(
                "metadata frame too short: {} bytes",
                payload.len()
            )));
        }

        let (len_bytes, rest) = payload.split_at(4);
        let name_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;

        if name_len > MAX_NAME_LEN {
            return Err(Error::MalformedFrame(format!(
                "declared name length {} exceeds {}",
                name_len, MAX_NAME_LEN
            )));
        }
        if rest.len() != name_len + 8 {
            return Err(Error::MalformedFrame(format!(
                "metadata frame length {} does not match name length {}",
                payload.len(),
                name_len
            )));
        }

        let (name_bytes, size_bytes) = rest.split_at(name_len);
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| Error::MalformedFrame("file name is not valid UTF-8".to_string()))?
            .to_string();

        let mut size = [0u8; 8];
        size.copy_from_slice(size_bytes);

        Ok(Self {
            name,
            size: u64::from_be_bytes(size),
        })
    }
}

/// Receiver's verdict, sent as a one-byte frame after the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    Accepted,
    IntegrityFailed,
    Rejected,
}

impl Receipt {
    pub fn to_byte(self) -> u8 {
        match self {
            Receipt::Accepted => 0,
            Receipt::IntegrityFailed => 1,
            Receipt::Rejected => 2,
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload {
            [0] => Ok(Receipt::Accepted),
            [1] => Ok(Receipt::IntegrityFailed),
            [2] => Ok(Receipt::Rejected),
            other => Err(Error::MalformedFrame(format!(
                "unknown receipt payload {:?}",
                other
            ))),
        }
    }
}

/// Incremental SHA-256 over the data frame payloads.
pub struct TransferDigest {
    hasher: Sha256,
    bytes_processed: u64,
}

impl TransferDigest {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    pub fn finalize(self) -> [u8; DIGEST_LEN] {
        self.hasher.finalize().into()
    }
}

impl Default for TransferDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a declared file name and return it as a relative path.
///
/// # Security
/// The name comes from the peer. Anything that could place the file outside
/// the storage directory is rejected before a file is opened.
pub fn validate_filename(name: &str) -> Result<PathBuf> {
    let unsafe_name = |reason| Error::UnsafeFilename {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(unsafe_name("empty name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(unsafe_name("name longer than 4096 bytes"));
    }
    if name.contains('\0') {
        return Err(unsafe_name("name contains NUL"));
    }

    // Treat Windows separators as separators on every platform.
    let normalized = name.replace('\\', "/");

    if normalized.starts_with('/') {
        return Err(unsafe_name("absolute path"));
    }
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(unsafe_name("drive-qualified path"));
    }

    let mut relative = PathBuf::new();
    for segment in normalized.split('/') {
        match segment {
            "" => return Err(unsafe_name("empty path segment")),
            "." => continue,
            ".." => return Err(unsafe_name("parent directory traversal")),
            _ => {}
        }

        for component in Path::new(segment).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => return Err(unsafe_name("parent directory traversal")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(unsafe_name("absolute path"))
                }
            }
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(unsafe_name("name has no file component"));
    }

    Ok(relative)
}
