//! Versioned binary archives for the persistent caches.
//!
//! Every on-disk cache (dependency cache partitions, action history, target
//! makefiles) is a bincode payload behind a small header: magic bytes, a
//! format version, and a sha256 checksum of the payload. Reads are fail-safe;
//! anything that does not validate is a cache miss, never an error.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use girder_types::Result;

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveHeader {
    magic: [u8; 4],
    version: u32,
    checksum: String,
}

/// Hex-encoded sha256 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex-encoded sha256 of a file's contents.
pub fn hash_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hash_bytes(&bytes))
}

/// Serialize `value` and write it to `path` behind a validated header.
///
/// Layout: 4-byte little-endian header length, bincode header, bincode payload.
pub fn write_archive<T: Serialize>(path: &Path, magic: [u8; 4], version: u32, value: &T) -> Result<()> {
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| girder_types::GirderError::Other(format!("archive encode: {e}")))?;

    let header = ArchiveHeader {
        magic,
        version,
        checksum: hash_bytes(&payload),
    };
    let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
        .map_err(|e| girder_types::GirderError::Other(format!("archive encode: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    output.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    output.extend_from_slice(&header_bytes);
    output.extend_from_slice(&payload);
    std::fs::write(path, &output)?;
    Ok(())
}

/// Read an archive written by [`write_archive`].
///
/// Returns `None` when the file is missing, truncated, carries the wrong
/// magic or version, or fails its checksum. The caller treats `None` as an
/// empty cache.
pub fn read_archive<T: for<'de> Deserialize<'de>>(
    path: &Path,
    magic: [u8; 4],
    version: u32,
) -> Option<T> {
    let raw = std::fs::read(path).ok()?;
    if raw.len() < 4 {
        return None;
    }

    let header_len = u32::from_le_bytes(raw[..4].try_into().ok()?) as usize;
    if raw.len() < 4 + header_len {
        return None;
    }

    let header: ArchiveHeader =
        bincode::serde::decode_from_slice(&raw[4..4 + header_len], bincode::config::standard())
            .ok()?
            .0;
    if header.magic != magic || header.version != version {
        tracing::info!(
            path = %path.display(),
            "discarding cache archive with mismatched magic or version"
        );
        return None;
    }

    let payload = &raw[4 + header_len..];
    if hash_bytes(payload) != header.checksum {
        tracing::info!(path = %path.display(), "discarding cache archive with bad checksum");
        return None;
    }

    bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .ok()
        .map(|(v, _)| v)
}
