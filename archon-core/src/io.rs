//! Atomic file writes and path-safe key encoding.
//!
//! Every record in the state root is a single file replaced with
//! write-temp-then-rename. The temp file is uniquely named and lives in the
//! target directory, so two processes writing the same record never share a
//! temp path and the rename stays on one filesystem.

use std::io::{ErrorKind, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{io_err, CoreError};

/// Atomically replace `path` with `data`, creating parent directories.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), CoreError> {
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("path has no parent directory")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_err(dir, e))?;
    tmp.write_all(data).map_err(|e| io_err(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(())
}

/// Read `path`, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Remove `path`, treating "not found" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool, CoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Longest escaped segment written as-is. Longer keys are hashed so the
/// `.json` file name stays under the usual 255-byte `NAME_MAX`.
pub const MAX_ESCAPED_LEN: usize = 200;

/// Prefix of a hashed segment. `~` never appears in an escaped key.
pub const HASHED_SEGMENT_PREFIX: char = '~';

/// Encode an arbitrary key as a single path segment.
///
/// `[A-Za-z0-9-]` and non-leading `.` pass through; every other byte becomes
/// `_XX` (uppercase hex). The empty key encodes as `_`. An encoding longer
/// than [`MAX_ESCAPED_LEN`] is replaced by `~` and the sha256 of the key; such
/// segments cannot be decoded, so records must carry their own key.
pub fn escape_key(key: &str) -> String {
    if key.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(key.len());
    for (i, byte) in key.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{byte:02X}"));
        }
    }
    if out.len() > MAX_ESCAPED_LEN {
        return format!("{HASHED_SEGMENT_PREFIX}{}", hex::encode(Sha256::digest(key.as_bytes())));
    }
    out
}

/// Whether `segment` was produced by [`escape_key`]: either decodable or a
/// hashed long key.
pub fn is_key_segment(segment: &str) -> bool {
    match segment.strip_prefix(HASHED_SEGMENT_PREFIX) {
        Some(digest) => digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()),
        None => unescape_key(segment).is_some(),
    }
}

/// Inverse of [`escape_key`]. Returns `None` for malformed input and for
/// hashed segments.
pub fn unescape_key(segment: &str) -> Option<String> {
    if segment == "_" {
        return Some(String::new());
    }
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = segment.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
