//! Feature documents: discovery, fingerprints and modification times.
//!
//! A feature's documents are the `*.md` files at the top of the feature
//! directory plus those under `contracts/`. Filenames are relative to the
//! feature directory and always `/`-separated.

use std::io::{ErrorKind, Read};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use archon_core::{format_timestamp, SyncMetadata};

use crate::error::{io_err, SyncError};

const SUBDIRS: &[&str] = &["contracts"];

/// A markdown document found in a feature directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDocument {
    pub filename: String,
    pub path: PathBuf,
    /// mtime in the store's timestamp format.
    pub modified_at: String,
}

/// Every document of a feature, sorted by filename.
pub fn list_documents(feature_dir: &Path) -> Result<Vec<LocalDocument>, SyncError> {
    let mut docs = Vec::new();
    collect(feature_dir, "", &mut docs)?;
    for sub in SUBDIRS {
        collect(&feature_dir.join(sub), sub, &mut docs)?;
    }
    docs.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(docs)
}

fn collect(dir: &Path, prefix: &str, out: &mut Vec<LocalDocument>) -> Result<(), SyncError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_err(dir, err)),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let filename = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        out.push(LocalDocument {
            filename,
            modified_at: modified_at(&path)?,
            path,
        });
    }
    Ok(())
}

/// mtime of `path` formatted as a store timestamp.
pub fn modified_at(path: &Path) -> Result<String, SyncError> {
    let meta = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
    let mtime: SystemTime = meta.modified().map_err(|e| io_err(path, e))?;
    Ok(format_timestamp(DateTime::<Utc>::from(mtime)))
}

/// Whether the local copy differs from what was last exchanged with the
/// remote.
///
/// A recorded content hash decides. Records written without one fall back
/// to comparing the second-precision mtime against the sync time.
pub fn changed_since_sync(
    content_sha256: &str,
    modified_at: &str,
    synced: Option<&SyncMetadata>,
) -> bool {
    let Some(synced) = synced.filter(|s| !s.last_synced_at.is_empty()) else {
        return true;
    };
    if synced.content_sha256.is_empty() {
        modified_at > synced.last_synced_at.as_str()
    } else {
        content_sha256 != synced.content_sha256
    }
}

/// sha256 of in-memory content, hex-encoded like [`hash_file`].
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Streaming sha256 of a file, hex-encoded.
pub fn hash_file(path: &Path) -> Result<String, SyncError> {
    let mut file = std::fs::File::open(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Resolve a document filename inside `feature_dir`. `None` for absolute
/// paths or paths that climb out of the directory.
pub fn resolve_document(feature_dir: &Path, filename: &str) -> Option<PathBuf> {
    let relative = Path::new(filename);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    (plain && !filename.is_empty()).then(|| feature_dir.join(relative))
}
