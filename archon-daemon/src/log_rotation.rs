//! Size-based rotation of the files under `<state_root>/logs`.
//!
//! `daemon.log` becomes `daemon.log.1`, `.1` becomes `.2`, and so on up to
//! `keep` copies; the oldest copy is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use archon_core::paths::{emit_log_path, stderr_log_path, stdout_log_path};

/// 10 MiB.
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_ROTATED_FILES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub keep: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: MAX_LOG_BYTES,
            keep: MAX_ROTATED_FILES,
        }
    }
}

impl RotationPolicy {
    /// Rotate `path` if it has reached `max_bytes`. A missing file is not an
    /// error. Returns whether a rotation happened.
    pub fn rotate(&self, path: &Path) -> io::Result<bool> {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes || self.keep == 0 {
            return Ok(false);
        }

        match fs::remove_file(numbered(path, self.keep)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        for n in (1..self.keep).rev() {
            let from = numbered(path, n);
            if from.exists() {
                fs::rename(&from, numbered(path, n + 1))?;
            }
        }
        fs::rename(path, numbered(path, 1))?;

        // Writers hold the file open in append mode; give them a fresh one.
        fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        Ok(true)
    }
}

/// Rotate every log file of a state root. Failures are logged, not returned.
pub fn rotate_logs(state_root: &Path) {
    let policy = RotationPolicy::default();
    for path in [
        stdout_log_path(state_root),
        stderr_log_path(state_root),
        emit_log_path(state_root),
    ] {
        match policy.rotate(&path) {
            Ok(true) => tracing::info!(path = %path.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "log rotation failed"),
        }
    }
}

fn numbered(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("daemon.log");
    base.with_file_name(format!("{name}.{n}"))
}
