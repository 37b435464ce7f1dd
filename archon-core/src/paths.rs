//! State-root layout and workspace discovery.
//!
//! ```text
//! <state_root>/
//!   mappings/<feature>/<kind>/<key>.json
//!   requests/<feature>/<concern>.json | .inflight | .retry
//!   dead-letter/<feature>/<concern>.json
//!   logs/daemon.log, daemon-err.log, emit.log
//!   run/daemon.sock
//! ```

use std::path::{Path, PathBuf};

use crate::io::escape_key;
use crate::types::{Concern, EntityKind, FeatureId};

pub const STATE_DIR_NAME: &str = ".archon-state";
pub const WORKSPACE_CONFIG: &str = ".specify/archon.yaml";

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const EMIT_LOG: &str = "emit.log";
pub const DAEMON_SOCKET: &str = "daemon.sock";

pub const PENDING_EXT: &str = "json";
pub const INFLIGHT_EXT: &str = "inflight";
pub const RETRY_EXT: &str = "retry";

/// Walk up from `start` to the first directory holding `.specify` or `.git`.
///
/// Falls back to `start` itself when no marker is found.
pub fn find_workspace_root(start: &Path) -> PathBuf {
    let start = std::fs::canonicalize(start).unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .find(|dir| dir.join(".specify").is_dir() || dir.join(".git").exists())
        .map(Path::to_path_buf)
        .unwrap_or(start)
}

pub fn default_state_root(workspace: &Path) -> PathBuf {
    workspace.join(STATE_DIR_NAME)
}

pub fn mappings_root(state: &Path) -> PathBuf {
    state.join("mappings")
}

pub fn feature_mappings_dir(state: &Path, feature: &FeatureId) -> PathBuf {
    mappings_root(state).join(feature.as_str())
}

pub fn mapping_dir(state: &Path, feature: &FeatureId, kind: EntityKind) -> PathBuf {
    feature_mappings_dir(state, feature).join(kind.dir_name())
}

/// `mappings/<feature>/<kind>/<escaped key>.json`. Pure, no I/O.
pub fn mapping_path(
    state: &Path,
    feature: &FeatureId,
    kind: EntityKind,
    local_key: &str,
) -> PathBuf {
    mapping_dir(state, feature, kind).join(format!("{}.json", escape_key(local_key)))
}

pub fn requests_root(state: &Path) -> PathBuf {
    state.join("requests")
}

pub fn feature_requests_dir(state: &Path, feature: &FeatureId) -> PathBuf {
    requests_root(state).join(feature.as_str())
}

pub fn request_path(state: &Path, feature: &FeatureId, concern: Concern) -> PathBuf {
    slot_file(state, feature, concern, PENDING_EXT)
}

pub fn inflight_path(state: &Path, feature: &FeatureId, concern: Concern) -> PathBuf {
    slot_file(state, feature, concern, INFLIGHT_EXT)
}

pub fn retry_path(state: &Path, feature: &FeatureId, concern: Concern) -> PathBuf {
    slot_file(state, feature, concern, RETRY_EXT)
}

fn slot_file(state: &Path, feature: &FeatureId, concern: Concern, ext: &str) -> PathBuf {
    feature_requests_dir(state, feature).join(format!("{}.{ext}", concern.slot_name()))
}

pub fn dead_letter_root(state: &Path) -> PathBuf {
    state.join("dead-letter")
}

pub fn dead_letter_path(state: &Path, feature: &FeatureId, concern: Concern) -> PathBuf {
    dead_letter_root(state)
        .join(feature.as_str())
        .join(format!("{}.{PENDING_EXT}", concern.slot_name()))
}

pub fn logs_dir(state: &Path) -> PathBuf {
    state.join("logs")
}

pub fn stdout_log_path(state: &Path) -> PathBuf {
    logs_dir(state).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(state: &Path) -> PathBuf {
    logs_dir(state).join(DAEMON_STDERR_LOG)
}

pub fn emit_log_path(state: &Path) -> PathBuf {
    logs_dir(state).join(EMIT_LOG)
}

pub fn run_dir(state: &Path) -> PathBuf {
    state.join("run")
}

pub fn socket_path(state: &Path) -> PathBuf {
    run_dir(state).join(DAEMON_SOCKET)
}
