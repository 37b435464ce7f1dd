//! Coalescing request queue.
//!
//! One slot per `(feature, concern)`:
//!
//! ```text
//! requests/<feature>/<concern>.json      pending (latest emit wins)
//! requests/<feature>/<concern>.inflight  claimed by the daemon
//! requests/<feature>/<concern>.retry     retry bookkeeping for the pending bytes
//! dead-letter/<feature>/<concern>.json   gave up after max attempts
//! ```
//!
//! State transitions are single renames or no-clobber hard links, so an emit
//! racing the daemon either lands before the claim (and is processed) or after
//! it (and stays pending). A failed claim is never restored over a newer emit.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use archon_core::io::{atomic_write, read_optional, remove_if_exists};
use archon_core::paths::{
    dead_letter_path, dead_letter_root, inflight_path, request_path, requests_root, retry_path,
    INFLIGHT_EXT, PENDING_EXT,
};
use archon_core::{format_timestamp, Concern, FeatureId, Settings, SyncMode, TaskItem};

use crate::error::{io_err, SyncError};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A document the emitter saw as needing a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Path relative to the feature directory, `/`-separated.
    pub filename: String,
    pub sha256: String,
}

/// Concern-specific request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Init { title: String, description: String },
    DocPush { documents: Vec<DocumentRef> },
    DocPull { documents: Vec<String> },
    TaskSync { tasks: Vec<TaskItem> },
    StatusPull,
}

/// A pending, coalesced unit of work for the daemon.
///
/// Carries no timestamps or counters: emitting twice over unchanged artifacts
/// produces identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub feature: FeatureId,
    pub concern: Concern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SyncMode>,
    pub feature_dir: PathBuf,
    pub payload: Payload,
}

impl RequestRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Retry bookkeeping kept beside a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// sha256 of the request bytes these attempts were made with.
    pub fingerprint: String,
    pub attempts: u32,
    pub next_attempt_at: String,
    pub last_error: String,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.config.max_attempts.max(1),
            base: Duration::from_secs(settings.config.backoff_base_secs),
            cap: Duration::from_secs(settings.config.backoff_cap_secs),
        }
    }

    /// Delay before the next attempt after `attempts` failures.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempts.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let secs = self.base.as_secs().saturating_mul(factor);
        Duration::from_secs(secs).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base: Duration::from_secs(30),
            cap: Duration::from_secs(3600),
        }
    }
}

/// Result of writing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The pending slot already held identical bytes.
    Unchanged,
}

/// A request the daemon has moved to in-flight.
#[derive(Debug, Clone)]
pub struct Claim {
    pub feature: FeatureId,
    pub concern: Concern,
    pub record: RequestRecord,
    bytes: Vec<u8>,
}

impl Claim {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.bytes)
    }
}

/// What happened to a claim whose external call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending; retried once `next_attempt_at` has passed.
    Retry { attempts: u32, next_attempt_at: String },
    /// A newer emit filled the slot while in flight; the old claim is dropped.
    Superseded,
    /// Attempts exhausted; moved to the dead-letter area.
    DeadLettered { attempts: u32 },
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Handle on the request and dead-letter areas of a state root.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    root: PathBuf,
}

impl RequestQueue {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            root: state_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `record` into its slot, replacing whatever was pending.
    pub fn write(&self, record: &RequestRecord) -> Result<WriteOutcome, SyncError> {
        let bytes = record.to_bytes()?;
        let path = request_path(&self.root, &record.feature, record.concern);
        if read_optional(&path)?.as_deref() == Some(bytes.as_slice()) {
            return Ok(WriteOutcome::Unchanged);
        }
        atomic_write(&path, &bytes)?;
        remove_if_exists(&dead_letter_path(&self.root, &record.feature, record.concern))?;
        tracing::debug!("queued {} for {}", record.concern, record.feature);
        Ok(WriteOutcome::Written)
    }

    /// The pending record in a slot, if any.
    pub fn pending(
        &self,
        feature: &FeatureId,
        concern: Concern,
    ) -> Result<Option<RequestRecord>, SyncError> {
        let path = request_path(&self.root, feature, concern);
        match read_optional(&path)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| SyncError::MalformedRequest { path, source }),
            None => Ok(None),
        }
    }

    /// sha256 of the pending bytes in a slot.
    pub fn pending_fingerprint(
        &self,
        feature: &FeatureId,
        concern: Concern,
    ) -> Result<Option<String>, SyncError> {
        let path = request_path(&self.root, feature, concern);
        Ok(read_optional(&path)?.map(|bytes| fingerprint(&bytes)))
    }

    /// Every pending slot, sorted by feature then concern.
    pub fn list_pending(&self) -> Result<Vec<(FeatureId, Concern)>, SyncError> {
        list_slots(&requests_root(&self.root), PENDING_EXT)
    }

    /// Every in-flight slot, sorted by feature then concern.
    pub fn list_inflight(&self) -> Result<Vec<(FeatureId, Concern)>, SyncError> {
        list_slots(&requests_root(&self.root), INFLIGHT_EXT)
    }

    /// Every dead-lettered slot, sorted by feature then concern.
    pub fn list_dead_letters(&self) -> Result<Vec<(FeatureId, Concern)>, SyncError> {
        list_slots(&dead_letter_root(&self.root), PENDING_EXT)
    }

    pub fn retry_state(
        &self,
        feature: &FeatureId,
        concern: Concern,
    ) -> Result<Option<RetryState>, SyncError> {
        let path = retry_path(&self.root, feature, concern);
        match read_optional(&path)? {
            // A corrupt sidecar only loses backoff history.
            Some(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            None => Ok(None),
        }
    }

    /// Whether the pending request in a slot may be attempted at `now`.
    pub fn is_due(
        &self,
        feature: &FeatureId,
        concern: Concern,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let Some(bytes) = read_optional(&request_path(&self.root, feature, concern))? else {
            return Ok(false);
        };
        let Some(state) = self.retry_state(feature, concern)? else {
            return Ok(true);
        };
        if state.fingerprint != fingerprint(&bytes) {
            return Ok(true);
        }
        Ok(state.next_attempt_at <= format_timestamp(now))
    }

    /// Move a pending request to in-flight. `Ok(None)` if the slot emptied
    /// in the meantime.
    ///
    /// A record that does not parse is moved to the dead-letter area and
    /// reported as [`SyncError::MalformedRequest`].
    pub fn claim(&self, feature: &FeatureId, concern: Concern) -> Result<Option<Claim>, SyncError> {
        let pending = request_path(&self.root, feature, concern);
        let inflight = inflight_path(&self.root, feature, concern);
        match std::fs::rename(&pending, &inflight) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&pending, err)),
        }

        let bytes = std::fs::read(&inflight).map_err(|e| io_err(&inflight, e))?;
        match serde_json::from_slice::<RequestRecord>(&bytes) {
            Ok(record) => Ok(Some(Claim {
                feature: feature.clone(),
                concern,
                record,
                bytes,
            })),
            Err(source) => {
                let dead = dead_letter_path(&self.root, feature, concern);
                move_file(&inflight, &dead)?;
                Err(SyncError::MalformedRequest { path: dead, source })
            }
        }
    }

    /// The external call succeeded: the request is simply gone.
    pub fn complete(&self, claim: &Claim) -> Result<(), SyncError> {
        remove_if_exists(&inflight_path(&self.root, &claim.feature, claim.concern))?;
        self.clear_retry_for(claim)?;
        Ok(())
    }

    /// Put a claim back untouched without counting an attempt (a precondition
    /// was missing). Dropped if a newer emit already refilled the slot.
    pub fn release(&self, claim: &Claim) -> Result<bool, SyncError> {
        let inflight = inflight_path(&self.root, &claim.feature, claim.concern);
        let pending = request_path(&self.root, &claim.feature, claim.concern);
        restore_no_clobber(&inflight, &pending)
    }

    /// The external call failed: back to pending with backoff, or to the
    /// dead-letter area once `policy.max_attempts` is reached.
    pub fn fail(
        &self,
        claim: &Claim,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailOutcome, SyncError> {
        let inflight = inflight_path(&self.root, &claim.feature, claim.concern);
        let pending = request_path(&self.root, &claim.feature, claim.concern);
        let fingerprint = claim.fingerprint();

        let attempts = match self.retry_state(&claim.feature, claim.concern)? {
            Some(state) if state.fingerprint == fingerprint => state.attempts + 1,
            _ => 1,
        };

        if attempts >= policy.max_attempts {
            move_file(&inflight, &dead_letter_path(&self.root, &claim.feature, claim.concern))?;
            self.clear_retry_for(claim)?;
            tracing::warn!(
                "{} for {} dead-lettered after {attempts} attempts: {error}",
                claim.concern,
                claim.feature
            );
            return Ok(FailOutcome::DeadLettered { attempts });
        }

        if !restore_no_clobber(&inflight, &pending)? {
            return Ok(FailOutcome::Superseded);
        }

        let next = now
            + chrono::Duration::from_std(policy.delay_for(attempts))
                .unwrap_or_else(|_| chrono::Duration::zero());
        let state = RetryState {
            fingerprint,
            attempts,
            next_attempt_at: format_timestamp(next),
            last_error: error.to_string(),
        };
        let mut bytes = serde_json::to_vec_pretty(&state)?;
        bytes.push(b'\n');
        atomic_write(&retry_path(&self.root, &claim.feature, claim.concern), &bytes)?;

        Ok(FailOutcome::Retry {
            attempts,
            next_attempt_at: state.next_attempt_at,
        })
    }

    /// Restore in-flight files orphaned by a crash. Returns how many were put
    /// back to pending.
    pub fn recover_inflight(&self) -> Result<usize, SyncError> {
        let mut restored = 0;
        for (feature, concern) in self.list_inflight()? {
            let inflight = inflight_path(&self.root, &feature, concern);
            let pending = request_path(&self.root, &feature, concern);
            if restore_no_clobber(&inflight, &pending)? {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Move a dead-lettered request back to pending with a fresh retry budget.
    /// `false` if nothing was dead-lettered or a newer request is pending.
    pub fn requeue(&self, feature: &FeatureId, concern: Concern) -> Result<bool, SyncError> {
        let dead = dead_letter_path(&self.root, feature, concern);
        if !dead.exists() {
            return Ok(false);
        }
        remove_if_exists(&retry_path(&self.root, feature, concern))?;
        let pending = request_path(&self.root, feature, concern);
        if let Some(parent) = pending.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        restore_no_clobber(&dead, &pending)
    }

    fn clear_retry_for(&self, claim: &Claim) -> Result<(), SyncError> {
        let path = retry_path(&self.root, &claim.feature, claim.concern);
        // Only clear bookkeeping that belongs to the claimed bytes; a newer
        // emit's sidecar (if any) is left to its own fingerprint check.
        if let Some(state) = self.retry_state(&claim.feature, claim.concern)? {
            if state.fingerprint == claim.fingerprint() {
                remove_if_exists(&path)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Link `from` to `to` unless `to` exists, then remove `from`.
///
/// Returns `false` (and drops `from`) when `to` already existed.
fn restore_no_clobber(from: &Path, to: &Path) -> Result<bool, SyncError> {
    match std::fs::hard_link(from, to) {
        Ok(()) => {
            remove_if_exists(from)?;
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            remove_if_exists(from)?;
            Ok(false)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(to, err)),
    }
}

fn move_file(from: &Path, to: &Path) -> Result<(), SyncError> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    std::fs::rename(from, to).map_err(|e| io_err(to, e))
}

fn list_slots(root: &Path, ext: &str) -> Result<Vec<(FeatureId, Concern)>, SyncError> {
    let features = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(io_err(root, err)),
    };

    let mut slots = Vec::new();
    for entry in features.filter_map(|e| e.ok()) {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Ok(feature) = FeatureId::parse(&entry.file_name().to_string_lossy()) else {
            continue;
        };
        let files = std::fs::read_dir(entry.path()).map_err(|e| io_err(entry.path(), e))?;
        for file in files.filter_map(|e| e.ok()) {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
            let concern = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(Concern::from_slot_name);
            if let Some(concern) = concern {
                slots.push((feature.clone(), concern));
            }
        }
    }
    slots.sort();
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn feature() -> FeatureId {
        FeatureId::parse("001-test-feature").unwrap()
    }

    fn status_pull(dir: &str) -> RequestRecord {
        RequestRecord {
            feature: feature(),
            concern: Concern::StatusPull,
            mode: None,
            feature_dir: PathBuf::from(dir),
            payload: Payload::StatusPull,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 16, 1, 30, 0).unwrap()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base: Duration::from_secs(30),
            cap: Duration::from_secs(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(100));
        assert_eq!(policy.delay_for(200), Duration::from_secs(100));
    }

    #[test]
    fn second_identical_write_is_unchanged() {
        let tmp = TempDir::new().unwrap();
        let queue = RequestQueue::new(tmp.path());
        assert_eq!(queue.write(&status_pull("/a")).unwrap(), WriteOutcome::Written);
        assert_eq!(queue.write(&status_pull("/a")).unwrap(), WriteOutcome::Unchanged);
        assert_eq!(queue.write(&status_pull("/b")).unwrap(), WriteOutcome::Written);
    }

    #[test]
    fn failure_while_superseded_keeps_newer_emit() {
        let tmp = TempDir::new().unwrap();
        let queue = RequestQueue::new(tmp.path());
        queue.write(&status_pull("/old")).unwrap();
        let claim = queue.claim(&feature(), Concern::StatusPull).unwrap().unwrap();

        queue.write(&status_pull("/new")).unwrap();
        let outcome = queue.fail(&claim, "boom", now(), &RetryPolicy::default()).unwrap();
        assert_eq!(outcome, FailOutcome::Superseded);

        let pending = queue.pending(&feature(), Concern::StatusPull).unwrap().unwrap();
        assert_eq!(pending.feature_dir, PathBuf::from("/new"));
        assert!(queue.list_inflight().unwrap().is_empty());
    }

    #[test]
    fn retry_waits_for_backoff_then_becomes_due() {
        let tmp = TempDir::new().unwrap();
        let queue = RequestQueue::new(tmp.path());
        queue.write(&status_pull("/a")).unwrap();
        let claim = queue.claim(&feature(), Concern::StatusPull).unwrap().unwrap();
        let outcome = queue.fail(&claim, "down", now(), &RetryPolicy::default()).unwrap();
        assert!(matches!(outcome, FailOutcome::Retry { attempts: 1, .. }));

        assert!(!queue.is_due(&feature(), Concern::StatusPull, now()).unwrap());
        let later = now() + chrono::Duration::seconds(30);
        assert!(queue.is_due(&feature(), Concern::StatusPull, later).unwrap());
    }

    #[test]
    fn new_emit_resets_backoff() {
        let tmp = TempDir::new().unwrap();
        let queue = RequestQueue::new(tmp.path());
        queue.write(&status_pull("/a")).unwrap();
        let claim = queue.claim(&feature(), Concern::StatusPull).unwrap().unwrap();
        queue.fail(&claim, "down", now(), &RetryPolicy::default()).unwrap();

        queue.write(&status_pull("/b")).unwrap();
        assert!(queue.is_due(&feature(), Concern::StatusPull, now()).unwrap());
    }

    #[test]
    fn exhausted_attempts_dead_letter_and_requeue() {
        let tmp = TempDir::new().unwrap();
        let queue = RequestQueue::new(tmp.path());
        let policy = RetryPolicy {
            max_attempts: 2,
            base: Duration::from_secs(0),
            cap: Duration::from_secs(0),
        };
        queue.write(&status_pull("/a")).unwrap();

        let claim = queue.claim(&feature(), Concern::StatusPull).unwrap().unwrap();
        assert!(matches!(
            queue.fail(&claim, "e1", now(), &policy).unwrap(),
            FailOutcome::Retry { attempts: 1, .. }
        ));
        let claim = queue.claim(&feature(), Concern::StatusPull).unwrap().unwrap();
        assert_eq!(
            queue.fail(&claim, "e2", now(), &policy).unwrap(),
            FailOutcome::DeadLettered { attempts: 2 }
        );

        assert!(queue.list_pending().unwrap().is_empty());
        assert_eq!(queue.list_dead_letters().unwrap(), vec![(feature(), Concern::StatusPull)]);
        assert!(queue.retry_state(&feature(), Concern::StatusPull).unwrap().is_none());

        assert!(queue.requeue(&feature(), Concern::StatusPull).unwrap());
        assert_eq!(queue.list_pending().unwrap(), vec![(feature(), Concern::StatusPull)]);
        assert!(queue.list_dead_letters().unwrap().is_empty());
    }

    #[test]
    fn malformed_request_is_dead_lettered_on_claim() {
        let tmp = TempDir::new().unwrap();
        let queue = RequestQueue::new(tmp.path());
        let path = request_path(tmp.path(), &feature(), Concern::Init);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        let err = queue.claim(&feature(), Concern::Init).unwrap_err();
        assert!(matches!(err, SyncError::MalformedRequest { .. }), "got: {err}");
        assert!(queue.list_pending().unwrap().is_empty());
        assert_eq!(queue.list_dead_letters().unwrap(), vec![(feature(), Concern::Init)]);
    }

    #[test]
    fn recover_restores_orphaned_inflight() {
        let tmp = TempDir::new().unwrap();
        let queue = RequestQueue::new(tmp.path());
        queue.write(&status_pull("/a")).unwrap();
        let _claim = queue.claim(&feature(), Concern::StatusPull).unwrap().unwrap();

        assert_eq!(queue.recover_inflight().unwrap(), 1);
        assert_eq!(queue.list_pending().unwrap(), vec![(feature(), Concern::StatusPull)]);
        assert!(queue.list_inflight().unwrap().is_empty());
    }
}
