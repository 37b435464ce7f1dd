//! One pass over the request queue.
//!
//! [`Processor::run_cycle`] is synchronous and takes `now` explicitly, so the
//! runtime drives it from a blocking worker and tests drive it directly with
//! a fake [`ArchonService`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use archon_core::io::atomic_write;
use archon_core::{EntityKind, FeatureId, Settings, StateStore, TaskItem};
use archon_sync::documents::{
    changed_since_sync, hash_bytes, hash_file, modified_at, resolve_document,
};
use archon_sync::emit::TASKS_FILE;
use archon_sync::{Claim, DocumentRef, FailOutcome, Payload, RequestQueue, RetryPolicy, SyncError};

use crate::error::{io_err, DaemonError};
use crate::service::{ArchonService, ServiceError, TaskUpsert};

/// Attempts at recording a remote id the service has just returned.
const SAVE_ATTEMPTS: u32 = 3;
const SAVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Counters for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub recovered: usize,
    pub applied: usize,
    /// Released without counting an attempt (no project mapping yet).
    pub deferred: usize,
    pub retried: usize,
    pub superseded: usize,
    pub dead_lettered: usize,
    /// Pending but still inside their backoff window.
    pub waiting: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        *self == CycleReport::default()
    }
}

#[derive(Debug)]
enum ProcessError {
    /// Not a failure: the request cannot run yet.
    Precondition(&'static str),
    Service(ServiceError),
    Local(DaemonError),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Precondition(what) => write!(f, "missing precondition: {what}"),
            ProcessError::Service(err) => write!(f, "{err}"),
            ProcessError::Local(err) => write!(f, "{err}"),
        }
    }
}

impl From<ServiceError> for ProcessError {
    fn from(err: ServiceError) -> Self {
        ProcessError::Service(err)
    }
}

/// Store and file errors during processing count as failed attempts.
fn local<T, E: Into<DaemonError>>(result: Result<T, E>) -> Result<T, ProcessError> {
    result.map_err(|e| ProcessError::Local(e.into()))
}

/// Applies pending requests against an [`ArchonService`].
#[derive(Debug, Clone)]
pub struct Processor {
    store: StateStore,
    queue: RequestQueue,
    policy: RetryPolicy,
}

impl Processor {
    pub fn new(state_root: &Path, policy: RetryPolicy) -> Self {
        Self {
            store: StateStore::new(state_root),
            queue: RequestQueue::new(state_root),
            policy,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.state_root, RetryPolicy::from_settings(settings))
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Recover orphaned in-flight requests, then attempt every due request once.
    ///
    /// A failing request is contained: it is retried or dead-lettered and the
    /// cycle moves on. Only queue bookkeeping errors abort the cycle.
    pub fn run_cycle(
        &self,
        service: &dyn ArchonService,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, DaemonError> {
        let mut report = CycleReport {
            recovered: self.queue.recover_inflight()?,
            ..CycleReport::default()
        };
        if report.recovered > 0 {
            tracing::warn!(count = report.recovered, "restored orphaned in-flight requests");
        }

        for (feature, concern) in self.queue.list_pending()? {
            if !self.queue.is_due(&feature, concern, now)? {
                report.waiting += 1;
                continue;
            }
            let claim = match self.queue.claim(&feature, concern) {
                Ok(Some(claim)) => claim,
                Ok(None) => continue,
                Err(SyncError::MalformedRequest { path, source }) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %source,
                        "malformed request moved to dead-letter",
                    );
                    report.dead_lettered += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match self.process(&claim, service) {
                Ok(()) => {
                    self.queue.complete(&claim)?;
                    tracing::info!(feature = %feature, concern = %concern, "request applied");
                    report.applied += 1;
                }
                Err(ProcessError::Precondition(what)) => {
                    self.queue.release(&claim)?;
                    tracing::debug!(
                        feature = %feature,
                        concern = %concern,
                        what,
                        "request deferred",
                    );
                    report.deferred += 1;
                }
                Err(err) => {
                    let message = err.to_string();
                    match self.queue.fail(&claim, &message, now, &self.policy)? {
                        FailOutcome::Retry {
                            attempts,
                            next_attempt_at,
                        } => {
                            tracing::warn!(
                                feature = %feature,
                                concern = %concern,
                                attempts,
                                next_attempt_at = %next_attempt_at,
                                error = %message,
                                "request failed, will retry",
                            );
                            report.retried += 1;
                        }
                        FailOutcome::Superseded => report.superseded += 1,
                        FailOutcome::DeadLettered { attempts } => {
                            tracing::error!(
                                feature = %feature,
                                concern = %concern,
                                attempts,
                                error = %message,
                                "request dead-lettered",
                            );
                            report.dead_lettered += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    fn process(&self, claim: &Claim, service: &dyn ArchonService) -> Result<(), ProcessError> {
        let record = &claim.record;
        let feature = &record.feature;
        let dir = record.feature_dir.as_path();
        match &record.payload {
            Payload::Init { title, description } => {
                let existing = local(self.store.load_mapping(feature, EntityKind::Project, ""))?;
                let existing = (!existing.is_empty()).then_some(existing.as_str());
                let project_id = service.create_or_update_project(existing, title, description)?;
                self.save_remote_id(feature, EntityKind::Project, "", &project_id)
            }
            Payload::DocPush { documents } => {
                let project_id = self.project_id(feature)?;
                self.push_documents(feature, dir, &project_id, documents, service)
            }
            Payload::DocPull { documents } => {
                let project_id = self.project_id(feature)?;
                self.pull_documents(feature, dir, &project_id, documents, service)
            }
            Payload::TaskSync { tasks } => {
                let project_id = self.project_id(feature)?;
                self.upsert_tasks(feature, &project_id, tasks, service)
            }
            Payload::StatusPull => {
                let project_id = self.project_id(feature)?;
                self.pull_status(feature, dir, &project_id, service)
            }
        }
    }

    fn project_id(&self, feature: &FeatureId) -> Result<String, ProcessError> {
        let id = local(self.store.load_mapping(feature, EntityKind::Project, ""))?;
        if id.is_empty() {
            return Err(ProcessError::Precondition("project mapping"));
        }
        Ok(id)
    }

    /// Record a remote id returned by the service.
    ///
    /// The remote entity already exists, so a failed save is retried with a
    /// short pause. If every attempt fails the orphaned remote id is logged at
    /// error level.
    fn save_remote_id(
        &self,
        feature: &FeatureId,
        kind: EntityKind,
        local_key: &str,
        remote_id: &str,
    ) -> Result<(), ProcessError> {
        let mut attempt = 1;
        loop {
            match self.store.save_mapping(feature, kind, local_key, remote_id) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < SAVE_ATTEMPTS => {
                    tracing::warn!(
                        feature = %feature,
                        kind = %kind,
                        local_key,
                        attempt,
                        error = %err,
                        "could not record remote id, retrying",
                    );
                    std::thread::sleep(SAVE_RETRY_DELAY * attempt);
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(
                        feature = %feature,
                        kind = %kind,
                        local_key,
                        remote_id,
                        error = %err,
                        "remote entity is orphaned: its id could not be recorded",
                    );
                    return Err(ProcessError::Local(err.into()));
                }
            }
        }
    }

    fn push_documents(
        &self,
        feature: &FeatureId,
        dir: &Path,
        project_id: &str,
        documents: &[DocumentRef],
        service: &dyn ArchonService,
    ) -> Result<(), ProcessError> {
        for doc in documents {
            let Some(path) = resolve_document(dir, &doc.filename) else {
                tracing::warn!(filename = %doc.filename, "ignoring document outside the feature");
                continue;
            };
            if !path.is_file() {
                tracing::debug!(path = %path.display(), "document vanished before push");
                continue;
            }
            // Captured before reading so an edit during the push stays newer.
            let seen_at = local(modified_at(&path))?;
            let content = local(std::fs::read_to_string(&path).map_err(|e| io_err(&path, e)))?;

            let existing =
                local(self.store.load_mapping(feature, EntityKind::Document, &doc.filename))?;
            let existing = (!existing.is_empty()).then_some(existing.as_str());
            let document_id =
                service.push_document(project_id, existing, &doc.filename, &content)?;

            self.save_remote_id(feature, EntityKind::Document, &doc.filename, &document_id)?;
            local(self.store.save_document_sync(
                feature,
                &doc.filename,
                &seen_at,
                &hash_bytes(content.as_bytes()),
            ))?;
        }
        Ok(())
    }

    fn pull_documents(
        &self,
        feature: &FeatureId,
        dir: &Path,
        project_id: &str,
        filenames: &[String],
        service: &dyn ArchonService,
    ) -> Result<(), ProcessError> {
        for filename in filenames {
            let document_id =
                local(self.store.load_mapping(feature, EntityKind::Document, filename))?;
            if document_id.is_empty() {
                continue;
            }
            let Some(path) = resolve_document(dir, filename) else {
                tracing::warn!(filename = %filename, "ignoring document outside the feature");
                continue;
            };

            if path.exists() {
                let synced = local(self.store.load_sync_record(feature, filename))?;
                let sha256 = local(hash_file(&path))?;
                let current = local(modified_at(&path))?;
                if changed_since_sync(&sha256, &current, synced.as_ref()) {
                    tracing::info!(
                        path = %path.display(),
                        "local edits not yet pushed, skipping pull",
                    );
                    continue;
                }
            }

            let content = service.pull_document(project_id, &document_id)?;
            local(atomic_write(&path, content.as_bytes()))?;
            let written_at = local(modified_at(&path))?;
            local(self.store.save_document_sync(
                feature,
                filename,
                &written_at,
                &hash_bytes(content.as_bytes()),
            ))?;
        }
        Ok(())
    }

    fn upsert_tasks(
        &self,
        feature: &FeatureId,
        project_id: &str,
        tasks: &[TaskItem],
        service: &dyn ArchonService,
    ) -> Result<(), ProcessError> {
        // Each id is recorded before the next call, so a failure part-way
        // leaves earlier tasks mapped and the retry updates them.
        for item in tasks {
            let local_key = item.local_key();
            let remote = local(self.store.load_mapping(feature, EntityKind::Task, &local_key))?;
            let upsert = TaskUpsert {
                local_key,
                remote_id: (!remote.is_empty()).then_some(remote),
                item: item.clone(),
            };
            let remote_id = service.upsert_task(project_id, &upsert)?;
            self.save_remote_id(feature, EntityKind::Task, &upsert.local_key, &remote_id)?;
        }
        Ok(())
    }

    fn pull_status(
        &self,
        feature: &FeatureId,
        dir: &Path,
        project_id: &str,
        service: &dyn ArchonService,
    ) -> Result<(), ProcessError> {
        let statuses = service.pull_status(project_id)?;

        let mappings = local(self.store.list_mappings(feature, EntityKind::Task))?;
        let by_remote: HashMap<String, String> = mappings
            .into_iter()
            .filter(|m| !m.local_key.starts_with('#'))
            .map(|m| (m.remote_id, m.local_key))
            .collect();
        let updates: HashMap<_, _> = statuses
            .into_iter()
            .filter_map(|s| by_remote.get(&s.remote_id).map(|key| (key.clone(), s.status)))
            .collect();
        if updates.is_empty() {
            return Ok(());
        }

        let path = dir.join(TASKS_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(ProcessError::Local(io_err(&path, err))),
        };
        let updated = archon_core::tasks::apply_status(&content, &updates);
        if updated != content {
            local(atomic_write(&path, updated.as_bytes()))?;
        }
        Ok(())
    }
}
