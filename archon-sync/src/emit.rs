//! Request emitters.
//!
//! Each emitter inspects local artifacts and the State Store, then writes at
//! most one request record into its `(feature, concern)` slot. Emitters do
//! local file I/O only and never print. Every "known" reason not to emit is a
//! [`SkipReason`]; [`EmitError`] is left for unexpected I/O failures.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use archon_core::tasks::parse_tasks_file;
use archon_core::{Concern, EntityKind, FeatureId, Settings, StateStore, SyncMode};
use archon_probe::{probe, Availability};

use crate::documents::{changed_since_sync, hash_file, list_documents};
use crate::error::{io_err, SyncError};
use crate::queue::{DocumentRef, Payload, RequestQueue, RequestRecord, WriteOutcome};

pub type EmitError = SyncError;

pub const SPEC_FILE: &str = "spec.md";
pub const TASKS_FILE: &str = "tasks.md";

/// Why an emitter wrote nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Unavailable,
    MissingFeatureDir,
    InvalidFeatureName,
    /// The feature has no `Project` mapping yet.
    MissingProject,
    NothingToSync,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::Unavailable => "integration unavailable",
            SkipReason::MissingFeatureDir => "feature directory does not exist",
            SkipReason::InvalidFeatureName => "directory is not a feature",
            SkipReason::MissingProject => "feature has no project mapping",
            SkipReason::NothingToSync => "nothing to sync",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Written,
    /// The identical request was already pending.
    Unchanged,
    Skipped(SkipReason),
}

impl From<WriteOutcome> for EmitOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Written => EmitOutcome::Written,
            WriteOutcome::Unchanged => EmitOutcome::Unchanged,
        }
    }
}

/// Writes requests for features of one workspace.
#[derive(Debug, Clone)]
pub struct Emitter {
    available: bool,
    store: StateStore,
    queue: RequestQueue,
}

impl Emitter {
    pub fn new(settings: &Settings) -> Self {
        Self::with_availability(settings, probe(settings))
    }

    pub fn with_availability(settings: &Settings, availability: Availability) -> Self {
        Self {
            available: availability.is_available(),
            store: StateStore::new(&settings.state_root),
            queue: RequestQueue::new(&settings.state_root),
        }
    }

    pub fn emit_init(&self, feature_dir: &Path) -> Result<EmitOutcome, EmitError> {
        let (feature, dir) = match self.target(feature_dir) {
            Ok(target) => target,
            Err(reason) => return Ok(skipped(Concern::Init, feature_dir, reason)),
        };
        let (title, description) = read_spec_summary(&dir, &feature)?;
        self.write(RequestRecord {
            feature,
            concern: Concern::Init,
            mode: None,
            feature_dir: dir,
            payload: Payload::Init { title, description },
        })
    }

    pub fn emit_doc_sync(
        &self,
        feature_dir: &Path,
        mode: SyncMode,
    ) -> Result<EmitOutcome, EmitError> {
        let (feature, dir) = match self.target(feature_dir) {
            Ok(target) => target,
            Err(reason) => return Ok(skipped(Concern::DocSync, feature_dir, reason)),
        };

        let payload = match mode {
            SyncMode::Push => {
                let mut documents = Vec::new();
                for doc in list_documents(&dir)? {
                    let synced = self.store.load_sync_record(&feature, &doc.filename)?;
                    let sha256 = hash_file(&doc.path)?;
                    if changed_since_sync(&sha256, &doc.modified_at, synced.as_ref()) {
                        documents.push(DocumentRef {
                            sha256,
                            filename: doc.filename,
                        });
                    }
                }
                if documents.is_empty() {
                    return Ok(skipped(Concern::DocSync, &dir, SkipReason::NothingToSync));
                }
                Payload::DocPush { documents }
            }
            SyncMode::Pull => {
                if !self.has_project(&feature)? {
                    return Ok(skipped(Concern::DocSync, &dir, SkipReason::MissingProject));
                }
                let documents: Vec<String> = self
                    .store
                    .list_mappings(&feature, EntityKind::Document)?
                    .into_iter()
                    .map(|m| m.local_key)
                    .collect();
                if documents.is_empty() {
                    return Ok(skipped(Concern::DocSync, &dir, SkipReason::NothingToSync));
                }
                Payload::DocPull { documents }
            }
        };

        self.write(RequestRecord {
            feature,
            concern: Concern::DocSync,
            mode: Some(mode),
            feature_dir: dir,
            payload,
        })
    }

    pub fn emit_task_sync(&self, feature_dir: &Path) -> Result<EmitOutcome, EmitError> {
        let (feature, dir) = match self.target(feature_dir) {
            Ok(target) => target,
            Err(reason) => return Ok(skipped(Concern::TaskSync, feature_dir, reason)),
        };
        if !self.has_project(&feature)? {
            return Ok(skipped(Concern::TaskSync, &dir, SkipReason::MissingProject));
        }
        let tasks_path = dir.join(TASKS_FILE);
        if !tasks_path.is_file() {
            return Ok(skipped(Concern::TaskSync, &dir, SkipReason::NothingToSync));
        }
        let tasks = parse_tasks_file(&tasks_path)?;
        if tasks.is_empty() {
            return Ok(skipped(Concern::TaskSync, &dir, SkipReason::NothingToSync));
        }
        self.write(RequestRecord {
            feature,
            concern: Concern::TaskSync,
            mode: None,
            feature_dir: dir,
            payload: Payload::TaskSync { tasks },
        })
    }

    pub fn emit_status_pull(&self, feature_dir: &Path) -> Result<EmitOutcome, EmitError> {
        let (feature, dir) = match self.target(feature_dir) {
            Ok(target) => target,
            Err(reason) => return Ok(skipped(Concern::StatusPull, feature_dir, reason)),
        };
        if !self.has_project(&feature)? {
            return Ok(skipped(Concern::StatusPull, &dir, SkipReason::MissingProject));
        }
        self.write(RequestRecord {
            feature,
            concern: Concern::StatusPull,
            mode: None,
            feature_dir: dir,
            payload: Payload::StatusPull,
        })
    }

    /// Dispatch on `concern`. `mode` only matters for DocSync.
    pub fn emit(
        &self,
        concern: Concern,
        feature_dir: &Path,
        mode: SyncMode,
    ) -> Result<EmitOutcome, EmitError> {
        match concern {
            Concern::Init => self.emit_init(feature_dir),
            Concern::DocSync => self.emit_doc_sync(feature_dir, mode),
            Concern::TaskSync => self.emit_task_sync(feature_dir),
            Concern::StatusPull => self.emit_status_pull(feature_dir),
        }
    }

    fn target(&self, feature_dir: &Path) -> Result<(FeatureId, PathBuf), SkipReason> {
        if !self.available {
            return Err(SkipReason::Unavailable);
        }
        if !feature_dir.is_dir() {
            return Err(SkipReason::MissingFeatureDir);
        }
        let dir = std::fs::canonicalize(feature_dir).map_err(|_| SkipReason::MissingFeatureDir)?;
        let feature = FeatureId::from_dir(&dir).map_err(|_| SkipReason::InvalidFeatureName)?;
        Ok((feature, dir))
    }

    fn has_project(&self, feature: &FeatureId) -> Result<bool, EmitError> {
        Ok(!self
            .store
            .load_mapping(feature, EntityKind::Project, "")?
            .is_empty())
    }

    fn write(&self, record: RequestRecord) -> Result<EmitOutcome, EmitError> {
        let outcome = self.queue.write(&record)?;
        tracing::debug!(
            "emit {} for {}: {:?}",
            record.concern,
            record.feature,
            outcome
        );
        Ok(outcome.into())
    }
}

fn skipped(concern: Concern, feature_dir: &Path, reason: SkipReason) -> EmitOutcome {
    tracing::debug!("emit {concern} for {}: skipped ({reason})", feature_dir.display());
    EmitOutcome::Skipped(reason)
}

/// Title and description for the project, from the feature's `spec.md`.
///
/// Title is the first `#` heading (falls back to the feature id); description
/// is the first paragraph that is not a heading, joined onto one line.
pub fn read_spec_summary(
    feature_dir: &Path,
    feature: &FeatureId,
) -> Result<(String, String), EmitError> {
    let path = feature_dir.join(SPEC_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(err) => return Err(io_err(&path, err)),
    };
    Ok(summarize(&content, feature.as_str()))
}

fn summarize(content: &str, fallback_title: &str) -> (String, String) {
    let mut title = None;
    let mut paragraph: Vec<&str> = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("# ") {
            if title.is_none() {
                title = Some(heading.trim().to_string());
            }
            if !paragraph.is_empty() {
                break;
            }
            continue;
        }
        if trimmed.starts_with('#') {
            if !paragraph.is_empty() {
                break;
            }
            continue;
        }
        if trimmed.is_empty() {
            if !paragraph.is_empty() && title.is_some() {
                break;
            }
            continue;
        }
        paragraph.push(trimmed);
    }

    let title = title
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| fallback_title.to_string());
    (title, paragraph.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_uses_first_heading_and_paragraph() {
        let spec = "# Feature Specification: Login\n\n**Branch**: `001-login`\nCreated today\n\n## Scenarios\n\nIgnored\n";
        let (title, description) = summarize(spec, "001-login");
        assert_eq!(title, "Feature Specification: Login");
        assert_eq!(description, "**Branch**: `001-login` Created today");
    }

    #[test]
    fn summary_falls_back_to_feature_id() {
        let (title, description) = summarize("", "001-login");
        assert_eq!(title, "001-login");
        assert_eq!(description, "");
    }

    #[test]
    fn skip_reasons_read_as_sentences() {
        assert_eq!(SkipReason::MissingProject.to_string(), "feature has no project mapping");
    }
}
