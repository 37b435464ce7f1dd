//! Domain types shared by the store, the request queue and the daemon.
//!
//! Everything persisted is serde-serializable; on-disk field names are
//! snake_case and enum values lowercase.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Fixed, sortable timestamp layout used for every persisted sync time.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format `at` with [`TIMESTAMP_FORMAT`] (UTC, second precision).
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Current time in [`TIMESTAMP_FORMAT`].
pub fn timestamp_now() -> String {
    format_timestamp(Utc::now())
}

// ---------------------------------------------------------------------------
// FeatureId
// ---------------------------------------------------------------------------

static FEATURE_RE: OnceLock<Regex> = OnceLock::new();

fn feature_re() -> &'static Regex {
    FEATURE_RE.get_or_init(|| Regex::new(r"^[0-9]+-[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap())
}

/// Identifier of a feature: the `<ordinal>-<kebab-case-name>` trailing
/// segment of its directory, e.g. `001-test-feature`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureId(String);

impl FeatureId {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        if raw.len() > 128 || !feature_re().is_match(raw) {
            return Err(CoreError::InvalidFeature(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Derive the feature id from the last path segment of `feature_dir`.
    pub fn from_dir(feature_dir: &Path) -> Result<Self, CoreError> {
        let name = feature_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CoreError::InvalidFeature(feature_dir.display().to_string()))?;
        Self::parse(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for FeatureId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<FeatureId> for String {
    fn from(id: FeatureId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of local artifact a mapping refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Document,
    Task,
    SyncMeta,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Project,
        EntityKind::Document,
        EntityKind::Task,
        EntityKind::SyncMeta,
    ];

    /// Directory name used under `mappings/<feature>/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Document => "document",
            EntityKind::Task => "task",
            EntityKind::SyncMeta => "sync-meta",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "project" => Ok(EntityKind::Project),
            "document" | "doc" => Ok(EntityKind::Document),
            "task" => Ok(EntityKind::Task),
            "sync-meta" | "sync_meta" => Ok(EntityKind::SyncMeta),
            other => Err(format!(
                "unknown entity kind '{other}'; expected: project, document, task, sync-meta"
            )),
        }
    }
}

/// One of the four synchronizable activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concern {
    Init,
    DocSync,
    TaskSync,
    StatusPull,
}

impl Concern {
    pub const ALL: [Concern; 4] = [
        Concern::Init,
        Concern::DocSync,
        Concern::TaskSync,
        Concern::StatusPull,
    ];

    /// File stem of the request slot for this concern.
    pub fn slot_name(self) -> &'static str {
        match self {
            Concern::Init => "init",
            Concern::DocSync => "doc-sync",
            Concern::TaskSync => "task-sync",
            Concern::StatusPull => "status-pull",
        }
    }

    pub fn from_slot_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.slot_name() == name)
    }
}

impl fmt::Display for Concern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slot_name())
    }
}

/// Direction of a document sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Push,
    Pull,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Push => f.write_str("push"),
            SyncMode::Pull => f.write_str("pull"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(SyncMode::Push),
            "pull" => Ok(SyncMode::Pull),
            other => Err(format!("unknown sync mode '{other}'; expected: push, pull")),
        }
    }
}

/// Completion state of a checklist task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Todo,
    Done,
}

impl TaskStatus {
    /// Checkbox marker as written in `tasks.md`.
    pub fn marker(self) -> &'static str {
        match self {
            TaskStatus::Todo => "[ ]",
            TaskStatus::Done => "[X]",
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A local-to-remote identifier association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub feature: FeatureId,
    pub kind: EntityKind,
    /// Document filename, task identifier, or empty for the project.
    pub local_key: String,
    pub remote_id: String,
    pub updated_at: String,
}

/// Last time a document was successfully exchanged with the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub feature: FeatureId,
    pub filename: String,
    pub last_synced_at: String,
    /// sha256 of the content exchanged. Empty for time-only records.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_sha256: String,
}

/// One task extracted from a checklist document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    /// `T###`, or empty when the line carries no identifier.
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub parallel: bool,
    /// Owning user story (`US#`), or empty.
    pub story: String,
    /// Name of the enclosing `## Phase N: ...` section, or empty.
    #[serde(default)]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl TaskItem {
    /// Key under which this task is mapped in the store.
    ///
    /// Tasks without an identifier fall back to a title digest so they can
    /// still be upserted idempotently.
    pub fn local_key(&self) -> String {
        if !self.task_id.is_empty() {
            return self.task_id.clone();
        }
        let digest = Sha256::digest(self.title.as_bytes());
        format!("#{}", &hex::encode(digest)[..12])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn feature_id_accepts_ordinal_kebab() {
        assert_eq!(FeatureId::parse("001-test-feature").unwrap().as_str(), "001-test-feature");
        assert!(FeatureId::parse("42-x").is_ok());
    }

    #[test]
    fn feature_id_rejects_other_shapes() {
        for bad in ["test-feature", "001", "001-", "001-Test", "../001-x", "001-x/y", ""] {
            assert!(FeatureId::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn feature_id_from_dir_uses_trailing_segment() {
        let id = FeatureId::from_dir(Path::new("/repo/specs/003-auth-flow")).unwrap();
        assert_eq!(id.to_string(), "003-auth-flow");
    }

    #[test]
    fn timestamp_format_is_second_precision_utc() {
        let at = Utc.with_ymd_and_hms(2025, 10, 16, 1, 30, 0).unwrap();
        assert_eq!(format_timestamp(at), "2025-10-16T01:30:00Z");
    }

    #[test]
    fn concern_slot_names_round_trip() {
        for concern in Concern::ALL {
            assert_eq!(Concern::from_slot_name(concern.slot_name()), Some(concern));
        }
        assert_eq!(Concern::from_slot_name("bogus"), None);
    }

    #[test]
    fn anonymous_task_key_is_stable_digest() {
        let task = TaskItem {
            task_id: String::new(),
            title: "Implement core functionality".into(),
            status: TaskStatus::Todo,
            parallel: false,
            story: String::new(),
            phase: String::new(),
            file_path: None,
            depends_on: vec![],
        };
        let key = task.local_key();
        assert!(key.starts_with('#'));
        assert_eq!(key.len(), 13);
        assert_eq!(key, task.clone().local_key());
    }
}
