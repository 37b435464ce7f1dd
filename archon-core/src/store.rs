//! State Store — persistent (feature, kind, local key) → remote id mapping.
//!
//! # Storage layout
//!
//! ```text
//! <state_root>/mappings/<feature>/<kind>/<escaped local key>.json
//! ```
//!
//! One JSON document per record. Writes go through [`atomic_write`], so a
//! reader sees either the previous record or the new one, never a torn file.
//! Nothing is created until the first write.
//!
//! Loads never fail on a missing record: callers distinguish "not yet synced"
//! from "synced" purely by the emptiness of the returned string.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::error::{io_err, json_err, CoreError};
use crate::io::{atomic_write, is_key_segment, read_optional};
use crate::paths::{mapping_dir, mapping_path, mappings_root};
use crate::types::{timestamp_now, EntityKind, FeatureId, MappingRecord, SyncMetadata};

/// Handle on a state root. Cheap to clone; holds no open files.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // -----------------------------------------------------------------------
    // Mappings
    // -----------------------------------------------------------------------

    /// Upsert the remote id for `(feature, kind, local_key)`.
    pub fn save_mapping(
        &self,
        feature: &FeatureId,
        kind: EntityKind,
        local_key: &str,
        remote_id: &str,
    ) -> Result<(), CoreError> {
        let record = MappingRecord {
            feature: feature.clone(),
            kind,
            local_key: local_key.to_string(),
            remote_id: remote_id.to_string(),
            updated_at: timestamp_now(),
        };
        let path = mapping_path(&self.root, feature, kind, local_key);
        write_json(&path, &record)
    }

    /// Remote id for `(feature, kind, local_key)`, or `""` if never saved.
    pub fn load_mapping(
        &self,
        feature: &FeatureId,
        kind: EntityKind,
        local_key: &str,
    ) -> Result<String, CoreError> {
        let path = mapping_path(&self.root, feature, kind, local_key);
        Ok(read_json::<MappingRecord>(&path)?
            .map(|record| record.remote_id)
            .unwrap_or_default())
    }

    /// Every mapping of `kind` for `feature`, sorted by local key.
    ///
    /// `SyncMeta` entries are [`SyncMetadata`] records, not mappings, and are
    /// never listed here.
    pub fn list_mappings(
        &self,
        feature: &FeatureId,
        kind: EntityKind,
    ) -> Result<Vec<MappingRecord>, CoreError> {
        if kind == EntityKind::SyncMeta {
            return Ok(vec![]);
        }
        let dir = mapping_dir(&self.root, feature, kind);
        let mut records = Vec::new();
        for path in json_files(&dir)? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_key_segment(stem) {
                continue;
            }
            if let Some(record) = read_json::<MappingRecord>(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.local_key.cmp(&b.local_key));
        Ok(records)
    }

    /// Features that have at least one record, sorted.
    pub fn list_features(&self) -> Result<Vec<FeatureId>, CoreError> {
        let root = mappings_root(&self.root);
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(io_err(&root, err)),
        };
        let mut features: Vec<FeatureId> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| FeatureId::parse(&e.file_name().to_string_lossy()).ok())
            .collect();
        features.sort();
        Ok(features)
    }

    // -----------------------------------------------------------------------
    // Sync metadata
    // -----------------------------------------------------------------------

    /// Record the last successful sync time of a document. `timestamp` is
    /// stored verbatim.
    pub fn save_sync_meta(
        &self,
        feature: &FeatureId,
        filename: &str,
        timestamp: &str,
    ) -> Result<(), CoreError> {
        self.save_document_sync(feature, filename, timestamp, "")
    }

    /// Record a sync together with the sha256 of the content exchanged.
    pub fn save_document_sync(
        &self,
        feature: &FeatureId,
        filename: &str,
        timestamp: &str,
        content_sha256: &str,
    ) -> Result<(), CoreError> {
        let record = SyncMetadata {
            feature: feature.clone(),
            filename: filename.to_string(),
            last_synced_at: timestamp.to_string(),
            content_sha256: content_sha256.to_string(),
        };
        let path = mapping_path(&self.root, feature, EntityKind::SyncMeta, filename);
        write_json(&path, &record)
    }

    /// Last sync time of a document, or `""` if never synced.
    pub fn load_sync_meta(&self, feature: &FeatureId, filename: &str) -> Result<String, CoreError> {
        Ok(self
            .load_sync_record(feature, filename)?
            .map(|record| record.last_synced_at)
            .unwrap_or_default())
    }

    /// Full sync record of a document, if it was ever synced.
    pub fn load_sync_record(
        &self,
        feature: &FeatureId,
        filename: &str,
    ) -> Result<Option<SyncMetadata>, CoreError> {
        let path = mapping_path(&self.root, feature, EntityKind::SyncMeta, filename);
        read_json(&path)
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| json_err(path, e))?;
    bytes.push(b'\n');
    atomic_write(path, &bytes)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CoreError> {
    match read_optional(path)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| json_err(path, e)),
        None => Ok(None),
    }
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(io_err(dir, err)),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn feature() -> FeatureId {
        FeatureId::parse("001-test-feature").unwrap()
    }

    #[test]
    fn nothing_created_before_first_write() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path().join("state"));
        assert_eq!(store.load_mapping(&feature(), EntityKind::Project, "").unwrap(), "");
        assert!(!tmp.path().join("state").exists());
    }

    #[test]
    fn upsert_overwrites_previous_remote_id() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        store.save_mapping(&feature(), EntityKind::Task, "T001", "task-a").unwrap();
        store.save_mapping(&feature(), EntityKind::Task, "T001", "task-b").unwrap();
        assert_eq!(store.load_mapping(&feature(), EntityKind::Task, "T001").unwrap(), "task-b");
        assert_eq!(store.list_mappings(&feature(), EntityKind::Task).unwrap().len(), 1);
    }

    #[test]
    fn kinds_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        store.save_mapping(&feature(), EntityKind::Document, "spec.md", "doc-1").unwrap();
        assert_eq!(store.load_mapping(&feature(), EntityKind::Task, "spec.md").unwrap(), "");
    }

    #[test]
    fn list_features_ignores_foreign_directories() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        store.save_mapping(&feature(), EntityKind::Project, "", "p-1").unwrap();
        std::fs::create_dir_all(tmp.path().join("mappings").join("scratch")).unwrap();
        assert_eq!(store.list_features().unwrap(), vec![feature()]);
    }
}
