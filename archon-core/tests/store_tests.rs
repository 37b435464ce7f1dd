//! State Store round-trip, durability and layout tests.

use assert_fs::prelude::*;
use archon_core::{EntityKind, FeatureId, StateStore};
use predicates::prelude::predicate;
use rstest::rstest;

fn feature() -> FeatureId {
    FeatureId::parse("001-test-feature").expect("feature id")
}

// ---------------------------------------------------------------------------
// 1. Round-trip
// ---------------------------------------------------------------------------

#[rstest]
#[case(EntityKind::Project, "")]
#[case(EntityKind::Document, "spec.md")]
#[case(EntityKind::Document, "contracts/api.md")]
#[case(EntityKind::Task, "T001")]
#[case(EntityKind::Task, "#9f86d081884c")]
fn save_then_load_returns_remote_id(#[case] kind: EntityKind, #[case] key: &str) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = StateStore::new(home.path());

    store.save_mapping(&feature(), kind, key, "remote-42").expect("save");
    assert_eq!(store.load_mapping(&feature(), kind, key).expect("load"), "remote-42");
}

#[test]
fn untouched_key_loads_empty_not_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = StateStore::new(home.path());
    assert_eq!(store.load_mapping(&feature(), EntityKind::Task, "T999").expect("load"), "");
    assert_eq!(store.load_sync_meta(&feature(), "plan.md").expect("load"), "");
}

// ---------------------------------------------------------------------------
// 2. Timestamp durability
// ---------------------------------------------------------------------------

#[test]
fn colon_delimited_timestamp_round_trips_unchanged() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = StateStore::new(home.path());

    store
        .save_sync_meta(&feature(), "spec.md", "2025-10-16T01:30:00Z")
        .expect("save");
    assert_eq!(
        store.load_sync_meta(&feature(), "spec.md").expect("load"),
        "2025-10-16T01:30:00Z"
    );
}

#[test]
fn separator_heavy_values_survive() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = StateStore::new(home.path());
    let value = "a:b|c=d\te\nf \"quoted\" ünïcode";

    store.save_mapping(&feature(), EntityKind::Document, "odd:name.md", value).expect("save");
    assert_eq!(
        store.load_mapping(&feature(), EntityKind::Document, "odd:name.md").expect("load"),
        value
    );
}

// ---------------------------------------------------------------------------
// 3. Layout and atomicity
// ---------------------------------------------------------------------------

#[test]
fn records_live_under_feature_and_kind() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = StateStore::new(home.path());
    store.save_mapping(&feature(), EntityKind::Project, "", "proj-1").expect("save");

    home.child("mappings/001-test-feature/project/_.json")
        .assert(predicate::path::is_file())
        .assert(predicate::str::contains("\"remote_id\": \"proj-1\""));
}

#[test]
fn no_temp_files_left_after_many_writes() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = StateStore::new(home.path());
    for i in 0..20 {
        store
            .save_mapping(&feature(), EntityKind::Task, "T001", &format!("task-{i}"))
            .expect("save");
    }

    let dir = home.path().join("mappings/001-test-feature/task");
    let names: Vec<String> = std::fs::read_dir(&dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["T001.json".to_string()]);
}

#[test]
fn concurrent_writers_never_tear_a_record() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let root = home.path().to_path_buf();

    let handles: Vec<_> = (0..8)
        .map(|writer| {
            let root = root.clone();
            std::thread::spawn(move || {
                let store = StateStore::new(root);
                for i in 0..25 {
                    store
                        .save_mapping(&feature(), EntityKind::Project, "", &format!("w{writer}-{i}"))
                        .expect("save");
                    let seen = store
                        .load_mapping(&feature(), EntityKind::Project, "")
                        .expect("load never sees a partial record");
                    assert!(seen.starts_with('w'));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }
}

#[test]
fn list_mappings_decodes_escaped_keys() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = StateStore::new(home.path());
    store.save_mapping(&feature(), EntityKind::Document, "spec.md", "d1").expect("save");
    store.save_mapping(&feature(), EntityKind::Document, "contracts/api.md", "d2").expect("save");

    let keys: Vec<String> = store
        .list_mappings(&feature(), EntityKind::Document)
        .expect("list")
        .into_iter()
        .map(|r| r.local_key)
        .collect();
    assert_eq!(keys, vec!["contracts/api.md", "spec.md"]);
}

#[test]
fn long_non_ascii_filename_round_trips_and_lists() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = StateStore::new(home.path());
    let name = format!("contracts/{}.md", "認証フロー設計書".repeat(12));

    store.save_mapping(&feature(), EntityKind::Document, &name, "d-long").expect("save");
    store.save_sync_meta(&feature(), &name, "2025-10-16T01:30:00Z").expect("save meta");

    assert_eq!(store.load_mapping(&feature(), EntityKind::Document, &name).expect("load"), "d-long");
    assert_eq!(
        store.load_sync_meta(&feature(), &name).expect("load meta"),
        "2025-10-16T01:30:00Z"
    );
    let listed = store.list_mappings(&feature(), EntityKind::Document).expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].local_key, name);
}

#[test]
fn sync_record_keeps_content_hash_and_reads_time_only_records() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = StateStore::new(home.path());

    store.save_sync_meta(&feature(), "plan.md", "2025-10-16T01:30:00Z").expect("save");
    let record = store.load_sync_record(&feature(), "plan.md").expect("load").expect("record");
    assert_eq!(record.content_sha256, "");

    store
        .save_document_sync(&feature(), "plan.md", "2025-10-16T01:31:00Z", "ab12")
        .expect("save");
    let record = store.load_sync_record(&feature(), "plan.md").expect("load").expect("record");
    assert_eq!(record.last_synced_at, "2025-10-16T01:31:00Z");
    assert_eq!(record.content_sha256, "ab12");
    assert!(store.load_sync_record(&feature(), "spec.md").expect("load").is_none());
}
