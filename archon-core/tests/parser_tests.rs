//! Task-list parser fidelity tests.

use archon_core::tasks::{parse_tasks, parse_tasks_file};
use archon_core::TaskStatus;

#[test]
fn four_line_checklist_yields_four_items() {
    let content = "\
- [ ] [T001] [US1] Setup test environment
- [ ] [T002] [P] [US1] Configure test data
- [X] [T003] [US1] Initialize test project
- [ ] [T004] Implement core functionality
";
    let tasks = parse_tasks(content);
    assert_eq!(tasks.len(), 4);

    let ids: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, vec!["T001", "T002", "T003", "T004"]);

    let statuses: Vec<TaskStatus> = tasks.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Todo, TaskStatus::Todo, TaskStatus::Done, TaskStatus::Todo]
    );

    let parallel: Vec<bool> = tasks.iter().map(|t| t.parallel).collect();
    assert_eq!(parallel, vec![false, true, false, false]);

    let stories: Vec<&str> = tasks.iter().map(|t| t.story.as_str()).collect();
    assert_eq!(stories, vec!["US1", "US1", "US1", ""]);

    assert_eq!(tasks[1].title, "Configure test data");
}

#[test]
fn missing_identifier_still_yields_item() {
    let tasks = parse_tasks("- [ ] Implement core functionality\n");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_id, "");
    assert_eq!(tasks[0].title, "Implement core functionality");
    assert!(!tasks[0].parallel);
    assert_eq!(tasks[0].story, "");
}

#[test]
fn headers_blank_lines_and_prose_are_skipped() {
    let content = "\
# Tasks: Test Feature

**Input**: design documents

## Phase 1: Setup (Shared Infrastructure)

- [ ] T001 Create initial structure in src/main.py

## Phase 3: User Story 1 - Parser (Priority: P1)
- [ ] T002 [P] [US1] Build parser in src/parser.py (depends on T001)
- [ ]
Checkpoint: parser works
";
    let tasks = parse_tasks(content);
    assert_eq!(tasks.len(), 2);

    assert_eq!(tasks[0].phase, "Setup (Shared Infrastructure)");
    assert_eq!(tasks[0].file_path.as_deref(), Some("src/main.py"));

    assert_eq!(tasks[1].phase, "User Story 1 - Parser (Priority: P1)");
    assert_eq!(tasks[1].story, "US1");
    assert!(tasks[1].parallel);
    assert_eq!(tasks[1].depends_on, vec!["T001"]);
    assert_eq!(tasks[1].title, "Build parser in src/parser.py");
}

#[test]
fn unicode_titles_are_kept_whole() {
    let tasks = parse_tasks("- [ ] [T005] Übersetze „Hilfe“ → 日本語 | a, b: c\n");
    assert_eq!(tasks[0].title, "Übersetze „Hilfe“ → 日本語 | a, b: c");
}

#[test]
fn invalid_utf8_line_does_not_hide_the_others() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let path = dir.path().join("tasks.md");
    let mut bytes = b"- [ ] [T001] First task\n- [ ] [T002] Broken ".to_vec();
    bytes.extend_from_slice(&[0xff, 0xfe, 0xc3]);
    bytes.extend_from_slice(b" title\n- [X] [T003] Third task\n");
    std::fs::write(&path, bytes).expect("write");

    let tasks = parse_tasks_file(&path).expect("parse");
    let ids: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, vec!["T001", "T002", "T003"]);
    assert_eq!(tasks[0].title, "First task");
    assert_eq!(tasks[2].status, TaskStatus::Done);
    assert!(tasks[1].title.starts_with("Broken "));
}
