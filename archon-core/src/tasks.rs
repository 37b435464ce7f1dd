//! Task-list parser for `tasks.md` checklists.
//!
//! A task line carries, in this order: a checkbox, an optional identifier,
//! an optional `[P]` marker, an optional `[US#]` tag, then the title:
//!
//! ```text
//! ## Phase 1: Setup (Shared Infrastructure)
//! - [ ] [T001] [US1] Setup test environment
//! - [X] T002 [P] Build parser in src/parser.rs (depends on T001)
//! - [ ] Task without an identifier
//! ```
//!
//! Headers, prose and blank lines are skipped. A checklist line that cannot be
//! parsed is skipped too; one bad line never fails the whole document.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{io_err, CoreError};
use crate::types::{TaskItem, TaskStatus};

static TASK_RE: OnceLock<Regex> = OnceLock::new();
static PHASE_RE: OnceLock<Regex> = OnceLock::new();
static DEPENDS_RE: OnceLock<Regex> = OnceLock::new();
static FILE_RE: OnceLock<Regex> = OnceLock::new();
static TASK_ID_RE: OnceLock<Regex> = OnceLock::new();

fn task_re() -> &'static Regex {
    TASK_RE.get_or_init(|| {
        Regex::new(
            r"^\s*[-*]\s+\[(?P<mark>[^\]]?)\]\s*(?:\[?(?P<id>T\d+)\]?(?:\s+|$))?(?P<par>\[P\]\s*)?(?:\[(?P<story>US\d+)\]\s*)?(?P<title>.*?)\s*$",
        )
        .unwrap()
    })
}

fn phase_re() -> &'static Regex {
    PHASE_RE.get_or_init(|| Regex::new(r"^#{2,}\s*Phase\s+\d+\s*:\s*(?P<name>.+?)\s*$").unwrap())
}

fn depends_re() -> &'static Regex {
    DEPENDS_RE.get_or_init(|| Regex::new(r"\s*\(depends on (?P<ids>[^)]*)\)\s*$").unwrap())
}

fn file_re() -> &'static Regex {
    FILE_RE.get_or_init(|| Regex::new(r"\bin\s+(?P<path>[\w./-]*[./][\w./-]+)$").unwrap())
}

fn task_id_re() -> &'static Regex {
    TASK_ID_RE.get_or_init(|| Regex::new(r"T\d+").unwrap())
}

/// Name of a `## Phase N: <name>` header, or `None` for any other line.
pub fn parse_phase_header(line: &str) -> Option<String> {
    phase_re()
        .captures(line)
        .map(|caps| caps["name"].to_string())
}

/// Split a trailing `(depends on T001, T002)` clause off `title`.
///
/// Returns the referenced identifiers and the title without the clause.
pub fn parse_dependencies(title: &str) -> (Vec<String>, String) {
    let Some(caps) = depends_re().captures(title) else {
        return (vec![], title.to_string());
    };
    let deps = task_id_re()
        .find_iter(&caps["ids"])
        .map(|m| m.as_str().to_string())
        .collect();
    let start = caps.get(0).map(|m| m.start()).unwrap_or(title.len());
    (deps, title[..start].trim_end().to_string())
}

/// Parse one line into a task, with `phase` as the enclosing section name.
pub fn parse_task_line(line: &str, phase: &str) -> Option<TaskItem> {
    let caps = task_re().captures(line)?;
    let status = match &caps["mark"] {
        "X" | "x" => TaskStatus::Done,
        _ => TaskStatus::Todo,
    };

    let (depends_on, title) = parse_dependencies(&caps["title"]);
    if title.is_empty() {
        return None;
    }
    let file_path = file_re()
        .captures(&title)
        .map(|c| c["path"].trim_end_matches('.').to_string());

    Some(TaskItem {
        task_id: caps.name("id").map(|m| m.as_str().to_string()).unwrap_or_default(),
        title,
        status,
        parallel: caps.name("par").is_some(),
        story: caps.name("story").map(|m| m.as_str().to_string()).unwrap_or_default(),
        phase: phase.to_string(),
        file_path,
        depends_on,
    })
}

/// Parse every task line of a checklist document, in document order.
pub fn parse_tasks(content: &str) -> Vec<TaskItem> {
    let mut phase = String::new();
    let mut tasks = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(name) = parse_phase_header(line) {
            phase = name;
            continue;
        }
        match parse_task_line(line, &phase) {
            Some(task) => tasks.push(task),
            None if looks_like_checklist_item(line) => {
                tracing::debug!("skipping malformed task line {}: {line}", index + 1);
            }
            None => {}
        }
    }
    tasks
}

/// Read and parse `path`. Invalid UTF-8 is replaced, so one bad line only
/// spoils itself.
pub fn parse_tasks_file(path: &Path) -> Result<Vec<TaskItem>, CoreError> {
    let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
    Ok(parse_tasks(&String::from_utf8_lossy(&bytes)))
}

/// Rewrite the checkbox of every task whose identifier is in `updates`.
///
/// Every other byte of `content` (line endings included) is preserved.
/// Tasks without an identifier cannot be addressed and are left alone.
pub fn apply_status(content: &str, updates: &HashMap<String, TaskStatus>) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        let body = line.trim_end_matches(['\n', '\r']);
        let rewritten = task_re().captures(body).and_then(|caps| {
            let id = caps.name("id")?;
            let wanted = updates.get(id.as_str())?;
            let mark = caps.name("mark")?;
            let current = match mark.as_str() {
                "X" | "x" => TaskStatus::Done,
                _ => TaskStatus::Todo,
            };
            if current == *wanted {
                return None;
            }
            let replacement = match wanted {
                TaskStatus::Done => "X",
                TaskStatus::Todo => " ",
            };
            let mut line = line.to_string();
            line.replace_range(mark.range(), replacement);
            Some(line)
        });
        out.push_str(rewritten.as_deref().unwrap_or(line));
    }
    out
}

fn looks_like_checklist_item(line: &str) -> bool {
    let trimmed = line.trim_start();
    (trimmed.starts_with("- [") || trimmed.starts_with("* [")) && trimmed.len() > 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_header_extraction() {
        assert_eq!(
            parse_phase_header("## Phase 1: Setup (Shared Infrastructure)").as_deref(),
            Some("Setup (Shared Infrastructure)")
        );
        assert_eq!(parse_phase_header("## Notes"), None);
    }

    #[test]
    fn dependency_clause_is_stripped() {
        let (deps, cleaned) = parse_dependencies("Implement service (depends on T012, T013)");
        assert_eq!(deps, vec!["T012", "T013"]);
        assert_eq!(cleaned, "Implement service");
    }

    #[test]
    fn bare_identifier_and_file_path() {
        let task = parse_task_line("- [ ] T001 Create initial structure in src/main.py", "Setup")
            .expect("task");
        assert_eq!(task.task_id, "T001");
        assert_eq!(task.file_path.as_deref(), Some("src/main.py"));
        assert_eq!(task.phase, "Setup");
        assert_eq!(task.title, "Create initial structure in src/main.py");
    }

    #[test]
    fn lowercase_x_is_done() {
        let task = parse_task_line("- [x] [T009] Ship it", "").expect("task");
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[test]
    fn checkbox_without_title_is_skipped() {
        assert!(parse_task_line("- [ ] [T010]", "").is_none());
        assert_eq!(parse_tasks("- [ ]\n- [ ] T011 Real task\n").len(), 1);
    }

    #[test]
    fn prose_in_title_is_not_a_file_path() {
        let task = parse_task_line("- [ ] T002 Log in the user", "").expect("task");
        assert_eq!(task.file_path, None);
    }

    #[test]
    fn apply_status_only_touches_markers() {
        let content = "# Tasks\r\n- [ ] [T001] One\r\n- [X] [T002] Two\n- [ ] Three\n";
        let updates = HashMap::from([
            ("T001".to_string(), TaskStatus::Done),
            ("T002".to_string(), TaskStatus::Todo),
        ]);
        let updated = apply_status(content, &updates);
        assert_eq!(updated, "# Tasks\r\n- [X] [T001] One\r\n- [ ] [T002] Two\n- [ ] Three\n");
    }

    #[test]
    fn apply_status_without_changes_is_identity() {
        let content = "- [X] T001 Done already\n";
        let updates = HashMap::from([("T001".to_string(), TaskStatus::Done)]);
        assert_eq!(apply_status(content, &updates), content);
    }
}
