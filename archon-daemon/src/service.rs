//! The external project-management service, as seen by the daemon.
//!
//! [`ArchonService`] is the only seam between request processing and the
//! network. [`HttpService`] talks to the Archon REST API; tests substitute an
//! in-memory fake.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use archon_core::{Settings, TaskItem, TaskStatus};

use crate::error::DaemonError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("service returned HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("could not decode service response: {0}")]
    Decode(String),
}

/// A task to create or update remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskUpsert {
    pub local_key: String,
    /// Known remote id, when the task was synced before.
    pub remote_id: Option<String>,
    pub item: TaskItem,
}

/// Completion state of one remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTaskStatus {
    pub remote_id: String,
    pub status: TaskStatus,
}

pub trait ArchonService: Send + Sync {
    /// Create the project, or update it when `project_id` is known. Returns
    /// the project's remote id.
    fn create_or_update_project(
        &self,
        project_id: Option<&str>,
        title: &str,
        description: &str,
    ) -> Result<String, ServiceError>;

    /// Create or update a document. Returns the document's remote id.
    fn push_document(
        &self,
        project_id: &str,
        document_id: Option<&str>,
        filename: &str,
        content: &str,
    ) -> Result<String, ServiceError>;

    /// Current content of a document.
    fn pull_document(&self, project_id: &str, document_id: &str) -> Result<String, ServiceError>;

    /// Create one task, or update it when its remote id is known. Returns
    /// the task's remote id.
    fn upsert_task(&self, project_id: &str, task: &TaskUpsert) -> Result<String, ServiceError>;

    fn pull_status(&self, project_id: &str) -> Result<Vec<RemoteTaskStatus>, ServiceError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// [`ArchonService`] over the Archon REST API.
pub struct HttpService {
    base_url: String,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct IdBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DocumentBody {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TaskBody {
    id: String,
    status: String,
}

impl HttpService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, DaemonError> {
        let url = settings.api_url().ok_or(DaemonError::NoEndpoint)?;
        Ok(Self::new(url, settings.request_timeout()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{path}", self.base_url)
    }

    fn send(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<ureq::Response, ServiceError> {
        let request = self.agent.request(method, &self.url(path));
        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        result.map_err(|err| match err {
            ureq::Error::Status(code, response) => ServiceError::Status {
                code,
                message: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(transport) => ServiceError::Transport(transport.to_string()),
        })
    }

    fn send_for_id(&self, method: &str, path: &str, body: Value) -> Result<String, ServiceError> {
        let response = self.send(method, path, Some(body))?;
        let body: IdBody = response
            .into_json()
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(body.id)
    }
}

impl ArchonService for HttpService {
    fn create_or_update_project(
        &self,
        project_id: Option<&str>,
        title: &str,
        description: &str,
    ) -> Result<String, ServiceError> {
        let body = json!({ "title": title, "description": description });
        match project_id {
            Some(id) => self.send_for_id("PUT", &format!("/projects/{id}"), body),
            None => self.send_for_id("POST", "/projects", body),
        }
    }

    fn push_document(
        &self,
        project_id: &str,
        document_id: Option<&str>,
        filename: &str,
        content: &str,
    ) -> Result<String, ServiceError> {
        let body = json!({ "title": filename, "content": content });
        match document_id {
            Some(id) => self.send_for_id("PUT", &format!("/projects/{project_id}/docs/{id}"), body),
            None => self.send_for_id("POST", &format!("/projects/{project_id}/docs"), body),
        }
    }

    fn pull_document(&self, project_id: &str, document_id: &str) -> Result<String, ServiceError> {
        let path = format!("/projects/{project_id}/docs/{document_id}");
        let response = self.send("GET", &path, None)?;
        let body: DocumentBody = response
            .into_json()
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(body.content)
    }

    fn upsert_task(&self, project_id: &str, task: &TaskUpsert) -> Result<String, ServiceError> {
        let body = json!({
            "project_id": project_id,
            "title": task.item.title,
            "status": remote_status(task.item.status),
            "feature": task.item.phase,
            "description": task_description(&task.item),
        });
        match &task.remote_id {
            Some(id) => self.send_for_id("PUT", &format!("/tasks/{id}"), body),
            None => self.send_for_id("POST", "/tasks", body),
        }
    }

    fn pull_status(&self, project_id: &str) -> Result<Vec<RemoteTaskStatus>, ServiceError> {
        let response = self.send("GET", &format!("/projects/{project_id}/tasks"), None)?;
        let tasks: Vec<TaskBody> = response
            .into_json()
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(tasks
            .into_iter()
            .map(|t| RemoteTaskStatus {
                remote_id: t.id,
                status: local_status(&t.status),
            })
            .collect())
    }
}

fn remote_status(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Done => "done",
        TaskStatus::Todo => "todo",
    }
}

/// Archon tracks `todo | doing | review | done`; only `done` closes a box.
fn local_status(remote: &str) -> TaskStatus {
    if remote.eq_ignore_ascii_case("done") {
        TaskStatus::Done
    } else {
        TaskStatus::Todo
    }
}

fn task_description(item: &TaskItem) -> String {
    let mut lines = Vec::new();
    if !item.task_id.is_empty() {
        lines.push(format!("Task: {}", item.task_id));
    }
    if !item.story.is_empty() {
        lines.push(format!("Story: {}", item.story));
    }
    if item.parallel {
        lines.push("Parallel: yes".to_string());
    }
    if let Some(path) = &item.file_path {
        lines.push(format!("File: {path}"));
    }
    if !item.depends_on.is_empty() {
        lines.push(format!("Depends on: {}", item.depends_on.join(", ")));
    }
    lines.join("\n")
}
