//! Task state machine.
//!
//! ```text
//! Pending ──start──▶ InProgress ──complete──▶ Completed
//!    │                   │ └──────fail──────▶ Failed
//!    └──────cancel───────┴──────cancel──────▶ Cancelled
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use hive_core::{ErrorKind, short_id, unix_timestamp};

use crate::events::{EventBus, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskError::Validation(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// The agent a task is bound to when it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignee {
    pub agent_id: String,
    pub agent_name: String,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid task: {0}")]
    Validation(String),

    #[error("Cannot {action} task {id} in state {from}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        action: &'static str,
    },
}

impl TaskError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) | Self::InvalidTransition { .. } => ErrorKind::Validation,
        }
    }
}

#[derive(Debug)]
pub struct TaskManager {
    tasks: RwLock<HashMap<String, Task>>,
    events: EventBus,
}

impl TaskManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub async fn create(&self, req: CreateTaskRequest) -> Result<Task, TaskError> {
        let title = req.title.trim();
        if title.is_empty() {
            return Err(TaskError::Validation("title is required".to_string()));
        }
        let task = Task {
            id: short_id(),
            title: title.to_string(),
            description: req.description,
            agent_id: req.agent_id.filter(|s| !s.is_empty()),
            agent_name: req.agent_name.filter(|s| !s.is_empty()),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: unix_timestamp(),
            started_at: None,
            completed_at: None,
        };
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        info!(task = %task.id, title = %task.title, agent = ?task.agent_name, "Task created");
        self.events.publish(EventKind::TaskCreated, &task);
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Task, TaskError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// Tasks in creation order, optionally filtered by agent and status.
    pub async fn list(&self, agent_id: Option<&str>, status: Option<TaskStatus>) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| agent_id.is_none_or(|a| t.agent_id.as_deref() == Some(a)))
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        drop(tasks);
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Pending → InProgress. The task must end up with an agent, either the
    /// one it was created for or `assignee`.
    pub async fn start(&self, id: &str, assignee: Option<Assignee>) -> Result<Task, TaskError> {
        let task = self
            .transition(id, "start", |task| {
                if task.status != TaskStatus::Pending {
                    return Err(invalid(task, "start"));
                }
                if let Some(a) = &assignee {
                    task.agent_id = Some(a.agent_id.clone());
                    task.agent_name = Some(a.agent_name.clone());
                }
                if task.agent_id.is_none() {
                    return Err(TaskError::Validation(format!(
                        "task {} has no assigned agent",
                        task.id
                    )));
                }
                task.status = TaskStatus::InProgress;
                task.started_at = Some(unix_timestamp());
                Ok(())
            })
            .await?;
        info!(task = %task.id, agent = ?task.agent_name, "Task started");
        self.events.publish(EventKind::TaskStarted, &task);
        Ok(task)
    }

    /// InProgress → Completed.
    pub async fn complete(&self, id: &str, result: Option<String>) -> Result<Task, TaskError> {
        let task = self
            .transition(id, "complete", |task| {
                if task.status != TaskStatus::InProgress {
                    return Err(invalid(task, "complete"));
                }
                task.status = TaskStatus::Completed;
                task.result = result.filter(|r| !r.is_empty());
                task.completed_at = Some(unix_timestamp());
                Ok(())
            })
            .await?;
        info!(task = %task.id, "Task completed");
        self.events.publish(EventKind::TaskCompleted, &task);
        Ok(task)
    }

    /// InProgress → Failed.
    pub async fn fail(&self, id: &str, error: impl Into<String>) -> Result<Task, TaskError> {
        let error = error.into();
        let task = self
            .transition(id, "fail", |task| {
                if task.status != TaskStatus::InProgress {
                    return Err(invalid(task, "fail"));
                }
                task.status = TaskStatus::Failed;
                task.error = Some(error);
                task.completed_at = Some(unix_timestamp());
                Ok(())
            })
            .await?;
        warn!(task = %task.id, error = ?task.error, "Task failed");
        self.events.publish(EventKind::TaskFailed, &task);
        Ok(task)
    }

    /// Pending|InProgress → Cancelled.
    pub async fn cancel(&self, id: &str, reason: Option<String>) -> Result<Task, TaskError> {
        let task = self
            .transition(id, "cancel", |task| {
                if task.status.is_terminal() {
                    return Err(invalid(task, "cancel"));
                }
                task.status = TaskStatus::Cancelled;
                task.error = reason.filter(|r| !r.is_empty());
                task.completed_at = Some(unix_timestamp());
                Ok(())
            })
            .await?;
        info!(task = %task.id, "Task cancelled");
        self.events.publish(EventKind::TaskCancelled, &task);
        Ok(task)
    }

    /// Cancel every unfinished task bound to an agent, e.g. when it is destroyed.
    pub async fn cancel_all_for_agent(&self, agent_id: &str, reason: &str) -> usize {
        let open: Vec<String> = self
            .list(Some(agent_id), None)
            .await
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        let mut cancelled = 0;
        for id in open {
            if self.cancel(&id, Some(reason.to_string())).await.is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub async fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Replace the task set with persisted records.
    pub async fn restore(&self, tasks: Vec<Task>) {
        let mut map = self.tasks.write().await;
        for task in tasks {
            map.insert(task.id.clone(), task);
        }
    }

    async fn transition<F>(&self, id: &str, action: &'static str, apply: F) -> Result<Task, TaskError>
    where
        F: FnOnce(&mut Task) -> Result<(), TaskError>,
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        // Work on a copy so a rejected transition leaves the record untouched.
        let mut next = task.clone();
        apply(&mut next).inspect_err(|e| {
            warn!(task = id, action, error = %e, "Task transition rejected");
        })?;
        *task = next.clone();
        Ok(next)
    }
}

fn invalid(task: &Task, action: &'static str) -> TaskError {
    TaskError::InvalidTransition {
        id: task.id.clone(),
        from: task.status,
        action,
    }
}
