//! Task data model.
//!
//! Tasks are the units of work handed from role to role. Each task tracks
//! its status, queue position, assignee, classification and the handoffs
//! it has been through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::chatroom::ChatroomId;
use crate::error::{Error, Result};
use crate::role::RoleKey;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created from a message, not yet picked up.
    #[default]
    Pending,
    /// An agent is working on it.
    InProgress,
    /// Waiting in the live queue for its assignee.
    Queued,
    /// Deferred; keeps its queue position.
    Backlog,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Check if a transition to `target` is allowed.
    ///
    /// - Pending -> InProgress | Cancelled
    /// - InProgress -> Queued | Backlog | Completed | Cancelled
    /// - Queued -> InProgress | Backlog | Cancelled
    /// - Backlog -> Queued | Cancelled
    /// - Completed, Cancelled -> nothing
    pub fn can_transition(self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Queued)
                | (InProgress, Backlog)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (Queued, InProgress)
                | (Queued, Backlog)
                | (Queued, Cancelled)
                | (Backlog, Queued)
                | (Backlog, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Backlog => write!(f, "backlog"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What kind of request a task is.
///
/// Only `NewFeature` carries metadata, and it is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Classification {
    Question,
    FollowUp,
    NewFeature {
        title: String,
        description: String,
        tech_specs: String,
    },
}

impl Classification {
    pub fn new_feature(title: &str, description: &str, tech_specs: &str) -> Self {
        Self::NewFeature {
            title: title.to_string(),
            description: description.to_string(),
            tech_specs: tech_specs.to_string(),
        }
    }

    pub fn is_new_feature(&self) -> bool {
        matches!(self, Classification::NewFeature { .. })
    }

    /// Reject a `NewFeature` with blank title, description or tech specs.
    pub fn validate(&self) -> Result<()> {
        if let Classification::NewFeature {
            title,
            description,
            tech_specs,
        } = self
        {
            let missing: Vec<&str> = [
                ("title", title),
                ("description", description),
                ("tech_specs", tech_specs),
            ]
            .into_iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(name, _)| name)
            .collect();

            if !missing.is_empty() {
                return Err(Error::InvalidClassification(format!(
                    "new_feature requires {}",
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Question => write!(f, "question"),
            Classification::FollowUp => write!(f, "follow_up"),
            Classification::NewFeature { .. } => write!(f, "new_feature"),
        }
    }
}

/// One status move of a task, with the roles involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub from_role: RoleKey,
    pub to_role: RoleKey,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub summary: Option<String>,
    pub at: DateTime<Utc>,
}

/// A unit of work in a chatroom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub chatroom_id: ChatroomId,
    pub content: String,
    pub status: TaskStatus,
    /// Unique and strictly increasing within the chatroom.
    pub queue_position: u64,
    pub assigned_role: Option<RoleKey>,
    pub classification: Option<Classification>,
    pub handoffs: Vec<HandoffRecord>,
    /// Bumped on every write; compare-and-swap key.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task at `queue_position`.
    pub fn new(
        chatroom_id: ChatroomId,
        content: &str,
        queue_position: u64,
        assigned_role: Option<RoleKey>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            chatroom_id,
            content: content.to_string(),
            status: TaskStatus::Pending,
            queue_position,
            assigned_role,
            classification: None,
            handoffs: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_assigned_to(&self, role: &RoleKey) -> bool {
        self.assigned_role.as_ref() == Some(role)
    }

    pub fn is_new_feature(&self) -> bool {
        self.classification
            .as_ref()
            .map(Classification::is_new_feature)
            .unwrap_or(false)
    }

    /// Roles this task has been handed off from, oldest first.
    pub fn handoff_path(&self) -> impl Iterator<Item = &RoleKey> {
        self.handoffs
            .iter()
            .filter(|h| h.from_role != h.to_role)
            .map(|h| &h.from_role)
    }
}
