use thiserror::Error;

use crate::core::{AgentStatus, ChatroomId, ChatroomStatus, TaskId, TaskStatus};
use crate::role::RoleKey;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Chatroom not found: {0}")]
    ChatroomNotFound(ChatroomId),

    #[error("Chatroom already exists: {0}")]
    ChatroomExists(ChatroomId),

    #[error("Chatroom {0} is completed and accepts no new work")]
    ChatroomClosed(ChatroomId),

    #[error("Invalid chatroom transition from {from} to {to}")]
    IllegalChatroomTransition {
        from: ChatroomStatus,
        to: ChatroomStatus,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    TaskExists(TaskId),

    #[error("Participant not found: {role} in chatroom {chatroom_id}")]
    ParticipantNotFound {
        chatroom_id: ChatroomId,
        role: RoleKey,
    },

    #[error("Invalid agent transition for {role}: {from} -> {to}")]
    InvalidTransition {
        role: RoleKey,
        from: AgentStatus,
        to: AgentStatus,
    },

    #[error("Illegal task transition for {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Role {actual} does not own task {task_id} (assigned: {})", assignee_label(.expected))]
    WrongActor {
        task_id: TaskId,
        expected: Option<RoleKey>,
        actual: RoleKey,
    },

    #[error("Task {0} must be classified before it can leave pending")]
    ClassificationRequired(TaskId),

    #[error("Invalid classification: {0}")]
    InvalidClassification(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("AUTH_FAILED: invalid or expired session")]
    AuthFailed,

    /// Names what was refused, e.g. `chatroom <id>`.
    #[error("ACCESS_DENIED: no access to {0}")]
    AccessDenied(String),

    #[error("Machine control error: {0}")]
    MachineControl(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Whether the caller may retry after re-reading current state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrentModification(_) | Error::Timeout(_))
    }

    /// Message suitable for showing inline to the human in the chatroom.
    ///
    /// Store conflicts are never exposed raw.
    pub fn user_message(&self) -> String {
        match self {
            Error::ConcurrentModification(_) => {
                "Someone else updated this at the same time, please retry.".to_string()
            }
            Error::Timeout(_) => "The operation timed out, please retry.".to_string(),
            Error::ClassificationRequired(_)
            | Error::InvalidClassification(_)
            | Error::PolicyViolation(_)
            | Error::WrongActor { .. }
            | Error::IllegalTransition { .. }
            | Error::InvalidTransition { .. }
            | Error::ChatroomClosed(_) => self.to_string(),
            Error::AuthFailed => "Your session has expired, please sign in again.".to_string(),
            Error::AccessDenied(_) => "You do not have access to this chatroom.".to_string(),
            _ => "Something went wrong, please retry.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn assignee_label(expected: &Option<RoleKey>) -> &str {
    expected.as_ref().map(RoleKey::as_str).unwrap_or("nobody")
}
