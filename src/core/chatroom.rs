//! Chatroom data model.
//!
//! A chatroom is one collaboration session between the human and a team
//! of agent roles. It owns the per-room queue counter and is never
//! hard-deleted; completion is a status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::role::{dedup_roles, RoleKey};

/// Unique identifier for a chatroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatroomId(pub Uuid);

impl ChatroomId {
    /// Create a new unique chatroom identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ChatroomId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatroomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChatroomId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle status of a chatroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatroomStatus {
    #[default]
    Active,
    Interrupted,
    /// Soft-archived; terminal.
    Completed,
}

impl ChatroomStatus {
    /// Valid moves: `active <-> interrupted`, `active|interrupted -> completed`.
    pub fn can_transition(self, target: ChatroomStatus) -> bool {
        matches!(
            (self, target),
            (ChatroomStatus::Active, ChatroomStatus::Interrupted)
                | (ChatroomStatus::Interrupted, ChatroomStatus::Active)
                | (ChatroomStatus::Active, ChatroomStatus::Completed)
                | (ChatroomStatus::Interrupted, ChatroomStatus::Completed)
        )
    }
}

impl std::fmt::Display for ChatroomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatroomStatus::Active => write!(f, "active"),
            ChatroomStatus::Interrupted => write!(f, "interrupted"),
            ChatroomStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Team layout a chatroom is started with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamSpec {
    pub team_id: Option<String>,
    pub team_name: Option<String>,
    /// Expected role names, in display order.
    pub roles: Vec<String>,
    /// Role that receives new user messages. Defaults to the first role.
    pub entry_point: Option<String>,
}

impl TeamSpec {
    pub fn new(team_name: &str, roles: &[&str]) -> Self {
        Self {
            team_id: None,
            team_name: Some(team_name.to_string()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            entry_point: None,
        }
    }

    pub fn with_entry_point(mut self, role: &str) -> Self {
        self.entry_point = Some(role.to_string());
        self
    }
}

/// A collaboration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chatroom {
    pub id: ChatroomId,
    pub status: ChatroomStatus,
    /// User the chatroom belongs to; sessions are checked against it.
    #[serde(default)]
    pub owner_id: Option<String>,
    pub team_id: Option<String>,
    pub team_name: Option<String>,
    /// Expected roles. `None` means the chatroom has no configured team.
    pub team_roles: Option<Vec<String>>,
    pub entry_point: Option<String>,
    /// Next queue position to hand out. `None` on chatrooms created before
    /// the counter existed; seeded from existing tasks on first use.
    pub next_queue_position: Option<u64>,
    /// Bumped on every write; conditional updates compare against it.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chatroom {
    /// Create an active chatroom with a fresh queue counter.
    pub fn new(team: Option<TeamSpec>, now: DateTime<Utc>) -> Self {
        let (team_id, team_name, team_roles, entry_point) = match team {
            Some(spec) => (
                spec.team_id,
                spec.team_name,
                Some(dedup_roles(&spec.roles)),
                spec.entry_point,
            ),
            None => (None, None, None, None),
        };
        Self {
            id: ChatroomId::new(),
            status: ChatroomStatus::Active,
            owner_id: None,
            team_id,
            team_name,
            team_roles,
            entry_point,
            next_queue_position: Some(1),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A chatroom as it looked before the queue counter was introduced.
    pub fn legacy(team: Option<TeamSpec>, now: DateTime<Utc>) -> Self {
        Self {
            next_queue_position: None,
            ..Self::new(team, now)
        }
    }

    pub fn with_owner(mut self, user_id: &str) -> Self {
        self.owner_id = Some(user_id.to_string());
        self
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id.as_deref() == Some(user_id)
    }

    pub fn has_team(&self) -> bool {
        self.team_roles.is_some()
    }

    /// Role that new user messages are assigned to.
    pub fn entry_role(&self) -> Option<RoleKey> {
        self.entry_point
            .as_deref()
            .map(RoleKey::new)
            .filter(|k| !k.is_empty())
            .or_else(|| {
                self.team_roles
                    .as_ref()
                    .and_then(|roles| roles.first())
                    .map(RoleKey::from)
            })
    }

    pub fn is_closed(&self) -> bool {
        self.status == ChatroomStatus::Completed
    }

    /// Whether `role` is part of the expected team (case-insensitive).
    pub fn expects_role(&self, role: &RoleKey) -> bool {
        self.team_roles
            .as_ref()
            .map(|roles| roles.iter().any(|r| role.matches(r)))
            .unwrap_or(false)
    }
}
