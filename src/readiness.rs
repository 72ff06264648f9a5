//! Point-in-time team readiness.
//!
//! `evaluate` is pure: it takes the chatroom, whatever participant records
//! the store returned and a timestamp, and never writes anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{AgentStatus, Chatroom, ChatroomId, LegacyStatus, Participant};
use crate::role::RoleKey;

/// Per-role view shown next to the readiness banner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub role: String,
    pub status: AgentStatus,
    pub legacy_status: LegacyStatus,
    pub ready_until: Option<DateTime<Utc>>,
    pub is_expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSnapshot {
    pub chatroom_id: ChatroomId,
    pub team_name: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    pub is_ready: bool,
    pub expected_roles: Vec<String>,
    pub present_roles: Vec<String>,
    /// Expected roles with no participant record at all.
    pub missing_roles: Vec<String>,
    /// Present roles whose lease lapsed or that are in a dead status.
    pub expired_roles: Vec<String>,
    pub participants: Vec<ParticipantInfo>,
}

impl ReadinessSnapshot {
    /// Missing and expired roles, deduplicated case-insensitively.
    pub fn offline_roles(&self) -> Vec<RoleKey> {
        let mut roles: Vec<RoleKey> = Vec::new();
        for name in self.missing_roles.iter().chain(&self.expired_roles) {
            let key = RoleKey::new(name);
            if !roles.contains(&key) {
                roles.push(key);
            }
        }
        roles
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TeamReadiness {
    /// The chatroom was started without a team; nothing to wait for.
    NoTeam,
    Team(ReadinessSnapshot),
}

impl TeamReadiness {
    pub fn snapshot(&self) -> Option<&ReadinessSnapshot> {
        match self {
            TeamReadiness::NoTeam => None,
            TeamReadiness::Team(snapshot) => Some(snapshot),
        }
    }

    /// `None` for a chatroom without a team; there is no team to be ready.
    pub fn is_ready(&self) -> Option<bool> {
        self.snapshot().map(|snapshot| snapshot.is_ready)
    }
}

/// Evaluate the readiness of `chatroom`'s team at `now`.
///
/// For every expected role the most recently updated participant record
/// with a matching role key counts. Role names are reported in the
/// spelling of the team definition.
pub fn evaluate(
    chatroom: &Chatroom,
    participants: &[Participant],
    now: DateTime<Utc>,
) -> TeamReadiness {
    let expected = match &chatroom.team_roles {
        Some(roles) => roles,
        None => return TeamReadiness::NoTeam,
    };

    let mut present_roles = Vec::new();
    let mut missing_roles = Vec::new();
    let mut expired_roles = Vec::new();
    let mut infos = Vec::new();

    for name in expected {
        let key = RoleKey::new(name);
        let latest = participants
            .iter()
            .filter(|p| p.chatroom_id == chatroom.id && p.role == key)
            .max_by_key(|p| p.updated_at);

        match latest {
            None => missing_roles.push(name.clone()),
            Some(p) => {
                let is_expired = p.is_expired(now);
                present_roles.push(name.clone());
                if is_expired {
                    expired_roles.push(name.clone());
                }
                infos.push(ParticipantInfo {
                    role: name.clone(),
                    status: p.status,
                    legacy_status: p.legacy_status(),
                    ready_until: p.ready_until,
                    is_expired,
                });
            }
        }
    }

    TeamReadiness::Team(ReadinessSnapshot {
        chatroom_id: chatroom.id,
        team_name: chatroom.team_name.clone(),
        evaluated_at: now,
        is_ready: missing_roles.is_empty() && expired_roles.is_empty(),
        expected_roles: expected.clone(),
        present_roles,
        missing_roles,
        expired_roles,
        participants: infos,
    })
}
