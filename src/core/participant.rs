//! Participant presence records and the agent status FSM.
//!
//! One participant exists per role per chatroom. Liveness is a lease:
//! `ready_until` is pushed forward by heartbeats and expiry is computed
//! on read, never by a timer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::chatroom::ChatroomId;
use crate::role::RoleKey;

/// Agent status in the liveness FSM.
///
/// Edges:
/// - `offline -> ready` (join), `dead -> ready` (heartbeat resumes)
/// - `ready -> working` (task assignment), `working -> ready` (handoff away)
/// - `ready|working -> dead` (lease expiry observed on read)
/// - `dead -> restarting`, `restarting -> ready` or `dead_failed_revive`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Never joined, or explicitly stopped.
    #[default]
    Offline,
    /// Heartbeat lapsed; presumed crashed.
    Dead,
    /// Restart attempts exhausted. Terminal until reset by hand.
    DeadFailedRevive,
    /// Heartbeat active, awaiting work.
    Ready,
    /// Daemon-initiated recovery in progress.
    Restarting,
    /// Heartbeat active, processing a task.
    Working,
}

impl AgentStatus {
    /// Statuses that require a live heartbeat.
    pub fn is_alive(self) -> bool {
        matches!(self, AgentStatus::Ready | AgentStatus::Working)
    }

    pub fn is_dead(self) -> bool {
        matches!(
            self,
            AgentStatus::Offline | AgentStatus::Dead | AgentStatus::DeadFailedRevive
        )
    }

    /// Coarse status kept for older consumers.
    pub fn legacy(self) -> LegacyStatus {
        match self {
            AgentStatus::Working => LegacyStatus::Active,
            _ => LegacyStatus::Waiting,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Dead => write!(f, "dead"),
            AgentStatus::DeadFailedRevive => write!(f, "dead_failed_revive"),
            AgentStatus::Ready => write!(f, "ready"),
            AgentStatus::Restarting => write!(f, "restarting"),
            AgentStatus::Working => write!(f, "working"),
        }
    }
}

/// Two-state status from before the FSM existed. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyStatus {
    Active,
    Waiting,
}

/// A record of a status change with timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub at: DateTime<Utc>,
}

/// One role's presence within a chatroom.
/// Transitions kept per participant; older ones are dropped first.
pub const MAX_HISTORY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub chatroom_id: ChatroomId,
    pub role: RoleKey,
    /// Role name as the agent first announced it.
    pub display_name: String,
    pub status: AgentStatus,
    /// Lease horizon. `None` until the first heartbeat.
    pub ready_until: Option<DateTime<Utc>>,
    /// Consecutive revive attempts since the last successful heartbeat.
    pub restart_attempts: u32,
    /// Most recent transitions, at most `MAX_HISTORY`.
    pub history: Vec<StatusTransition>,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Participant {
    /// Create an offline participant record for `role`.
    pub fn new(chatroom_id: ChatroomId, role: &str, now: DateTime<Utc>) -> Self {
        Self {
            chatroom_id,
            role: RoleKey::new(role),
            display_name: role.trim().to_string(),
            status: AgentStatus::Offline,
            ready_until: None,
            restart_attempts: 0,
            history: Vec::new(),
            joined_at: now,
            updated_at: now,
        }
    }

    /// Whether the lease has lapsed at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ready_until {
            Some(until) => now > until,
            None => true,
        }
    }

    /// Dead statuses, or an alive status whose lease has lapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_dead() || self.lease_expired(now)
    }

    pub fn legacy_status(&self) -> LegacyStatus {
        self.status.legacy()
    }

    /// Record a transition and move to `to`.
    pub(crate) fn transition(&mut self, to: AgentStatus, now: DateTime<Utc>) {
        self.history.push(StatusTransition {
            from: self.status,
            to,
            at: now,
        });
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.status = to;
        self.updated_at = now;
    }

    /// Extend the lease to `until`; never moves it backwards.
    pub(crate) fn extend_lease(&mut self, until: DateTime<Utc>) {
        self.ready_until = Some(match self.ready_until {
            Some(current) if current > until => current,
            _ => until,
        });
    }
}
