//! Agent liveness tracking.
//!
//! The `LivenessTracker` owns the agent status FSM. Heartbeats renew a
//! lease; expiry is only ever noticed when someone reads (`mark_dead`,
//! `expire_stale`), there is no timer. Every transition is appended to the
//! participant's history with its timestamp.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::core::{AgentStatus, ChatroomId, Participant};
use crate::error::{Error, Result};
use crate::role::RoleKey;
use crate::store::Store;
use crate::{alog, alog_debug};

#[derive(Clone)]
pub struct LivenessTracker {
    store: Arc<dyn Store>,
    lease: Duration,
}

impl LivenessTracker {
    pub fn new(store: Arc<dyn Store>, lease: Duration) -> Self {
        Self { store, lease }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Look up a participant by role.
    pub async fn participant(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
    ) -> Result<Participant> {
        self.store
            .get_participant(chatroom_id, role)
            .await?
            .ok_or_else(|| Error::ParticipantNotFound {
                chatroom_id,
                role: role.clone(),
            })
    }

    /// Renew the lease of `role`, creating the participant on first join.
    ///
    /// `offline`/`dead` become `ready`; a heartbeat from `restarting` is the
    /// restart succeeding. `ready_until` never moves backwards.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` for a role in `dead_failed_revive`; it has to be
    /// `reset` first.
    pub async fn heartbeat(
        &self,
        chatroom_id: ChatroomId,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        let key = RoleKey::new(role);
        if key.is_empty() {
            return Err(Error::Validation("role name must not be empty".to_string()));
        }
        let mut participant = match self.store.get_participant(chatroom_id, &key).await? {
            Some(p) => p,
            None => {
                alog!("{} joined chatroom {}", key, chatroom_id.short());
                Participant::new(chatroom_id, role, now)
            }
        };

        match participant.status {
            AgentStatus::DeadFailedRevive => {
                return Err(Error::InvalidTransition {
                    role: key,
                    from: AgentStatus::DeadFailedRevive,
                    to: AgentStatus::Ready,
                });
            }
            AgentStatus::Offline | AgentStatus::Dead | AgentStatus::Restarting => {
                alog_debug!(
                    "{} in {}: {} -> ready",
                    key,
                    chatroom_id.short(),
                    participant.status
                );
                participant.transition(AgentStatus::Ready, now);
            }
            AgentStatus::Ready | AgentStatus::Working => {}
        }

        participant.restart_attempts = 0;
        participant.extend_lease(now + self.lease);
        participant.updated_at = now;
        self.store.put_participant(participant.clone()).await?;
        Ok(participant)
    }

    /// `ready -> working`. The lease must still be valid at `now`.
    pub async fn mark_working(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        let mut participant = self.participant(chatroom_id, role).await?;
        if participant.status != AgentStatus::Ready || participant.lease_expired(now) {
            return Err(Error::InvalidTransition {
                role: role.clone(),
                from: participant.status,
                to: AgentStatus::Working,
            });
        }
        self.apply(&mut participant, AgentStatus::Working, now).await?;
        Ok(participant)
    }

    /// `working -> ready`, when the role hands its task away.
    pub async fn mark_ready(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        let mut participant = self.participant(chatroom_id, role).await?;
        if participant.status != AgentStatus::Working {
            return Err(Error::InvalidTransition {
                role: role.clone(),
                from: participant.status,
                to: AgentStatus::Ready,
            });
        }
        self.apply(&mut participant, AgentStatus::Ready, now).await?;
        Ok(participant)
    }

    /// `ready|working -> dead`, only once the lease has lapsed at `now`.
    pub async fn mark_dead(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        let mut participant = self.participant(chatroom_id, role).await?;
        if !participant.status.is_alive() || !participant.lease_expired(now) {
            return Err(Error::InvalidTransition {
                role: role.clone(),
                from: participant.status,
                to: AgentStatus::Dead,
            });
        }
        alog!(
            "{} in {} missed its lease (ready_until={:?})",
            role,
            chatroom_id.short(),
            participant.ready_until
        );
        self.apply(&mut participant, AgentStatus::Dead, now).await?;
        Ok(participant)
    }

    /// Count a revive attempt for a dead role.
    ///
    /// `dead -> restarting`; a role still `restarting` (the previous attempt
    /// never produced a heartbeat) counts another attempt. Once
    /// `max_attempts` consecutive attempts are used up the role moves to
    /// `dead_failed_revive` instead.
    pub async fn attempt_revive(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Participant> {
        let mut participant = self.participant(chatroom_id, role).await?;
        if !matches!(
            participant.status,
            AgentStatus::Dead | AgentStatus::Restarting
        ) {
            return Err(Error::InvalidTransition {
                role: role.clone(),
                from: participant.status,
                to: AgentStatus::Restarting,
            });
        }

        if participant.restart_attempts >= max_attempts {
            alog!(
                "{} in {} exhausted {} restart attempts",
                role,
                chatroom_id.short(),
                max_attempts
            );
            self.apply(&mut participant, AgentStatus::DeadFailedRevive, now)
                .await?;
            return Ok(participant);
        }

        participant.restart_attempts += 1;
        alog_debug!(
            "{} in {}: restart attempt {}/{}",
            role,
            chatroom_id.short(),
            participant.restart_attempts,
            max_attempts
        );
        self.apply(&mut participant, AgentStatus::Restarting, now)
            .await?;
        Ok(participant)
    }

    /// Explicit stop. Any status except `offline` may go offline.
    pub async fn mark_offline(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        let mut participant = self.participant(chatroom_id, role).await?;
        if participant.status == AgentStatus::Offline {
            return Err(Error::InvalidTransition {
                role: role.clone(),
                from: AgentStatus::Offline,
                to: AgentStatus::Offline,
            });
        }
        participant.ready_until = None;
        self.apply(&mut participant, AgentStatus::Offline, now).await?;
        Ok(participant)
    }

    /// Manual reset of a role given up on: `dead_failed_revive -> offline`.
    pub async fn reset(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
        now: DateTime<Utc>,
    ) -> Result<Participant> {
        let mut participant = self.participant(chatroom_id, role).await?;
        if participant.status != AgentStatus::DeadFailedRevive {
            return Err(Error::InvalidTransition {
                role: role.clone(),
                from: participant.status,
                to: AgentStatus::Offline,
            });
        }
        participant.restart_attempts = 0;
        participant.ready_until = None;
        self.apply(&mut participant, AgentStatus::Offline, now).await?;
        Ok(participant)
    }

    /// Mark every alive participant whose lease lapsed before `now` as dead.
    ///
    /// Returns the roles that changed.
    pub async fn expire_stale(
        &self,
        chatroom_id: ChatroomId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleKey>> {
        let mut expired = Vec::new();
        for mut participant in self.store.list_participants(chatroom_id).await? {
            if participant.status.is_alive() && participant.lease_expired(now) {
                self.apply(&mut participant, AgentStatus::Dead, now).await?;
                expired.push(participant.role);
            }
        }
        if !expired.is_empty() {
            alog!(
                "chatroom {}: expired leases for {:?}",
                chatroom_id.short(),
                expired.iter().map(RoleKey::as_str).collect::<Vec<_>>()
            );
        }
        Ok(expired)
    }

    async fn apply(
        &self,
        participant: &mut Participant,
        to: AgentStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        alog_debug!(
            "{} in {}: {} -> {}",
            participant.role,
            participant.chatroom_id.short(),
            participant.status,
            to
        );
        participant.transition(to, now);
        self.store.put_participant(participant.clone()).await
    }
}
