//! Session-gated entry points.
//!
//! The `Coordinator` wires the components together and is what the chat
//! backend calls. Every operation checks the session first, takes `now`
//! from the clock, and reports what changed on the optional event channel.
//!
//! A lost write race comes back as `ConcurrentModification`. The core does
//! not retry it: the caller re-reads, rebuilds what it was sending (a
//! handoff summary, say) and may try once more, for instance with
//! `util::retry_once_on_conflict`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::clock::Clock;
use crate::config::Config;
use crate::core::{
    AgentStatus, Chatroom, ChatroomId, ChatroomStatus, Classification, Participant, Task, TaskId,
    TaskStatus, TeamSpec,
};
use crate::error::{Error, Result};
use crate::handoff::HandoffRouter;
use crate::liveness::LivenessTracker;
use crate::queue::QueueAllocator;
use crate::readiness::{evaluate, TeamReadiness};
use crate::restart::{
    MachineConfig, MachineControl, RestartCoordinator, RestartReport, RestartSettings,
};
use crate::role::RoleKey;
use crate::session::{AccessGrant, SessionAccess};
use crate::store::Store;
use crate::tasks::TaskStore;
use crate::{alog, alog_debug, alog_warn};

/// Events for the presentation layer.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// A new chatroom was opened.
    ChatroomStarted {
        chatroom_id: ChatroomId,
        team_name: Option<String>,
    },
    /// A chatroom was interrupted, resumed or completed.
    ChatroomStatusChanged {
        chatroom_id: ChatroomId,
        from: ChatroomStatus,
        to: ChatroomStatus,
    },
    /// A user message became a task.
    TaskCreated {
        chatroom_id: ChatroomId,
        task_id: TaskId,
        queue_position: u64,
    },
    /// A task changed status, assignee or classification.
    TaskChanged {
        chatroom_id: ChatroomId,
        task_id: TaskId,
        status: TaskStatus,
        assigned_role: Option<RoleKey>,
    },
    /// A participant moved to a new FSM status.
    ParticipantChanged {
        chatroom_id: ChatroomId,
        role: RoleKey,
        status: AgentStatus,
    },
    /// Lapsed leases noticed while reading readiness.
    RolesExpired {
        chatroom_id: ChatroomId,
        roles: Vec<RoleKey>,
    },
    /// An auto-restart pass ran.
    RestartIssued(RestartReport),
}

pub struct Coordinator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    sessions: Arc<dyn SessionAccess>,
    config: Config,
    liveness: LivenessTracker,
    tasks: TaskStore,
    router: HandoffRouter,
    restart: RestartCoordinator,
    events: Option<mpsc::Sender<CoordinatorEvent>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        sessions: Arc<dyn SessionAccess>,
        machine: Arc<dyn MachineControl>,
        config: Config,
    ) -> Self {
        let liveness = LivenessTracker::new(store.clone(), config.lease());
        let tasks = TaskStore::new(store.clone(), QueueAllocator::new(store.clone()));
        let router = HandoffRouter::new(
            store.clone(),
            tasks.clone(),
            liveness.clone(),
            config.user(),
            &config.review_gate,
        );
        let restart = RestartCoordinator::new(
            machine,
            liveness.clone(),
            RestartSettings {
                cooldown: config.restart_cooldown(),
                settle: config.restart_settle(),
                command_timeout: config.machine_command_timeout(),
                max_attempts: config.max_restart_attempts,
            },
        );
        Self {
            store,
            clock,
            sessions,
            config,
            liveness,
            tasks,
            router,
            restart,
            events: None,
        }
    }

    /// Report changes on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<CoordinatorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a chatroom owned by the session's user.
    pub async fn start_session(&self, token: &str, team: Option<TeamSpec>) -> Result<Chatroom> {
        let user = self.sessions.authenticate(token).await?;
        if let Some(spec) = &team {
            if let Some(entry) = &spec.entry_point {
                let key = RoleKey::new(entry);
                if !spec.roles.iter().any(|r| key.matches(r)) {
                    return Err(Error::Validation(format!(
                        "entry point {} is not one of the team roles",
                        entry
                    )));
                }
            }
        }

        let chatroom = Chatroom::new(team, self.clock.now()).with_owner(&user.id);
        self.store.insert_chatroom(chatroom.clone()).await?;
        alog!(
            "chatroom {} started by {} (team: {})",
            chatroom.id.short(),
            user.id,
            chatroom.team_name.as_deref().unwrap_or("none")
        );
        self.emit(CoordinatorEvent::ChatroomStarted {
            chatroom_id: chatroom.id,
            team_name: chatroom.team_name.clone(),
        });
        Ok(chatroom)
    }

    /// Turn a user message into a pending task for the entry-point role.
    pub async fn submit_message(
        &self,
        token: &str,
        chatroom_id: ChatroomId,
        content: &str,
        classification: Option<Classification>,
    ) -> Result<Task> {
        self.sessions.authorize(token, chatroom_id).await?;
        let task = self
            .tasks
            .create_task(chatroom_id, content, classification, self.clock.now())
            .await?;
        self.emit(CoordinatorEvent::TaskCreated {
            chatroom_id,
            task_id: task.id,
            queue_position: task.queue_position,
        });
        Ok(task)
    }

    pub async fn heartbeat(
        &self,
        token: &str,
        chatroom_id: ChatroomId,
        role: &str,
    ) -> Result<Participant> {
        self.sessions.authorize(token, chatroom_id).await?;
        let key = RoleKey::new(role);
        let before = self
            .store
            .get_participant(chatroom_id, &key)
            .await?
            .map(|p| p.status);
        let participant = self.liveness.heartbeat(chatroom_id, role, self.clock.now()).await?;
        if before != Some(participant.status) {
            self.participant_changed(&participant);
        }
        Ok(participant)
    }

    /// Explicit stop of a role.
    pub async fn leave(
        &self,
        token: &str,
        chatroom_id: ChatroomId,
        role: &str,
    ) -> Result<Participant> {
        self.sessions.authorize(token, chatroom_id).await?;
        let participant = self
            .liveness
            .mark_offline(chatroom_id, &RoleKey::new(role), self.clock.now())
            .await?;
        self.participant_changed(&participant);
        Ok(participant)
    }

    /// Manually clear a role that ran out of restart attempts.
    pub async fn reset_role(
        &self,
        token: &str,
        chatroom_id: ChatroomId,
        role: &str,
    ) -> Result<Participant> {
        self.sessions.authorize(token, chatroom_id).await?;
        let participant = self
            .liveness
            .reset(chatroom_id, &RoleKey::new(role), self.clock.now())
            .await?;
        self.participant_changed(&participant);
        Ok(participant)
    }

    pub async fn classify(
        &self,
        token: &str,
        task_id: TaskId,
        role: &str,
        classification: Classification,
    ) -> Result<Task> {
        self.authorize_task(token, task_id).await?;
        let task = self
            .router
            .classify(task_id, &RoleKey::new(role), classification, self.clock.now())
            .await?;
        self.task_changed(&task);
        Ok(task)
    }

    pub async fn claim(&self, token: &str, task_id: TaskId, role: &str) -> Result<Task> {
        self.authorize_task(token, task_id).await?;
        let role = RoleKey::new(role);
        let task = self.router.claim(task_id, &role, self.clock.now()).await?;
        self.task_changed(&task);
        self.role_changed(task.chatroom_id, &role).await;
        Ok(task)
    }

    pub async fn handoff(
        &self,
        token: &str,
        task_id: TaskId,
        from: &str,
        to: &str,
        summary: Option<&str>,
    ) -> Result<Task> {
        self.authorize_task(token, task_id).await?;
        let from = RoleKey::new(from);
        let to = RoleKey::new(to);
        let task = self
            .router
            .handoff(task_id, &from, &to, summary, self.clock.now())
            .await?;
        self.task_changed(&task);
        self.role_changed(task.chatroom_id, &from).await;
        Ok(task)
    }

    pub async fn defer(&self, token: &str, task_id: TaskId, role: &str) -> Result<Task> {
        self.authorize_task(token, task_id).await?;
        let task = self
            .router
            .defer(task_id, &RoleKey::new(role), self.clock.now())
            .await?;
        self.task_changed(&task);
        Ok(task)
    }

    pub async fn promote(&self, token: &str, task_id: TaskId, role: &str) -> Result<Task> {
        self.authorize_task(token, task_id).await?;
        let task = self
            .router
            .promote(task_id, &RoleKey::new(role), self.clock.now())
            .await?;
        self.task_changed(&task);
        Ok(task)
    }

    pub async fn cancel_task(&self, token: &str, task_id: TaskId) -> Result<Task> {
        self.authorize_task(token, task_id).await?;
        let task = self.router.cancel(task_id, self.clock.now()).await?;
        self.task_changed(&task);
        Ok(task)
    }

    /// Current team readiness.
    ///
    /// Alive roles whose lease has lapsed are marked `dead` after the
    /// snapshot is taken.
    pub async fn readiness(&self, token: &str, chatroom_id: ChatroomId) -> Result<TeamReadiness> {
        let AccessGrant { chatroom, .. } = self.sessions.authorize(token, chatroom_id).await?;
        let now = self.clock.now();
        let participants = self.store.list_participants(chatroom_id).await?;
        let readiness = evaluate(&chatroom, &participants, now);

        let expired = self.liveness.expire_stale(chatroom_id, now).await?;
        if !expired.is_empty() {
            self.emit(CoordinatorEvent::RolesExpired {
                chatroom_id,
                roles: expired,
            });
        }
        Ok(readiness)
    }

    /// Restart missing and expired roles with their last known machine
    /// configuration.
    ///
    /// `Ok(None)` when debounced, or when the chatroom has no team.
    pub async fn restart_offline(
        &self,
        token: &str,
        chatroom_id: ChatroomId,
        configs: &HashMap<RoleKey, MachineConfig>,
    ) -> Result<Option<RestartReport>> {
        let AccessGrant { chatroom, .. } = self.sessions.authorize(token, chatroom_id).await?;
        let now = self.clock.now();
        let participants = self.store.list_participants(chatroom_id).await?;
        let snapshot = match evaluate(&chatroom, &participants, now) {
            TeamReadiness::Team(snapshot) => snapshot,
            TeamReadiness::NoTeam => {
                alog_debug!("chatroom {} has no team to restart", chatroom_id.short());
                return Ok(None);
            }
        };

        let report = self.restart.restart_offline(&chatroom, &snapshot, configs, now).await;
        if let Some(report) = &report {
            self.emit(CoordinatorEvent::RestartIssued(report.clone()));
        }
        Ok(report)
    }

    /// Move the chatroom through its lifecycle.
    pub async fn set_chatroom_status(
        &self,
        token: &str,
        chatroom_id: ChatroomId,
        status: ChatroomStatus,
    ) -> Result<Chatroom> {
        self.sessions.authorize(token, chatroom_id).await?;
        let mut chatroom = self
            .store
            .get_chatroom(chatroom_id)
            .await?
            .ok_or(Error::ChatroomNotFound(chatroom_id))?;
        let from = chatroom.status;
        if !from.can_transition(status) {
            return Err(Error::IllegalChatroomTransition { from, to: status });
        }
        chatroom.status = status;
        chatroom.updated_at = self.clock.now();
        let chatroom = self.store.update_chatroom(chatroom).await?;

        alog!("chatroom {}: {} -> {}", chatroom_id.short(), from, status);
        self.emit(CoordinatorEvent::ChatroomStatusChanged {
            chatroom_id,
            from,
            to: status,
        });
        Ok(chatroom)
    }

    pub async fn tasks(&self, token: &str, chatroom_id: ChatroomId) -> Result<Vec<Task>> {
        self.sessions.authorize(token, chatroom_id).await?;
        self.tasks.list(chatroom_id).await
    }

    pub async fn queue(&self, token: &str, chatroom_id: ChatroomId) -> Result<Vec<Task>> {
        self.sessions.authorize(token, chatroom_id).await?;
        self.tasks.queue(chatroom_id).await
    }

    pub async fn backlog(&self, token: &str, chatroom_id: ChatroomId) -> Result<Vec<Task>> {
        self.sessions.authorize(token, chatroom_id).await?;
        self.tasks.backlog(chatroom_id).await
    }

    /// The task `role` should pick up next, if any.
    pub async fn next_task(
        &self,
        token: &str,
        chatroom_id: ChatroomId,
        role: &str,
    ) -> Result<Option<Task>> {
        self.sessions.authorize(token, chatroom_id).await?;
        self.tasks.next_for_role(chatroom_id, &RoleKey::new(role)).await
    }

    pub async fn participants(
        &self,
        token: &str,
        chatroom_id: ChatroomId,
    ) -> Result<Vec<Participant>> {
        self.sessions.authorize(token, chatroom_id).await?;
        self.store.list_participants(chatroom_id).await
    }

    /// Unknown tasks are refused like foreign ones; task ids of other users
    /// are never confirmed.
    async fn authorize_task(&self, token: &str, task_id: TaskId) -> Result<Task> {
        self.sessions.authenticate(token).await?;
        let task = match self.tasks.get(task_id).await {
            Ok(task) => task,
            Err(Error::TaskNotFound(_)) => {
                alog_debug!("access check for unknown task {}", task_id.short());
                return Err(Error::AccessDenied(format!("task {}", task_id)));
            }
            Err(e) => return Err(e),
        };
        self.sessions.authorize(token, task.chatroom_id).await?;
        Ok(task)
    }

    fn task_changed(&self, task: &Task) {
        self.emit(CoordinatorEvent::TaskChanged {
            chatroom_id: task.chatroom_id,
            task_id: task.id,
            status: task.status,
            assigned_role: task.assigned_role.clone(),
        });
    }

    fn participant_changed(&self, participant: &Participant) {
        self.emit(CoordinatorEvent::ParticipantChanged {
            chatroom_id: participant.chatroom_id,
            role: participant.role.clone(),
            status: participant.status,
        });
    }

    async fn role_changed(&self, chatroom_id: ChatroomId, role: &RoleKey) {
        if let Ok(Some(participant)) = self.store.get_participant(chatroom_id, role).await {
            self.participant_changed(&participant);
        }
    }

    /// Never waits on the consumer; a full or closed channel drops the event.
    fn emit(&self, event: CoordinatorEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                alog_warn!("event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                alog_debug!("event channel closed");
            }
        }
    }
}
