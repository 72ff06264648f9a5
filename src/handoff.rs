//! Routing work between roles.
//!
//! The `HandoffRouter` sits on top of the task store and the liveness
//! tracker. It decides which task status a handoff lands in, enforces the
//! review gate for new features, and keeps the agent FSM in step with the
//! task: claiming makes a role `working`, handing off returns it to
//! `ready`.
//!
//! ## Review gate
//!
//! A `new_feature` task may only reach the user after the reviewer has
//! handed it on following the author's last handoff. Questions and
//! follow-ups are not gated.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::ReviewGate;
use crate::core::{AgentStatus, Classification, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::liveness::LivenessTracker;
use crate::role::RoleKey;
use crate::store::Store;
use crate::tasks::TaskStore;
use crate::{alog, alog_warn};

#[derive(Clone)]
pub struct HandoffRouter {
    store: Arc<dyn Store>,
    tasks: TaskStore,
    liveness: LivenessTracker,
    user: RoleKey,
    author: RoleKey,
    reviewer: RoleKey,
}

impl HandoffRouter {
    pub fn new(
        store: Arc<dyn Store>,
        tasks: TaskStore,
        liveness: LivenessTracker,
        user: RoleKey,
        gate: &ReviewGate,
    ) -> Self {
        Self {
            store,
            tasks,
            liveness,
            user,
            author: gate.author(),
            reviewer: gate.reviewer(),
        }
    }

    pub fn user_role(&self) -> &RoleKey {
        &self.user
    }

    /// Classify a pending task on behalf of its assignee.
    pub async fn classify(
        &self,
        task_id: TaskId,
        role: &RoleKey,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        self.tasks.classify(task_id, role, classification, now).await
    }

    /// The assignee picks a task up: `pending|queued -> in_progress`, and
    /// the role becomes `working`.
    ///
    /// If the task write fails the role is put back to `ready`.
    pub async fn claim(&self, task_id: TaskId, role: &RoleKey, now: DateTime<Utc>) -> Result<Task> {
        let task = self.tasks.get(task_id).await?;
        if !task.status.can_transition(TaskStatus::InProgress) {
            return Err(Error::IllegalTransition {
                task_id,
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }
        if !task.is_assigned_to(role) {
            return Err(Error::WrongActor {
                task_id,
                expected: task.assigned_role.clone(),
                actual: role.clone(),
            });
        }
        if task.classification.is_none() {
            return Err(Error::ClassificationRequired(task_id));
        }

        self.liveness.mark_working(task.chatroom_id, role, now).await?;
        match self
            .tasks
            .advance(task_id, role, role, TaskStatus::InProgress, None, now)
            .await
        {
            Ok(task) => {
                alog!("{} claimed task {}", role, task_id.short());
                Ok(task)
            }
            Err(e) => {
                // A racing claim by the same role may have won; it owns the
                // working status then.
                let won_elsewhere = matches!(
                    self.tasks.get(task_id).await,
                    Ok(t) if t.status == TaskStatus::InProgress && t.is_assigned_to(role)
                );
                if !won_elsewhere {
                    if let Err(rollback) =
                        self.liveness.mark_ready(task.chatroom_id, role, now).await
                    {
                        alog_warn!("could not release {} after failed claim: {}", role, rollback);
                    }
                }
                Err(e)
            }
        }
    }

    /// Hand a task from `from` to `to`.
    ///
    /// Handing to the user role completes the task; any other role gets it
    /// `queued`. The outgoing role goes back to `ready`.
    ///
    /// # Errors
    ///
    /// - `Validation` for a self-handoff or a role outside the team
    /// - `ClassificationRequired` for an unclassified task
    /// - `PolicyViolation` when the review gate is not satisfied
    /// - anything `TaskStore::advance` returns
    pub async fn handoff(
        &self,
        task_id: TaskId,
        from: &RoleKey,
        to: &RoleKey,
        summary: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        if from == to {
            return Err(Error::Validation(format!("{} cannot hand a task to itself", from)));
        }

        let task = self.tasks.get(task_id).await?;
        let chatroom = self
            .store
            .get_chatroom(task.chatroom_id)
            .await?
            .ok_or(Error::ChatroomNotFound(task.chatroom_id))?;
        if *to != self.user && chatroom.has_team() && !chatroom.expects_role(to) {
            return Err(Error::Validation(format!("{} is not part of this team", to)));
        }
        if task.classification.is_none() {
            return Err(Error::ClassificationRequired(task_id));
        }
        self.check_review_gate(&task, from, to)?;

        let target = if *to == self.user {
            TaskStatus::Completed
        } else {
            TaskStatus::Queued
        };
        let task = self.tasks.advance(task_id, from, to, target, summary, now).await?;
        alog!("task {} handed {} -> {} ({})", task_id.short(), from, to, target);

        self.release(&task, from, now).await;
        Ok(task)
    }

    /// Park a task: `in_progress|queued -> backlog`.
    ///
    /// The user may defer on the assignee's behalf.
    pub async fn defer(&self, task_id: TaskId, role: &RoleKey, now: DateTime<Utc>) -> Result<Task> {
        let task = self.tasks.get(task_id).await?;
        let actor = self.acting_role(&task, role);
        let was_in_progress = task.status == TaskStatus::InProgress;

        let task = self
            .tasks
            .advance(task_id, &actor, &actor, TaskStatus::Backlog, None, now)
            .await?;
        alog!("task {} deferred to backlog by {}", task_id.short(), role);
        if was_in_progress {
            self.release(&task, &actor, now).await;
        }
        Ok(task)
    }

    /// Bring a backlog task back into the queue at its original position.
    pub async fn promote(
        &self,
        task_id: TaskId,
        role: &RoleKey,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let task = self.tasks.get(task_id).await?;
        let actor = self.acting_role(&task, role);
        let task = self
            .tasks
            .advance(task_id, &actor, &actor, TaskStatus::Queued, None, now)
            .await?;
        alog!(
            "task {} promoted back to queue at position {}",
            task_id.short(),
            task.queue_position
        );
        Ok(task)
    }

    /// Cancel a task and release its assignee if it was being worked on.
    pub async fn cancel(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<Task> {
        let before = self.tasks.get(task_id).await?;
        let task = self.tasks.cancel(task_id, now).await?;
        if before.status == TaskStatus::InProgress {
            if let Some(assignee) = &before.assigned_role {
                self.release(&task, assignee, now).await;
            }
        }
        Ok(task)
    }

    /// Check the review gate for handing `task` from `from` to `to`.
    pub fn check_review_gate(&self, task: &Task, from: &RoleKey, to: &RoleKey) -> Result<()> {
        if !task.is_new_feature() || *to != self.user {
            return Ok(());
        }
        if *from == self.author {
            return Err(Error::PolicyViolation(format!(
                "new feature work from {} must go to {} before reaching {}",
                self.author, self.reviewer, self.user
            )));
        }

        let last_authored = task
            .handoffs
            .iter()
            .rposition(|h| h.from_role == self.author && h.to_role != self.author);
        let Some(last_authored) = last_authored else {
            return Ok(());
        };
        let reviewed = *from == self.reviewer
            || task.handoffs[last_authored + 1..]
                .iter()
                .any(|h| h.from_role == self.reviewer && h.to_role != self.reviewer);
        if reviewed {
            Ok(())
        } else {
            Err(Error::PolicyViolation(format!(
                "new feature work must be reviewed by {} after the last {} handoff",
                self.reviewer, self.author
            )))
        }
    }

    fn acting_role(&self, task: &Task, role: &RoleKey) -> RoleKey {
        match &task.assigned_role {
            Some(assignee) if *role == self.user => assignee.clone(),
            _ => role.clone(),
        }
    }

    /// Return `role` to `ready` if it is still `working`.
    async fn release(&self, task: &Task, role: &RoleKey, now: DateTime<Utc>) {
        if *role == self.user {
            return;
        }
        match self.liveness.participant(task.chatroom_id, role).await {
            Ok(p) if p.status == AgentStatus::Working => {
                if let Err(e) = self.liveness.mark_ready(task.chatroom_id, role, now).await {
                    alog_warn!("could not return {} to ready: {}", role, e);
                }
            }
            Ok(_) => {}
            Err(e) => alog_warn!("no participant record for {}: {}", role, e),
        }
    }
}
