//! Task lifecycle over the store.
//!
//! `advance` is the only way a task changes status. Every write is a
//! compare-and-swap on the task version, so two racing transitions on the
//! same task cannot both succeed.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::core::{ChatroomId, Classification, HandoffRecord, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::queue::QueueAllocator;
use crate::role::RoleKey;
use crate::store::Store;
use crate::{alog, alog_debug};

#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn Store>,
    allocator: QueueAllocator,
}

impl TaskStore {
    pub fn new(store: Arc<dyn Store>, allocator: QueueAllocator) -> Self {
        Self { store, allocator }
    }

    /// Create a pending task from a user message.
    ///
    /// The task goes to the chatroom's entry-point role and gets the next
    /// queue position.
    ///
    /// # Errors
    ///
    /// - `Validation` for empty content
    /// - `InvalidClassification` for a `NewFeature` with blank fields
    /// - `ChatroomNotFound`, `ChatroomClosed`
    pub async fn create_task(
        &self,
        chatroom_id: ChatroomId,
        content: &str,
        classification: Option<Classification>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        if content.trim().is_empty() {
            return Err(Error::Validation("task content must not be empty".to_string()));
        }
        if let Some(c) = &classification {
            c.validate()?;
        }

        let chatroom = self
            .store
            .get_chatroom(chatroom_id)
            .await?
            .ok_or(Error::ChatroomNotFound(chatroom_id))?;
        if chatroom.is_closed() {
            return Err(Error::ChatroomClosed(chatroom_id));
        }

        let position = self.allocator.next_position(chatroom_id).await?;
        let mut task = Task::new(chatroom_id, content, position, chatroom.entry_role(), now);
        task.classification = classification;
        self.store.insert_task(task.clone()).await?;

        alog!(
            "task {} created in {} at position {} for {}",
            task.id.short(),
            chatroom_id.short(),
            position,
            task.assigned_role
                .as_ref()
                .map(RoleKey::as_str)
                .unwrap_or("nobody")
        );
        Ok(task)
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(Error::TaskNotFound(task_id))
    }

    /// All tasks of the chatroom by queue position.
    pub async fn list(&self, chatroom_id: ChatroomId) -> Result<Vec<Task>> {
        self.store.list_tasks(chatroom_id).await
    }

    /// The live queue: `queued` tasks by position.
    pub async fn queue(&self, chatroom_id: ChatroomId) -> Result<Vec<Task>> {
        self.with_status(chatroom_id, TaskStatus::Queued).await
    }

    pub async fn backlog(&self, chatroom_id: ChatroomId) -> Result<Vec<Task>> {
        self.with_status(chatroom_id, TaskStatus::Backlog).await
    }

    /// Lowest-positioned task waiting for `role` to pick it up.
    pub async fn next_for_role(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
    ) -> Result<Option<Task>> {
        Ok(self
            .list(chatroom_id)
            .await?
            .into_iter()
            .find(|t| {
                t.is_assigned_to(role)
                    && matches!(t.status, TaskStatus::Pending | TaskStatus::Queued)
            }))
    }

    /// Move a task to `target`, handing it from `from_role` to `to_role`.
    ///
    /// # Errors
    ///
    /// - `TaskNotFound`
    /// - `IllegalTransition` from a terminal status or for an edge not in
    ///   the transition table
    /// - `WrongActor` when `from_role` is not the assignee
    /// - `ClassificationRequired` when leaving `pending` unclassified
    /// - `ConcurrentModification` when another write landed first
    pub async fn advance(
        &self,
        task_id: TaskId,
        from_role: &RoleKey,
        to_role: &RoleKey,
        target: TaskStatus,
        summary: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut task = self.get(task_id).await?;

        if task.status.is_terminal() {
            return Err(Error::IllegalTransition {
                task_id,
                from: task.status,
                to: target,
            });
        }
        if !task.is_assigned_to(from_role) {
            return Err(Error::WrongActor {
                task_id,
                expected: task.assigned_role.clone(),
                actual: from_role.clone(),
            });
        }
        if !task.status.can_transition(target) {
            return Err(Error::IllegalTransition {
                task_id,
                from: task.status,
                to: target,
            });
        }
        if task.status == TaskStatus::Pending
            && target != TaskStatus::Cancelled
            && task.classification.is_none()
        {
            return Err(Error::ClassificationRequired(task_id));
        }

        let from_status = task.status;
        task.handoffs.push(HandoffRecord {
            from_role: from_role.clone(),
            to_role: to_role.clone(),
            from_status,
            to_status: target,
            summary: summary
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            at: now,
        });
        task.status = target;
        task.assigned_role = Some(to_role.clone());
        task.updated_at = now;

        let task = self.store.update_task(task).await?;
        alog_debug!(
            "task {}: {} -> {} ({} -> {})",
            task_id.short(),
            from_status,
            target,
            from_role,
            to_role
        );
        Ok(task)
    }

    /// Cancel a task from any non-terminal status.
    pub async fn cancel(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<Task> {
        let mut task = self.get(task_id).await?;
        if !task.status.can_transition(TaskStatus::Cancelled) {
            return Err(Error::IllegalTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Cancelled,
            });
        }
        let from = task.status;
        task.status = TaskStatus::Cancelled;
        task.updated_at = now;
        let task = self.store.update_task(task).await?;
        alog!("task {} cancelled (was {})", task_id.short(), from);
        Ok(task)
    }

    /// Classify a pending task. Only the assignee may classify.
    ///
    /// # Errors
    ///
    /// - `InvalidClassification` for a `NewFeature` with blank fields
    /// - `WrongActor` when `role` is not the assignee
    /// - `IllegalTransition` once the task has left `pending`
    pub async fn classify(
        &self,
        task_id: TaskId,
        role: &RoleKey,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        classification.validate()?;
        let mut task = self.get(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(Error::IllegalTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        if !task.is_assigned_to(role) {
            return Err(Error::WrongActor {
                task_id,
                expected: task.assigned_role.clone(),
                actual: role.clone(),
            });
        }
        alog_debug!("task {} classified as {} by {}", task_id.short(), classification, role);
        task.classification = Some(classification);
        task.updated_at = now;
        self.store.update_task(task).await
    }

    async fn with_status(&self, chatroom_id: ChatroomId, status: TaskStatus) -> Result<Vec<Task>> {
        Ok(self
            .list(chatroom_id)
            .await?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }
}
