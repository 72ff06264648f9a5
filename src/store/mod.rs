//! Persistence boundary for the coordination core.
//!
//! The core never keeps authoritative state in process. Everything goes
//! through a `Store`, which must offer conditional writes on chatrooms and
//! tasks so that queue allocation and task transitions stay linearizable
//! per chatroom even with several core instances running.

mod memory;

pub use memory::{MemoryStore, StoreSnapshot};

use async_trait::async_trait;

use crate::core::{Chatroom, ChatroomId, Participant, Task, TaskId};
use crate::error::Result;
use crate::role::RoleKey;

#[async_trait]
pub trait Store: Send + Sync {
    /// Whether `update_chatroom` and `update_task` really compare versions.
    ///
    /// Stores that return `false` get their chatroom counters serialized
    /// by an in-process per-chatroom lock instead.
    fn atomic_updates(&self) -> bool {
        true
    }

    async fn insert_chatroom(&self, chatroom: Chatroom) -> Result<()>;

    async fn get_chatroom(&self, id: ChatroomId) -> Result<Option<Chatroom>>;

    /// Write `chatroom` if the stored version still equals
    /// `chatroom.version`. Returns the stored record with its new version.
    ///
    /// # Errors
    ///
    /// `ConcurrentModification` if another writer got there first.
    async fn update_chatroom(&self, chatroom: Chatroom) -> Result<Chatroom>;

    async fn get_participant(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
    ) -> Result<Option<Participant>>;

    async fn list_participants(&self, chatroom_id: ChatroomId) -> Result<Vec<Participant>>;

    /// Insert or replace the participant for its (chatroom, role).
    async fn put_participant(&self, participant: Participant) -> Result<()>;

    /// Insert a new task. Rejects a queue position already used in the
    /// chatroom.
    async fn insert_task(&self, task: Task) -> Result<()>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// All tasks of a chatroom ordered by queue position.
    async fn list_tasks(&self, chatroom_id: ChatroomId) -> Result<Vec<Task>>;

    /// Compare-and-swap on `task.version`, same contract as
    /// `update_chatroom`.
    async fn update_task(&self, task: Task) -> Result<Task>;

    /// Highest queue position used by any task of the chatroom.
    async fn max_queue_position(&self, chatroom_id: ChatroomId) -> Result<Option<u64>> {
        Ok(self
            .list_tasks(chatroom_id)
            .await?
            .iter()
            .map(|t| t.queue_position)
            .max())
    }
}
