//! In-process `Store` backed by hash maps behind a tokio `RwLock`.
//!
//! Also used as the reference implementation in tests. The whole store can
//! be written to and restored from a JSON snapshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::Store;
use crate::core::{Chatroom, ChatroomId, Participant, Task, TaskId};
use crate::error::{Error, Result};
use crate::role::RoleKey;
use crate::util::blocking;
use crate::{alog_debug, alog_trace};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    chatrooms: HashMap<ChatroomId, Chatroom>,
    participants: HashMap<ChatroomId, HashMap<RoleKey, Participant>>,
    tasks: HashMap<TaskId, Task>,
}

/// Serialized form of a `MemoryStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    tables: Tables,
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    atomic: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            atomic: true,
        }
    }

    /// A store that skips version checks (last write wins), standing in for
    /// backends without conditional updates.
    pub fn without_atomic_updates() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            atomic: false,
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            version: SNAPSHOT_VERSION,
            tables: self.tables.read().await.clone(),
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            tables: RwLock::new(snapshot.tables),
            atomic: true,
        }
    }

    /// Write the store to `path` as pretty JSON.
    ///
    /// The previous file is kept as `.json.bak`; the new one is written to a
    /// temp file and renamed into place.
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot().await;
        let contents = serde_json::to_string_pretty(&snapshot)?;
        let path: PathBuf = path.to_path_buf();
        alog_debug!(
            "MemoryStore::save_snapshot chatrooms={} tasks={} path={}",
            snapshot.tables.chatrooms.len(),
            snapshot.tables.tasks.len(),
            path.display()
        );

        blocking(move || {
            if let Some(dir) = path.parent() {
                if !dir.exists() {
                    fs::create_dir_all(dir)?;
                }
            }
            if path.exists() {
                fs::copy(&path, path.with_extension("json.bak"))?;
            }
            let temp_path = path.with_extension("json.tmp");
            fs::write(&temp_path, &contents)?;
            fs::rename(&temp_path, &path)?;
            Ok(())
        })
        .await
    }

    /// Restore a store from `path`; a missing file yields an empty store.
    pub async fn load_snapshot(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        blocking(move || {
            if !path.exists() {
                alog_debug!("Snapshot not found at {}, starting empty", path.display());
                return Ok(Self::new());
            }
            let snapshot: StoreSnapshot = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(Error::Store(format!(
                    "unsupported snapshot version {}",
                    snapshot.version
                )));
            }
            alog_debug!(
                "Snapshot loaded: chatrooms={} tasks={}",
                snapshot.tables.chatrooms.len(),
                snapshot.tables.tasks.len()
            );
            Ok(Self::from_snapshot(snapshot))
        })
        .await
    }

    fn check_version(&self, kind: &str, stored: u64, expected: u64) -> Result<()> {
        if self.atomic && stored != expected {
            return Err(Error::ConcurrentModification(format!(
                "{} version is {}, write expected {}",
                kind, stored, expected
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn atomic_updates(&self) -> bool {
        self.atomic
    }

    async fn insert_chatroom(&self, chatroom: Chatroom) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.chatrooms.contains_key(&chatroom.id) {
            return Err(Error::ChatroomExists(chatroom.id));
        }
        alog_trace!("insert chatroom {}", chatroom.id.short());
        tables.chatrooms.insert(chatroom.id, chatroom);
        Ok(())
    }

    async fn get_chatroom(&self, id: ChatroomId) -> Result<Option<Chatroom>> {
        Ok(self.tables.read().await.chatrooms.get(&id).cloned())
    }

    async fn update_chatroom(&self, mut chatroom: Chatroom) -> Result<Chatroom> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .chatrooms
            .get(&chatroom.id)
            .ok_or(Error::ChatroomNotFound(chatroom.id))?;
        self.check_version("chatroom", stored.version, chatroom.version)?;

        chatroom.version = stored.version + 1;
        alog_trace!(
            "update chatroom {} -> v{}",
            chatroom.id.short(),
            chatroom.version
        );
        tables.chatrooms.insert(chatroom.id, chatroom.clone());
        Ok(chatroom)
    }

    async fn get_participant(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
    ) -> Result<Option<Participant>> {
        Ok(self
            .tables
            .read()
            .await
            .participants
            .get(&chatroom_id)
            .and_then(|roles| roles.get(role))
            .cloned())
    }

    async fn list_participants(&self, chatroom_id: ChatroomId) -> Result<Vec<Participant>> {
        let tables = self.tables.read().await;
        let mut participants: Vec<Participant> = tables
            .participants
            .get(&chatroom_id)
            .map(|roles| roles.values().cloned().collect())
            .unwrap_or_default();
        participants.sort_by(|a, b| a.role.cmp(&b.role));
        Ok(participants)
    }

    async fn put_participant(&self, participant: Participant) -> Result<()> {
        let mut tables = self.tables.write().await;
        alog_trace!(
            "put participant {} in {} status={}",
            participant.role,
            participant.chatroom_id.short(),
            participant.status
        );
        tables
            .participants
            .entry(participant.chatroom_id)
            .or_default()
            .insert(participant.role.clone(), participant);
        Ok(())
    }

    async fn insert_task(&self, task: Task) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(Error::TaskExists(task.id));
        }
        let duplicate = tables.tasks.values().any(|t| {
            t.chatroom_id == task.chatroom_id && t.queue_position == task.queue_position
        });
        if duplicate {
            return Err(Error::Store(format!(
                "queue position {} already used in chatroom {}",
                task.queue_position, task.chatroom_id
            )));
        }
        alog_trace!(
            "insert task {} at position {}",
            task.id.short(),
            task.queue_position
        );
        tables.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, chatroom_id: ChatroomId) -> Result<Vec<Task>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| t.chatroom_id == chatroom_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.queue_position);
        Ok(tasks)
    }

    async fn update_task(&self, mut task: Task) -> Result<Task> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .tasks
            .get(&task.id)
            .ok_or(Error::TaskNotFound(task.id))?;
        self.check_version("task", stored.version, task.version)?;

        task.version = stored.version + 1;
        alog_trace!("update task {} -> v{}", task.id.short(), task.version);
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }
}
