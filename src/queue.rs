//! Per-chatroom queue position allocation.
//!
//! Positions come from the chatroom's `next_queue_position` counter, which
//! lives in the store. Each allocation is one conditional chatroom write,
//! so two core instances can never hand out the same position. Within one
//! instance, allocations for the same chatroom also queue on a local lock:
//! this keeps them from burning retries against each other, and is the
//! only serialization on stores without conditional writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::ChatroomId;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::{alog_debug, alog_warn};

/// Attempts before a contended allocation gives up.
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 16;

const RETRY_BACKOFF: Duration = Duration::from_millis(2);

#[derive(Clone)]
pub struct QueueAllocator {
    store: Arc<dyn Store>,
    locks: Arc<Mutex<HashMap<ChatroomId, Arc<Mutex<()>>>>>,
}

impl QueueAllocator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Issue the next queue position for `chatroom_id`.
    ///
    /// The value is strictly greater than every position issued before for
    /// the chatroom. Legacy chatrooms without a counter are seeded from
    /// `max(existing positions) + 1` and the counter is persisted.
    ///
    /// # Errors
    ///
    /// - `ChatroomNotFound` for an unknown chatroom
    /// - `ConcurrentModification` when other writers kept winning the
    ///   chatroom for `MAX_ALLOCATION_ATTEMPTS` tries
    pub async fn next_position(&self, chatroom_id: ChatroomId) -> Result<u64> {
        let lock = self.lock_for(chatroom_id).await;
        let _guard = lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_allocate(chatroom_id).await {
                Err(Error::ConcurrentModification(reason)) if attempt < MAX_ALLOCATION_ATTEMPTS => {
                    alog_debug!(
                        "queue allocation for {} lost race (attempt {}): {}",
                        chatroom_id.short(),
                        attempt,
                        reason
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(Error::ConcurrentModification(reason)) => {
                    alog_warn!(
                        "queue allocation for {} gave up after {} attempts",
                        chatroom_id.short(),
                        attempt
                    );
                    return Err(Error::ConcurrentModification(reason));
                }
                other => return other,
            }
        }
    }

    async fn try_allocate(&self, chatroom_id: ChatroomId) -> Result<u64> {
        let mut chatroom = self
            .store
            .get_chatroom(chatroom_id)
            .await?
            .ok_or(Error::ChatroomNotFound(chatroom_id))?;

        let position = match chatroom.next_queue_position {
            Some(next) => next,
            None => {
                let seed = self
                    .store
                    .max_queue_position(chatroom_id)
                    .await?
                    .map(|max| max + 1)
                    .unwrap_or(1);
                alog_debug!(
                    "seeding queue counter for legacy chatroom {} at {}",
                    chatroom_id.short(),
                    seed
                );
                seed
            }
        };

        chatroom.next_queue_position = Some(position + 1);
        self.store.update_chatroom(chatroom).await?;
        alog_debug!("chatroom={} position={}", chatroom_id.short(), position);
        Ok(position)
    }

    async fn lock_for(&self, chatroom_id: ChatroomId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(chatroom_id).or_default())
    }
}
