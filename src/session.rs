//! Session checks in front of every chatroom operation.
//!
//! Authentication itself lives outside the core. The core only asks a
//! `SessionAccess` implementation two questions: who holds this token, and
//! may they touch this chatroom.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::{Chatroom, ChatroomId};
use crate::store::Store;
use crate::{alog_debug, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub id: String,
    pub name: String,
}

impl AuthenticatedUser {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

/// A user cleared to act on a chatroom, with the chatroom as read.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub user: AuthenticatedUser,
    pub chatroom: Chatroom,
}

#[async_trait]
pub trait SessionAccess: Send + Sync {
    /// Resolve a session token.
    ///
    /// # Errors
    ///
    /// `AuthFailed` for an unknown or expired token.
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser>;

    /// Resolve a token and check it against a chatroom.
    ///
    /// # Errors
    ///
    /// `AuthFailed` for a bad token, `AccessDenied` when the user may not
    /// see the chatroom (including when it does not exist).
    async fn authorize(&self, token: &str, chatroom_id: ChatroomId) -> Result<AccessGrant>;
}

/// Token table held in memory.
///
/// A user may act on chatrooms they own. Chatrooms without an owner are
/// open to every authenticated user.
pub struct StaticSessions {
    store: Arc<dyn Store>,
    tokens: RwLock<HashMap<String, AuthenticatedUser>>,
}

impl StaticSessions {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub async fn grant(&self, token: &str, user: AuthenticatedUser) {
        alog_debug!("session granted for user {}", user.id);
        self.tokens.write().await.insert(token.to_string(), user);
    }

    pub async fn revoke(&self, token: &str) -> bool {
        self.tokens.write().await.remove(token).is_some()
    }
}

fn denied(chatroom_id: ChatroomId) -> Error {
    Error::AccessDenied(format!("chatroom {}", chatroom_id))
}

#[async_trait]
impl SessionAccess for StaticSessions {
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser> {
        self.tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(Error::AuthFailed)
    }

    async fn authorize(&self, token: &str, chatroom_id: ChatroomId) -> Result<AccessGrant> {
        let user = self.authenticate(token).await?;
        let chatroom = self
            .store
            .get_chatroom(chatroom_id)
            .await?
            .ok_or_else(|| denied(chatroom_id))?;

        if chatroom.owner_id.is_some() && !chatroom.is_owned_by(&user.id) {
            alog_debug!(
                "user {} denied access to chatroom {}",
                user.id,
                chatroom_id.short()
            );
            return Err(denied(chatroom_id));
        }
        Ok(AccessGrant { user, chatroom })
    }
}
