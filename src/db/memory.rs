use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::models::{NewMessage, StoredMessage, User};
use crate::db::store::{MessageStore, UserStore};
use crate::error::DatabaseError;

/// In-process store. Nothing survives a restart.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    messages: Arc<RwLock<Vec<StoredMessage>>>,
    users: Arc<RwLock<HashMap<String, User>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn persist_message(&self, message: NewMessage) -> Result<StoredMessage, DatabaseError> {
        let stored = message.into_stored();
        self.messages.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(&self) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut messages = self.messages.read().await.clone();
        // Stable, so equal timestamps keep insertion order.
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_or_create_user(&self, username: &str) -> Result<User, DatabaseError> {
        let mut users = self.users.write().await;
        let user = users
            .entry(username.to_string())
            .or_insert_with(|| User::new(username.to_string()));
        Ok(user.clone())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        Ok(self.users.read().await.get(username).cloned())
    }
}
