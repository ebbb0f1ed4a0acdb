//! Persistence capabilities consumed by the ingest loop and the HTTP API.
//!
//! Implementations must be safe to call from many connections at once; the
//! hub and ingest loop make no assumption about their internal locking.

use async_trait::async_trait;

use crate::db::models::{NewMessage, StoredMessage, User};
use crate::error::DatabaseError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stores a message, assigning an id and timestamp only when absent.
    async fn persist_message(&self, message: NewMessage) -> Result<StoredMessage, DatabaseError>;

    /// All stored messages in non-decreasing timestamp order.
    async fn list_messages(&self) -> Result<Vec<StoredMessage>, DatabaseError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Returns the existing user for `username`, or creates one.
    async fn find_or_create_user(&self, username: &str) -> Result<User, DatabaseError>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError>;
}
