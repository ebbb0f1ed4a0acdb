use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Fractional-second digits kept on message timestamps.
const TIMESTAMP_PRECISION: u16 = 6;

/// A chat message as decoded from an inbound frame, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(text: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            sender: sender.into(),
            timestamp: None,
        }
    }

    /// Fills in the server-assigned id and timestamp where the caller left
    /// them out. Supplied values pass through untouched, except that
    /// timestamps are kept to microseconds, the precision Postgres stores.
    pub fn into_stored(self) -> StoredMessage {
        StoredMessage {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            text: self.text,
            sender: self.sender,
            timestamp: self
                .timestamp
                .unwrap_or_else(Utc::now)
                .trunc_subsecs(TIMESTAMP_PRECISION),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StoredMessage {
    pub id: String,
    pub text: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            username,
            created_at: Utc::now(),
        }
    }
}
