use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::db::models::{NewMessage, StoredMessage, User};
use crate::db::store::{MessageStore, UserStore};
use crate::error::DatabaseError;

/// Postgres-backed message and user store.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
    query_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>, query_timeout: Duration) -> Self {
        Self { pool, query_timeout }
    }

    /// Connects, verifies the server answers and applies the embedded
    /// migrations. Any failure here is fatal for startup.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        query_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await?;

        info!("Connected to Postgres and applied migrations");
        Ok(Self::new(Arc::new(pool), query_timeout))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, DatabaseError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result.map_err(DatabaseError::from),
            Err(_) => Err(DatabaseError::Timeout(self.query_timeout)),
        }
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn persist_message(&self, message: NewMessage) -> Result<StoredMessage, DatabaseError> {
        let message = message.into_stored();

        self.bounded(
            sqlx::query_as::<_, StoredMessage>(
                r#"
                INSERT INTO messages (id, text, sender, timestamp)
                VALUES ($1, $2, $3, $4)
                RETURNING id, text, sender, timestamp
                "#,
            )
            .bind(&message.id)
            .bind(&message.text)
            .bind(&message.sender)
            .bind(message.timestamp)
            .fetch_one(self.pool.as_ref()),
        )
        .await
    }

    async fn list_messages(&self) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.bounded(
            sqlx::query_as::<_, StoredMessage>(
                "SELECT id, text, sender, timestamp FROM messages ORDER BY timestamp ASC",
            )
            .fetch_all(self.pool.as_ref()),
        )
        .await
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_or_create_user(&self, username: &str) -> Result<User, DatabaseError> {
        let candidate = User::new(username.to_string());

        // A concurrent insert of the same username loses the conflict and
        // falls through to the select below.
        self.bounded(
            sqlx::query(
                r#"
                INSERT INTO users (id, username, created_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (username) DO NOTHING
                "#,
            )
            .bind(candidate.id)
            .bind(&candidate.username)
            .bind(candidate.created_at)
            .execute(self.pool.as_ref()),
        )
        .await?;

        self.get_user_by_username(username)
            .await?
            .ok_or(DatabaseError::NotFound)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        self.bounded(
            sqlx::query_as::<_, User>(
                "SELECT id, username, created_at FROM users WHERE username = $1",
            )
            .bind(username)
            .fetch_optional(self.pool.as_ref()),
        )
        .await
    }
}
