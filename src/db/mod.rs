//! Persistence for chat messages and users.
//!
//! The hub never talks to storage directly; the ingest loop and HTTP
//! handlers go through the `MessageStore` / `UserStore` capabilities.

pub mod memory;
pub mod models;
pub mod operations;
pub mod store;

pub use memory::MemoryStore;
pub use models::{NewMessage, StoredMessage, User};
pub use operations::PgStore;
pub use store::{MessageStore, UserStore};
