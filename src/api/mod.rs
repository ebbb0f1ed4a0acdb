//! HTTP endpoints for message history and user lookup.

pub mod handlers;

pub use handlers::{create_user, list_messages, method_not_allowed, preflight};
