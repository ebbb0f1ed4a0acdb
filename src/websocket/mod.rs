//! Realtime broadcast hub.
//!
//! Each accepted websocket gets an `IngestSession` that reads, persists and
//! forwards messages. The `Hub` is the only owner of the connection
//! registry and performs all fan-out.

mod connection;
mod hub;
mod ingest;
mod server;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionId, ConnectionRecord, Outbound};
pub use hub::{BroadcastEnvelope, Hub, HubCommand, HubHandle};
pub use ingest::{ConnectionState, IngestSession};
pub use server::RealtimeServer;
