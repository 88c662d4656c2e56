//! Ingest connection: state machine, reconnect policy and the actor
//! that owns the protocol client.

pub mod client;
pub mod manager;
pub mod messages;
pub mod policy;
pub mod state;

pub use client::{ClientFactory, NullClient, ProtocolClient, SharedClientFactory};
pub use manager::ConnectionHandle;
pub use messages::ConnectionMessage;
pub use policy::ConnectionTuning;
pub use state::{ConnectionState, StreamStatus};
