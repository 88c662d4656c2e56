//! Development ingest relay: framed TCP codec, client and server.

pub mod client;
pub mod codec;
pub mod server;

pub use client::RelayClient;
pub use codec::{HEADER_LEN, MAGIC, MAX_BODY_LEN, MessageKind, RelayCodec, RelayMessage};
pub use server::{RelayConfig, RelayCounters, RelayServer, RelaySnapshot};
