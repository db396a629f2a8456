//! Outbound tunnel from a device to a relay.
//!
//! The agent holds one WebSocket per relay and multiplexes logical streams
//! over it. Each stream is either a proxied HTTP request or a bridged
//! WebSocket, both served by local endpoints found through the resolver.
//!
//! - `codec`, `compression`: binary frame layout and payload compression
//! - `socket`: the physical WebSocket with its writer and heartbeat tasks
//! - `session`: handshake and stream dispatch for one physical socket
//! - `http_stream`, `ws_stream`: per-stream tasks
//! - `connection`, `agent`: reconnect, recycling, and summoned secondaries

pub mod agent;
pub mod body;
pub mod codec;
pub mod compression;
pub mod connection;
pub mod headers;
pub mod http_stream;
pub mod resolver;
pub mod session;
pub mod socket;
pub mod stream;
pub mod ws_stream;

pub use agent::Agent;
