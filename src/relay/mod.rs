//! Relay service: WebSocket listener, per-connection peer pumps.
//!
//! The relay accepts persistent WebSocket connections, admits each one to
//! the [`Hub`](crate::hub::Hub) registry, and runs an inbound/outbound
//! loop pair per connection. It never inspects payloads beyond the
//! envelope framing — application traffic is forwarded byte-for-byte.
//!
//! # Modules
//!
//! - [`server`] - listener, handshake (origin check), graceful shutdown
//! - [`peer`] - the two per-connection pump loops

pub(crate) mod peer;
pub mod server;

pub use server::RelayServer;
