//! Porthop server engine.
//!
//! Wires the protocol core to real I/O: UDP sockets across the hopping
//! port range on one side, a virtual network interface on the other, with
//! a peer table and a dispatcher loop in between.

mod config;
mod error;
mod peer;
mod server;

pub use config::{CommonConfig, Config, MorphKind, ServerConfig};
pub use error::{Error, Result};
pub use peer::Peer;
pub use server::Server;
