//! Reverse TCP tunnel over WebSocket
//!
//! Agents behind NAT dial out to a central tunnel server and park there;
//! the server lends those channels to callers that want to reach targets
//! only the agents can see. A separate, framing-agnostic mux client drives
//! request/response traffic over any single full-duplex connection.

pub mod agent;
pub mod cli;
pub mod client;
pub mod error;
pub mod message;
pub mod mux;
pub mod pump;
pub mod server;
pub mod session;
pub mod version;

// Re-export commonly used items
pub use crate::agent::Agent;
pub use crate::cli::CLI;
pub use crate::client::Client;
pub use crate::error::{Error, MuxError};
pub use crate::mux::{MuxClient, MuxConn, MuxMessage};
pub use crate::server::TunnelServer;
pub use crate::session::Session;
pub use crate::version::VERSION;
