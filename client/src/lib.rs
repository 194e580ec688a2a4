//! Outpost tunnel client
//!
//! Registers a public endpoint with a tunnel broker over one WebSocket
//! control channel and relays each forwarded request to a local TCP service.

pub mod admin;
pub mod config;
pub mod dialer;
pub mod heartbeat;
pub mod manager;
pub mod relay;
pub mod session;
pub mod tunnel;

pub use admin::AdminClient;
pub use config::{ConfigFile, TunnelConfig};
pub use manager::{CloseHandle, SessionState, TunnelSessionManager};
pub use outpost_shared::protocol::Protocol;
pub use outpost_shared::{Error, Result};
pub use tunnel::{TunnelSnapshot, TunnelStatus};
