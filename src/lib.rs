//! A TURN relay engine in Rust
//!
//! This crate provides the request dispatch and allocation lifecycle of a
//! TURN (Traversal Using Relays around NAT) server following RFC 5766,
//! over UDP.

mod auth;
mod config;
mod error;
mod rate_limit;
mod transport;
mod turn;
mod types;

// Re-export primary types
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use turn::TurnServer;

// Re-export the types
pub use types::*;

// Re-export configuration types that users might need to construct ServerConfig
pub use config::{AuthConfig, LoggingConfig, TimeoutConfig, TransportConfig, TurnConfig};

// Collaborators injected into the relay
pub use auth::{AuthHandler, NonceAuthority, NonceValidity, StaticCredentials};
pub use transport::{PacketConn, RelayConnFactory, UdpRelayFactory, MAX_MESSAGE_SIZE};

// Relay state, for embedding and inspection
pub use turn::{Allocation, AllocationManager, ChannelData, Class, Method, TransactionId};

// Re-export rate limiter if needed externally
pub use rate_limit::{RateLimitStats, RateLimiter};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the logger for the TURN relay
pub fn init_logger() {
    env_logger::init();
}
