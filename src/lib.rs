//! # Backhaul
//!
//! The agent side of a reverse SOCKS-style tunnel. The agent dials *out* to
//! an orchestrator over a single TCP connection, registers itself, and then
//! opens outbound TCP connections to arbitrary targets on the
//! orchestrator's behalf, piping bytes between each target and the
//! orchestrator over a framed multiplexed control channel. The orchestrator
//! terminates SOCKS5 toward end clients; the agent never speaks SOCKS to
//! anyone and needs no inbound reachability.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   framed control channel    ┌──────────────┐
//! │ Orchestrator │ ◄═════════════════════════► │    Agent     │
//! │  (SOCKS5 to  │   REGISTER / CONNECT /      │ (this crate) │
//! │ end clients) │   DATA / CLOSE / HEARTBEAT  └──────┬───────┘
//! └──────────────┘                                    │ outbound TCP
//!                                              ┌──────┴───────┐
//!                                              │   Targets    │
//!                                              └──────────────┘
//! ```
//!
//! The control channel is deliberately unauthenticated cleartext; wrap it
//! in an external transport if confidentiality or integrity is required.

pub mod config;
pub mod protocol;
pub mod session;
pub mod tunnel;

pub use config::Config;
pub use session::Session;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity string announced at registration when none is configured
pub const DEFAULT_IDENTITY: &str = "agent";

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout")]
    Timeout,
}
