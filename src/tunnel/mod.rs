//! Tunnel layer - outbound target connections
//!
//! Provides:
//! - Target dialing with error classification
//! - The tunnel table owning all live target sockets
//! - Per-tunnel reader tasks feeding the session loop

mod dial;
mod table;

pub use dial::{dial_target, DialError};
pub use table::{TunnelEvent, TunnelTable};

use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunnel {0} already exists")]
    DuplicateId(u32),

    #[error("Tunnel {0} not found")]
    NotFound(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maximum bytes read from a target socket per loop turn. Bounding the
/// read keeps one busy tunnel from starving the others and fits the chunk
/// in a single DATA frame.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Target dial timeout
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
