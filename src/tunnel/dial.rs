//! Outbound dialing of tunnel targets

use super::DIAL_TIMEOUT;
use crate::protocol::{ReplyCode, TargetAddr};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// Why a dial failed. Each variant classifies to a distinct reply code so
/// the orchestrator can tell its end client what went wrong.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Resolution of {host} failed: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("No addresses resolved for {0}")]
    NoAddresses(String),

    #[error("Connect to {target} timed out")]
    Timeout { target: SocketAddr },

    #[error("Connect to {target} failed: {source}")]
    Connect {
        target: SocketAddr,
        source: io::Error,
    },
}

impl DialError {
    /// The CONNECT_REPLY byte for this failure
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            DialError::Resolve { .. } | DialError::NoAddresses(_) => ReplyCode::HostUnreachable,
            DialError::Timeout { .. } => ReplyCode::HostUnreachable,
            DialError::Connect { source, .. } => ReplyCode::from_io_error(source),
        }
    }
}

/// Resolve (if needed) and dial a target with a bounded timeout.
///
/// Domain targets are resolved first and the first resolved address is
/// dialed; IP literals are dialed directly. No retries — a failed dial
/// terminates the CONNECT.
pub async fn dial_target(addr: &TargetAddr) -> Result<TcpStream, DialError> {
    let socket_addr = match addr {
        TargetAddr::Ipv4(ip, port) => SocketAddr::from((*ip, *port)),
        TargetAddr::Ipv6(ip, port) => SocketAddr::from((*ip, *port)),
        TargetAddr::Domain(host, port) => {
            let mut resolved =
                lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|source| DialError::Resolve {
                        host: host.clone(),
                        source,
                    })?;
            let socket_addr = resolved
                .next()
                .ok_or_else(|| DialError::NoAddresses(host.clone()))?;
            debug!("Resolved {} to {}", host, socket_addr.ip());
            socket_addr
        }
    };

    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(socket_addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
        Ok(Err(source)) => Err(DialError::Connect {
            target: socket_addr,
            source,
        }),
        Err(_) => Err(DialError::Timeout {
            target: socket_addr,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let addr = TargetAddr::Ipv4(Ipv4Addr::LOCALHOST, port);
        let stream = dial_target(&addr).await.unwrap();

        let (accepted, _) = listener.accept().await.unwrap();
        assert_eq!(
            accepted.peer_addr().unwrap(),
            stream.local_addr().unwrap()
        );
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to find a port with no listener
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let addr = TargetAddr::Ipv4(Ipv4Addr::LOCALHOST, port);
        let err = dial_target(&addr).await.unwrap_err();

        assert!(matches!(err, DialError::Connect { .. }));
        assert_eq!(err.reply_code(), ReplyCode::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_dial_resolution_failure() {
        // RFC 2606 reserves .invalid; resolution always fails
        let addr = TargetAddr::Domain("nonexistent.invalid".to_string(), 80);
        let err = dial_target(&addr).await.unwrap_err();

        assert_eq!(err.reply_code(), ReplyCode::HostUnreachable);
    }
}
