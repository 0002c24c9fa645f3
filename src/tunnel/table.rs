//! Tunnel table - per-connection state and lifecycle
//!
//! Owns every live target socket. No other component closes target
//! sockets: removal from the table aborts the tunnel's reader task and
//! drops its write half, which closes the socket exactly once.

use super::{DialError, TunnelError, READ_CHUNK_SIZE};
use crate::protocol::WRITE_TIMEOUT;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Event sent from tunnel tasks to the session loop
#[derive(Debug)]
pub enum TunnelEvent {
    /// A dial spawned for a CONNECT has resolved
    Dialed {
        id: u32,
        result: Result<TcpStream, DialError>,
    },
    /// Bytes read from a target socket
    Data { id: u32, data: Bytes },
    /// A target socket reached EOF (`error: None`) or failed
    Closed { id: u32, error: Option<io::Error> },
}

/// Per-connection state
struct Tunnel {
    /// Human-readable `host:port` label for logging
    target: String,
    state: TunnelState,
}

enum TunnelState {
    /// CONNECT received, dial in flight
    Dialing,
    /// Target socket established
    Open {
        writer: OwnedWriteHalf,
        reader: JoinHandle<()>,
    },
}

/// Mapping from connection id to tunnel state. At most one entry per id;
/// the orchestrator is the sole allocator of ids.
pub struct TunnelTable {
    entries: HashMap<u32, Tunnel>,
    events: mpsc::Sender<TunnelEvent>,
}

impl TunnelTable {
    /// Create an empty table whose tunnel tasks report on `events`
    pub fn new(events: mpsc::Sender<TunnelEvent>) -> Self {
        Self {
            entries: HashMap::new(),
            events,
        }
    }

    /// Number of tracked tunnels (dialing included)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` is tracked
    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Reserve an id for a dial in flight. Fails if the id is already
    /// tracked - the orchestrator never reuses a live id, so a duplicate
    /// is a protocol violation.
    pub fn begin_dial(&mut self, id: u32, target: String) -> Result<(), TunnelError> {
        if self.entries.contains_key(&id) {
            return Err(TunnelError::DuplicateId(id));
        }
        self.entries.insert(
            id,
            Tunnel {
                target,
                state: TunnelState::Dialing,
            },
        );
        Ok(())
    }

    /// Attach a freshly dialed socket to its reserved entry and start the
    /// reader task. Fails (dropping, and thereby closing, the socket) if
    /// the entry was removed while the dial was in flight.
    pub fn open(&mut self, id: u32, stream: TcpStream) -> Result<(), TunnelError> {
        let Some(tunnel) = self.entries.get_mut(&id) else {
            return Err(TunnelError::NotFound(id));
        };
        if matches!(tunnel.state, TunnelState::Open { .. }) {
            return Err(TunnelError::DuplicateId(id));
        }

        let (read_half, writer) = stream.into_split();
        let reader = tokio::spawn(pump_target(id, read_half, self.events.clone()));
        tunnel.state = TunnelState::Open { writer, reader };

        info!("Tunnel {} open to {}", id, tunnel.target);
        Ok(())
    }

    /// Write orchestrator bytes to a target socket.
    ///
    /// Returns `Ok(false)` when the id is unknown or still dialing (the
    /// bytes are dropped silently). On a failed or timed-out write the
    /// entry is removed and the error returned so the caller can notify
    /// the orchestrator.
    pub async fn write(&mut self, id: u32, data: &[u8]) -> Result<bool, TunnelError> {
        let Some(tunnel) = self.entries.get_mut(&id) else {
            return Ok(false);
        };
        let TunnelState::Open { writer, .. } = &mut tunnel.state else {
            trace!("Dropping {} bytes for tunnel {} still dialing", data.len(), id);
            return Ok(false);
        };

        let timeout = Duration::from_secs(WRITE_TIMEOUT);
        let err = match tokio::time::timeout(timeout, writer.write_all(data)).await {
            Ok(Ok(())) => return Ok(true),
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, "target write timed out"),
        };

        info!("Write to tunnel {} ({}) failed: {}", id, tunnel.target, err);
        self.remove(id);
        Err(TunnelError::Io(err))
    }

    /// Remove a tunnel and close its socket. Idempotent: returns whether
    /// an entry was actually removed, so the caller knows whether to emit
    /// CLOSE upstream.
    pub fn close(&mut self, id: u32) -> bool {
        self.remove(id).is_some()
    }

    /// Tear down every tunnel. Used on session shutdown, when the control
    /// channel is gone and no CLOSE frames can be emitted.
    pub fn shutdown(&mut self) {
        for (id, tunnel) in self.entries.drain() {
            if let TunnelState::Open { reader, .. } = &tunnel.state {
                reader.abort();
            }
            debug!("Closed tunnel {} to {}", id, tunnel.target);
        }
    }

    fn remove(&mut self, id: u32) -> Option<Tunnel> {
        let tunnel = self.entries.remove(&id)?;
        if let TunnelState::Open { reader, .. } = &tunnel.state {
            reader.abort();
        }
        debug!("Tunnel {} to {} removed", id, tunnel.target);
        Some(tunnel)
    }
}

/// Read bounded chunks from a target socket and forward them to the
/// session loop. The bounded channel applies backpressure and preserves
/// per-tunnel byte order.
async fn pump_target(id: u32, mut read_half: OwnedReadHalf, events: mpsc::Sender<TunnelEvent>) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(TunnelEvent::Closed { id, error: None }).await;
                break;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(TunnelEvent::Data { id, data }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = events
                    .send(TunnelEvent::Closed {
                        id,
                        error: Some(e),
                    })
                    .await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn open_pair(table: &mut TunnelTable, id: u32) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        table.begin_dial(id, addr.to_string()).unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        table.open(id, stream).unwrap();

        accepted
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (tx, _rx) = mpsc::channel(16);
        let mut table = TunnelTable::new(tx);

        table.begin_dial(7, "10.0.0.1:80".to_string()).unwrap();
        let err = table.begin_dial(7, "10.0.0.2:80".to_string()).unwrap_err();

        assert!(matches!(err, TunnelError::DuplicateId(7)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_open_without_reservation() {
        let (tx, _rx) = mpsc::channel(16);
        let mut table = TunnelTable::new(tx);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();

        let err = table.open(9, stream).unwrap_err();
        assert!(matches!(err, TunnelError::NotFound(9)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_write_to_unknown_is_dropped() {
        let (tx, _rx) = mpsc::channel(16);
        let mut table = TunnelTable::new(tx);

        assert!(!table.write(3, b"dropped").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_while_dialing_is_dropped() {
        let (tx, _rx) = mpsc::channel(16);
        let mut table = TunnelTable::new(tx);

        table.begin_dial(3, "10.0.0.1:80".to_string()).unwrap();
        assert!(!table.write(3, b"early").await.unwrap());
        assert!(table.contains(3));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tx, _rx) = mpsc::channel(16);
        let mut table = TunnelTable::new(tx);

        table.begin_dial(5, "10.0.0.1:80".to_string()).unwrap();
        assert!(table.close(5));
        assert!(!table.close(5));
    }

    #[tokio::test]
    async fn test_data_flows_both_ways() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut table = TunnelTable::new(tx);
        let mut target = open_pair(&mut table, 1).await;

        // Orchestrator -> target
        assert!(table.write(1, b"request").await.unwrap());
        let mut buf = [0u8; 7];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        // Target -> session loop
        target.write_all(b"response").await.unwrap();
        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            Some(TunnelEvent::Data { id, data }) => {
                assert_eq!(id, 1);
                assert_eq!(&data[..], b"response");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Target EOF
        drop(target);
        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            Some(TunnelEvent::Closed { id, error: None }) => assert_eq!(id, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_shuts_target_socket() {
        let (tx, _rx) = mpsc::channel(16);
        let mut table = TunnelTable::new(tx);
        let mut target = open_pair(&mut table, 2).await;

        assert!(table.close(2));

        // Removal closes the socket; the target observes EOF
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), target.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (tx, _rx) = mpsc::channel(16);
        let mut table = TunnelTable::new(tx);
        let mut first = open_pair(&mut table, 1).await;
        let mut second = open_pair(&mut table, 2).await;

        table.shutdown();
        assert!(table.is_empty());

        for target in [&mut first, &mut second] {
            let mut buf = [0u8; 1];
            let n = timeout(Duration::from_secs(5), target.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 0);
        }
    }
}
