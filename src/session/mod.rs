//! Session - the agent side of the control channel
//!
//! Dials the orchestrator, registers, then runs the event loop. A
//! dedicated reader task owns the read half of the control socket and
//! feeds decoded frames to the loop over a channel; the loop owns the
//! write half, the tunnel table, and all dispatch, so every write to the
//! control socket is serialized and frames reach the wire in emit order.

use crate::protocol::{
    Frame, FrameKind, ProtocolError, ReplyCode, TargetAddr, CONNECT_TIMEOUT, HEARTBEAT_INTERVAL,
    IDLE_TIMEOUT, WRITE_TIMEOUT,
};
use crate::tunnel::{dial_target, TunnelEvent, TunnelTable};
use crate::{Error, Result};
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Message from the control-socket reader task
enum ControlMessage {
    /// A decoded inbound frame
    Frame(Frame),
    /// The reader hit a transport-fatal condition
    Error(Error),
    /// The orchestrator closed the connection at a frame boundary
    Closed,
}

/// One registered control-channel session. Explicitly one-shot: when the
/// session ends, every tunnel socket and the control socket are closed,
/// and the caller decides whether to reconnect.
pub struct Session {
    stream: TcpStream,
    identity: String,
}

impl Session {
    /// Dial the orchestrator with a bounded timeout
    pub async fn connect(orchestrator: &str, identity: &str) -> Result<Self> {
        let timeout = Duration::from_secs(CONNECT_TIMEOUT);
        let stream = time::timeout(timeout, TcpStream::connect(orchestrator))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::Io)?;
        stream.set_nodelay(true)?;

        info!("Connected to orchestrator at {}", orchestrator);
        Ok(Self {
            stream,
            identity: identity.to_string(),
        })
    }

    /// Register and run the session until the orchestrator disconnects, a
    /// transport-fatal error occurs, or `shutdown` fires.
    ///
    /// A clean EOF from the orchestrator ends the session with `Ok`. On
    /// every exit path all tunnel sockets are closed before the control
    /// socket; no CLOSE frames are emitted during teardown because the
    /// control channel is already gone.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let (read_half, mut write_half) = self.stream.into_split();

        let (control_tx, control_rx) = mpsc::channel(64);
        let reader = tokio::spawn(read_control(read_half, control_tx));

        let (event_tx, event_rx) = mpsc::channel(256);
        let mut tunnels = TunnelTable::new(event_tx.clone());

        let result = run_loop(
            &mut write_half,
            &mut tunnels,
            &self.identity,
            control_rx,
            event_rx,
            event_tx,
            &mut shutdown,
        )
        .await;

        reader.abort();
        if !tunnels.is_empty() {
            debug!("Tearing down {} tunnel(s)", tunnels.len());
        }
        tunnels.shutdown();
        let _ = write_half.shutdown().await;

        result
    }
}

async fn run_loop(
    write_half: &mut OwnedWriteHalf,
    tunnels: &mut TunnelTable,
    identity: &str,
    mut control_rx: mpsc::Receiver<ControlMessage>,
    mut event_rx: mpsc::Receiver<TunnelEvent>,
    event_tx: mpsc::Sender<TunnelEvent>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<()> {
    send_frame(write_half, &Frame::register(identity)).await?;
    info!("Registered with orchestrator as {:?}", identity);

    let period = Duration::from_secs(HEARTBEAT_INTERVAL);
    let mut heartbeat = time::interval_at(time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = control_rx.recv() => match message {
                Some(ControlMessage::Frame(frame)) => {
                    dispatch_frame(frame, write_half, tunnels, &event_tx, &mut heartbeat).await?;
                }
                Some(ControlMessage::Error(err)) => return Err(err),
                Some(ControlMessage::Closed) | None => {
                    info!("Orchestrator closed the control channel");
                    return Ok(());
                }
            },

            event = event_rx.recv() => if let Some(event) = event {
                handle_tunnel_event(event, write_half, tunnels).await?;
            },

            _ = heartbeat.tick() => {
                trace!("Emitting heartbeat");
                send_frame(write_half, &Frame::heartbeat()).await?;
            }

            _ = shutdown.recv() => {
                info!("Shutdown requested, closing session");
                return Ok(());
            }
        }
    }
}

/// Dispatch one inbound frame from the orchestrator
async fn dispatch_frame(
    frame: Frame,
    write_half: &mut OwnedWriteHalf,
    tunnels: &mut TunnelTable,
    event_tx: &mpsc::Sender<TunnelEvent>,
    heartbeat: &mut time::Interval,
) -> Result<()> {
    match frame.kind {
        FrameKind::Connect => match TargetAddr::parse(&frame.payload) {
            Ok(addr) => match tunnels.begin_dial(frame.conn_id, addr.to_string()) {
                Ok(()) => {
                    debug!("CONNECT {} -> {}", frame.conn_id, addr);
                    let id = frame.conn_id;
                    let events = event_tx.clone();
                    tokio::spawn(async move {
                        let result = dial_target(&addr).await;
                        let _ = events.send(TunnelEvent::Dialed { id, result }).await;
                    });
                }
                Err(e) => warn!("Rejecting CONNECT: {}", e),
            },
            Err(e) => {
                warn!("Malformed CONNECT payload for {}: {}", frame.conn_id, e);
                let reply = Frame::connect_reply(frame.conn_id, ReplyCode::GeneralFailure);
                send_frame(write_half, &reply).await?;
            }
        },

        FrameKind::Data => match tunnels.write(frame.conn_id, &frame.payload).await {
            Ok(true) => {}
            Ok(false) => trace!(
                "Dropping {} bytes for unknown tunnel {}",
                frame.payload.len(),
                frame.conn_id
            ),
            Err(_) => {
                // The table already removed the entry and logged the cause
                send_frame(write_half, &Frame::close(frame.conn_id)).await?;
            }
        },

        FrameKind::Close => {
            // Teardown requested by the orchestrator: never echo CLOSE back
            if tunnels.close(frame.conn_id) {
                debug!("Tunnel {} closed by orchestrator", frame.conn_id);
            } else {
                trace!("CLOSE for unknown tunnel {}", frame.conn_id);
            }
        }

        FrameKind::Heartbeat => {
            send_frame(write_half, &Frame::heartbeat()).await?;
            heartbeat.reset();
        }

        FrameKind::Register | FrameKind::NewConn | FrameKind::ConnectReply => {
            warn!(
                "Unexpected {:?} frame from orchestrator (conn {}), ignoring",
                frame.kind, frame.conn_id
            );
        }
    }

    Ok(())
}

/// Handle a dial result or target-socket event
async fn handle_tunnel_event(
    event: TunnelEvent,
    write_half: &mut OwnedWriteHalf,
    tunnels: &mut TunnelTable,
) -> Result<()> {
    match event {
        TunnelEvent::Dialed { id, result } => match result {
            Ok(stream) => match tunnels.open(id, stream) {
                Ok(()) => {
                    let reply = Frame::connect_reply(id, ReplyCode::Succeeded);
                    send_frame(write_half, &reply).await?;
                }
                // The orchestrator abandoned the id while the dial was in
                // flight; dropping the socket closes it, and no reply is due.
                Err(_) => debug!("Tunnel {} closed before dial completed", id),
            },
            Err(err) => {
                if tunnels.close(id) {
                    let code = err.reply_code();
                    info!("Tunnel {} dial failed ({:?}): {}", id, code, err);
                    send_frame(write_half, &Frame::connect_reply(id, code)).await?;
                }
            }
        },

        TunnelEvent::Data { id, data } => {
            // Skip bytes that were in flight when the tunnel was closed
            if tunnels.contains(id) {
                send_frame(write_half, &Frame::data(id, data)).await?;
            }
        }

        TunnelEvent::Closed { id, error } => {
            if tunnels.close(id) {
                match error {
                    Some(e) => info!("Tunnel {} failed: {}", id, e),
                    None => debug!("Tunnel {} closed by target", id),
                }
                send_frame(write_half, &Frame::close(id)).await?;
            }
        }
    }

    Ok(())
}

/// Read and decode frames off the control socket, forwarding them to the
/// session loop. Ends with a single terminal message: `Closed` on a clean
/// EOF, `Error` on anything transport-fatal.
async fn read_control(mut read_half: OwnedReadHalf, tx: mpsc::Sender<ControlMessage>) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let idle = Duration::from_secs(IDLE_TIMEOUT);

    loop {
        match Frame::decode(&mut buf) {
            Ok(Some(frame)) => {
                if tx.send(ControlMessage::Frame(frame)).await.is_err() {
                    return;
                }
                continue;
            }
            Ok(None) => {}
            Err(ProtocolError::UnknownKind(kind)) => {
                warn!("Ignoring frame with unknown kind 0x{:02x}", kind);
                continue;
            }
            Err(e) => {
                let _ = tx.send(ControlMessage::Error(e.into())).await;
                return;
            }
        }

        match time::timeout(idle, read_half.read_buf(&mut buf)).await {
            Ok(Ok(0)) => {
                let message = if buf.is_empty() {
                    ControlMessage::Closed
                } else {
                    ControlMessage::Error(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "control channel closed mid-frame",
                    )))
                };
                let _ = tx.send(message).await;
                return;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                let _ = tx.send(ControlMessage::Error(e.into())).await;
                return;
            }
            Err(_) => {
                let _ = tx.send(ControlMessage::Error(Error::Timeout)).await;
                return;
            }
        }
    }
}

/// Write one frame to the control socket with a bounded timeout
async fn send_frame(write_half: &mut OwnedWriteHalf, frame: &Frame) -> Result<()> {
    let encoded = frame.encode()?;
    trace!(
        "Sending {:?} frame for {} ({} bytes)",
        frame.kind,
        frame.conn_id,
        encoded.len()
    );

    match time::timeout(
        Duration::from_secs(WRITE_TIMEOUT),
        write_half.write_all(&encoded),
    )
    .await
    {
        Ok(result) => result.map_err(Error::Io),
        Err(_) => Err(Error::Timeout),
    }
}
