//! Frame encoding/decoding for the control channel
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Kind  |        Connection ID (4B)         |
//! +--------+--------+--------+--------+--------+
//! |         Payload Length (4B)       |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```
//!
//! All multi-byte fields are big-endian. Every frame is exactly
//! `FRAME_HEADER_SIZE + payload_len` bytes on the wire.

use super::{ProtocolError, ReplyCode};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum payload size (1 MiB). Guards against runaway allocations from a
/// corrupt or hostile length field; comfortably holds a full 64 KiB target
/// read in a single DATA frame.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Agent registration (agent -> orchestrator, conn id 0)
    Register = 0x01,
    /// New end-client connection (orchestrator internal, never expected here)
    NewConn = 0x02,
    /// Open a tunnel to the target in the payload
    Connect = 0x03,
    /// Dial outcome for a CONNECT (agent -> orchestrator)
    ConnectReply = 0x04,
    /// Tunnel payload bytes
    Data = 0x05,
    /// Tunnel teardown
    Close = 0x06,
    /// Keepalive (conn id 0)
    Heartbeat = 0x07,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Register),
            0x02 => Ok(FrameKind::NewConn),
            0x03 => Ok(FrameKind::Connect),
            0x04 => Ok(FrameKind::ConnectReply),
            0x05 => Ok(FrameKind::Data),
            0x06 => Ok(FrameKind::Close),
            0x07 => Ok(FrameKind::Heartbeat),
            _ => Err(ProtocolError::UnknownKind(value)),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Connection ID (0 for session-level frames)
    pub conn_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from parts
    pub fn new(kind: FrameKind, conn_id: u32, payload: Bytes) -> Self {
        Self {
            kind,
            conn_id,
            payload,
        }
    }

    /// Create a registration frame carrying the agent identity
    pub fn register(identity: &str) -> Self {
        Self::new(
            FrameKind::Register,
            0,
            Bytes::copy_from_slice(identity.as_bytes()),
        )
    }

    /// Create a connect-reply frame carrying the dial outcome
    pub fn connect_reply(conn_id: u32, code: ReplyCode) -> Self {
        Self::new(
            FrameKind::ConnectReply,
            conn_id,
            Bytes::copy_from_slice(&[code as u8]),
        )
    }

    /// Create a data frame
    pub fn data(conn_id: u32, payload: Bytes) -> Self {
        Self::new(FrameKind::Data, conn_id, payload)
    }

    /// Create a close frame
    pub fn close(conn_id: u32) -> Self {
        Self::new(FrameKind::Close, conn_id, Bytes::new())
    }

    /// Create a heartbeat frame
    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, 0, Bytes::new())
    }

    /// Encode frame to bytes. Fails only if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());

        buf.put_u8(self.kind as u8);
        buf.put_u32(self.conn_id);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);

        Ok(buf)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; the caller reads more bytes and retries. A complete frame
    /// with an unrecognized kind byte is consumed from the buffer before
    /// `UnknownKind` is returned, so the stream stays in sync and the
    /// caller may skip the frame and continue. A header announcing a
    /// payload above [`MAX_PAYLOAD_SIZE`] is unrecoverable.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        let kind_byte = buf[0];
        let conn_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let kind = FrameKind::try_from(kind_byte)?;

        Ok(Some(Self {
            kind,
            conn_id,
            payload,
        }))
    }
}
