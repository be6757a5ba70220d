//! Wire messages exchanged over a server connection, and their framing.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! magic:u32 | version:u8 | length:u32 | crc32(body):u32 | body (bincode ReplMessage)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::change::ChangeRecord;
use crate::csn::{Csn, GroupId, ServerId, ServerState};
use crate::error::ReplError;
use crate::topology::{ServerRole, ServerStatus};

/// Frame magic ("DSRP").
pub const MAGIC: u32 = 0x4453_5250;

/// Protocol version carried in every frame and in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 13;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// First message on every connection, sent by both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Protocol version spoken by the sender.
    pub protocol_version: u8,
    /// Sender's server id.
    pub server_id: ServerId,
    /// Sender's group.
    pub group_id: GroupId,
    /// Sender's routing weight.
    pub weight: u32,
    /// Directory server or replication server.
    pub role: ServerRole,
    /// Domain this connection replicates.
    pub domain: String,
    /// How many change records the sender is willing to buffer.
    pub window_size: u32,
    /// Highest CSN per origin the sender already has.
    pub server_state: ServerState,
}

/// Acknowledgment of an assured change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    /// Acknowledged change.
    pub csn: Csn,
    /// Server that acknowledges.
    pub server_id: ServerId,
    /// Set on the ack returned to an originator whose write timed out.
    pub timed_out: bool,
    /// Servers that did not acknowledge in time.
    pub failed_servers: Vec<ServerId>,
    /// Set when the change was refused: the origin's last stored CSN, which
    /// the refused CSN does not exceed.
    pub rejected_after: Option<Csn>,
}

impl AckMessage {
    /// Plain acknowledgment.
    pub fn new(csn: Csn, server_id: ServerId) -> Self {
        Self {
            csn,
            server_id,
            timed_out: false,
            failed_servers: Vec::new(),
            rejected_after: None,
        }
    }

    /// Refusal of `csn` because the origin's log already ends at `last`.
    pub fn rejected(csn: Csn, server_id: ServerId, last: Csn) -> Self {
        Self {
            rejected_after: Some(last),
            ..Self::new(csn, server_id)
        }
    }
}

/// One server as advertised in a topology broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEntry {
    /// Server id.
    pub server_id: ServerId,
    /// Group id.
    pub group_id: GroupId,
    /// Routing weight.
    pub weight: u32,
    /// Normal or degraded.
    pub status: ServerStatus,
    /// Directory server or replication server.
    pub role: ServerRole,
}

/// Topology fragment broadcast by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyMessage {
    /// Server that sent the fragment.
    pub from: ServerId,
    /// Servers it knows about.
    pub servers: Vec<TopologyEntry>,
}

/// Every message of the replication protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplMessage {
    /// Handshake.
    Hello(HelloMessage),
    /// A change to replicate.
    Change(ChangeRecord),
    /// Assured-replication acknowledgment.
    Ack(AckMessage),
    /// Receiver hands back `n` flow-control credits.
    WindowCredit {
        /// Number of credits returned.
        n: u32,
    },
    /// Topology broadcast.
    Topology(TopologyMessage),
    /// Keep-alive sent every heartbeat interval.
    Heartbeat,
}

impl ReplMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplMessage::Hello(_) => "hello",
            ReplMessage::Change(_) => "change",
            ReplMessage::Ack(_) => "ack",
            ReplMessage::WindowCredit { .. } => "window_credit",
            ReplMessage::Topology(_) => "topology",
            ReplMessage::Heartbeat => "heartbeat",
        }
    }
}

/// Encode a message into a complete frame.
pub fn encode_frame(msg: &ReplMessage) -> Result<Bytes, ReplError> {
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ReplError::Protocol {
            msg: format!("frame of {} bytes exceeds limit", body.len()),
        });
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    buf.put_u32_le(MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u32_le(body.len() as u32);
    buf.put_u32_le(crc32fast::hash(&body));
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Write one message.
pub async fn write_message<W>(writer: &mut W, msg: &ReplMessage) -> Result<(), ReplError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ReplMessage>, ReplError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ReplError::Protocol {
                msg: "stream ended inside a frame header".to_string(),
            });
        }
        filled += n;
    }

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != MAGIC {
        return Err(ReplError::Protocol {
            msg: format!("bad frame magic {:#010x}", magic),
        });
    }
    if header[4] != PROTOCOL_VERSION {
        return Err(ReplError::Protocol {
            msg: format!("unsupported protocol version {}", header[4]),
        });
    }
    let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ReplError::Protocol {
            msg: format!("frame of {} bytes exceeds limit", len),
        });
    }
    let crc = u32::from_le_bytes([header[9], header[10], header[11], header[12]]);

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    if crc32fast::hash(&body) != crc {
        return Err(ReplError::Protocol {
            msg: "frame checksum mismatch".to_string(),
        });
    }
    Ok(Some(bincode::deserialize(&body)?))
}
