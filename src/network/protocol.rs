// Protocol - Message types exchanged between processes
//
// - Request:  ask every peer for the critical section
// - Reply:    acknowledge a request, carrying the replier's clock
// - Release:  leave the critical section (or withdraw a request)
// - Block:    replicate a committed block
//
// On stream transports every message is framed as a big-endian u32 length
// followed by the postcard payload.

use crate::ledger::Block;
use crate::mutex::{ProcessId, Request};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound for one framed message
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Largest payload the u32 length prefix can describe
pub const FRAME_LENGTH_LIMIT: usize = u32::MAX as usize;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Types of messages in the protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Reply,
    Release,
    Block,
}

/// A message between two processes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    Request { timestamp: u64, process_id: ProcessId },
    Reply { from: ProcessId, timestamp: u64 },
    Release { process_id: ProcessId, timestamp: u64 },
    Block(Block),
}

impl PeerMessage {
    /// REQUEST message for a pending request
    pub fn request(request: &Request) -> Self {
        Self::Request {
            timestamp: request.timestamp(),
            process_id: request.process_id().clone(),
        }
    }

    /// Get the message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request { .. } => MessageType::Request,
            Self::Reply { .. } => MessageType::Reply,
            Self::Release { .. } => MessageType::Release,
            Self::Block(_) => MessageType::Block,
        }
    }

    /// Process that originated the message, if the message names one
    pub fn origin(&self) -> Option<&ProcessId> {
        match self {
            Self::Request { process_id, .. } | Self::Release { process_id, .. } => Some(process_id),
            Self::Reply { from, .. } => Some(from),
            Self::Block(_) => None,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        postcard::to_allocvec(self).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        postcard::from_bytes(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
    }
}

/// Write one length-prefixed message
pub async fn write_frame<W>(writer: &mut W, message: &PeerMessage, max_frame_bytes: usize) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let payload = message.to_bytes()?;
    let too_large = || ProtocolError::FrameTooLarge {
        size: payload.len(),
        max: max_frame_bytes.min(FRAME_LENGTH_LIMIT),
    };
    if payload.len() > max_frame_bytes {
        return Err(too_large());
    }
    let len = u32::try_from(payload.len()).map_err(|_| too_large())?;

    writer.write_u32(len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message. Returns None on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<PeerMessage>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: max_frame_bytes,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    PeerMessage::from_bytes(&payload).map(Some)
}
