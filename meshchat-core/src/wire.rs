//! Framing: length-prefix (4 bytes BE) + JSON payload.

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024; // 32 MiB

/// Encode a message into a single frame: 4 bytes BE length + JSON payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = serde_json::to_vec(msg).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len).into());
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg: Message = serde_json::from_slice(&bytes[LEN_SIZE..LEN_SIZE + len])
        .map_err(ProtocolError::Malformed)?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a frame: either incomplete input or a protocol violation.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Malformed traffic from a peer. Fatal for that connection only.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(u32),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Accumulates bytes from a stream and yields whole messages as frames complete.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete message, `Ok(None)` if the buffered frame is still partial.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match decode_frame(&self.buf) {
            Ok((msg, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(msg))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(FrameDecodeError::Protocol(e)) => Err(e),
        }
    }

    /// Bytes buffered but not yet consumed as a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
