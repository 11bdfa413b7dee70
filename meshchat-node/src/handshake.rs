//! Connection handshake: both sides send `handshake_announce` first, then read the peer's.

use std::time::Duration;

use meshchat_core::{encode_frame, FrameBuffer, Message, NodeId, Payload, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::HandshakeError;

const READ_CHUNK: usize = 4096;

/// Result of a completed handshake.
#[derive(Debug)]
pub struct Handshake {
    /// The peer's announce message (identity and nickname in its header).
    pub announce: Message,
    pub listen_port: Option<u16>,
    /// Bytes read past the announce frame; handed on to the connection.
    pub buffer: FrameBuffer,
}

/// Exchange announces on a fresh transport within `timeout`.
pub async fn exchange(
    stream: &mut TcpStream,
    ours: &Message,
    own_node: &NodeId,
    timeout: Duration,
) -> Result<Handshake, HandshakeError> {
    tokio::time::timeout(timeout, exchange_inner(stream, ours, own_node))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

async fn exchange_inner(
    stream: &mut TcpStream,
    ours: &Message,
    own_node: &NodeId,
) -> Result<Handshake, HandshakeError> {
    let frame = encode_frame(ours)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut buffer = FrameBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];
    let announce = loop {
        if let Some(m) = buffer.next_message()? {
            break m;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "closed during handshake",
            )
            .into());
        }
        buffer.extend(&chunk[..n]);
    };

    let listen_port = match &announce.payload {
        Payload::HandshakeAnnounce {
            protocol_version,
            listen_port,
        } => {
            if *protocol_version != PROTOCOL_VERSION {
                return Err(HandshakeError::VersionMismatch(*protocol_version));
            }
            *listen_port
        }
        other => return Err(HandshakeError::UnexpectedMessage(other.kind())),
    };
    if announce.sender_id == *own_node {
        return Err(HandshakeError::SelfConnection);
    }
    Ok(Handshake {
        announce,
        listen_port,
        buffer,
    })
}
