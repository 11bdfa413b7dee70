//! Error types for the node: listener, dialer, handshake and API failures.

use std::net::SocketAddr;
use std::path::PathBuf;

use meshchat_core::{ErrorKind, FrameEncodeError, MessageId, PeerId, ProtocolError};

/// Failure returned from a `Mesh` operation. Connection-scoped failures are never returned here;
/// they surface as `PeerDisconnected` events.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[error("already listening on {0}")]
    AlreadyListening(SocketAddr),
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("timed out connecting to {0}")]
    DialTimeout(SocketAddr),
    #[error("cannot connect to own address {0}")]
    SelfDial(SocketAddr),
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        source: HandshakeError,
    },
    #[error("message {0} was already seen")]
    DuplicateMessage(MessageId),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("mesh is shut down")]
    ShutDown,
}

impl MeshError {
    /// Category used when the failure is reported as a `MeshEvent::Error`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshError::Bind { .. } | MeshError::AlreadyListening(_) => ErrorKind::Bind,
            MeshError::Dial { .. } | MeshError::DialTimeout(_) | MeshError::SelfDial(_) => {
                ErrorKind::Dial
            }
            MeshError::Handshake { source, .. } => match source {
                HandshakeError::Timeout(_) => ErrorKind::HandshakeTimeout,
                HandshakeError::Protocol(_) | HandshakeError::UnexpectedMessage(_) => {
                    ErrorKind::Protocol
                }
                HandshakeError::Io(_) => ErrorKind::Io,
                _ => ErrorKind::Handshake,
            },
            MeshError::AlreadyConnected(_) => ErrorKind::Handshake,
            _ => ErrorKind::Io,
        }
    }
}

/// Handshake failure on a fresh transport. The transport is closed and never registered.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no handshake within {0:?}")]
    Timeout(std::time::Duration),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("expected handshake_announce, got {0}")]
    UnexpectedMessage(&'static str),
    #[error("unsupported protocol version {0}")]
    VersionMismatch(u8),
    #[error("connection to self")]
    SelfConnection,
}

/// Failure queueing a message on one connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection {0} is closed")]
    Closed(PeerId),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}
