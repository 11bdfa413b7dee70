//! Events raised to the application layer and the peer metadata they carry.

use std::fmt;
use std::net::SocketAddr;

use crate::identity::{NodeId, PeerId};

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Connected,
    Closing,
    Closed,
}

/// Which side opened the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Read-only metadata for a connected peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub node_id: NodeId,
    pub nickname: String,
    /// Listen address for redial, if the peer announced one.
    pub address: Option<SocketAddr>,
    /// Socket address of the remote end of this transport.
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    pub state: ConnectionState,
}

/// Why a registered peer went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Remote closed the stream.
    Closed,
    /// Closed locally (disconnect or shutdown).
    Local,
    /// Remote sent a malformed frame.
    Protocol(String),
    /// Read or write failed.
    Io(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => f.write_str("closed by peer"),
            DisconnectReason::Local => f.write_str("closed locally"),
            DisconnectReason::Protocol(d) => write!(f, "protocol error: {d}"),
            DisconnectReason::Io(d) => write!(f, "i/o error: {d}"),
        }
    }
}

/// Error category for `MeshEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Bind,
    Dial,
    Protocol,
    HandshakeTimeout,
    Handshake,
    Io,
}

/// Everything the mesh reports upward. Consumers render these; the core never does.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeerConnected {
        peer_id: PeerId,
        info: PeerInfo,
    },
    PeerDisconnected {
        peer_id: PeerId,
        reason: DisconnectReason,
    },
    ChatReceived {
        sender_id: NodeId,
        sender_nickname: String,
        text: String,
        timestamp: f64,
    },
    FileReceived {
        sender_id: NodeId,
        sender_nickname: String,
        filename: String,
        data: Vec<u8>,
    },
    NicknameChanged {
        node_id: NodeId,
        old_nickname: String,
        new_nickname: String,
    },
    Error {
        kind: ErrorKind,
        detail: String,
    },
}
