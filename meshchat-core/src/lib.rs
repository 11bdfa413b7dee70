//! Meshchat protocol core.
//! Host-driven: no I/O; host passes decoded messages and receives actions.

pub mod core;
pub mod discovery;
pub mod event;
pub mod identity;
pub mod protocol;
pub mod seen;
pub mod wire;

pub use crate::core::{Action, CoreError, MeshCore};
pub use discovery::KnownPeers;
pub use event::{ConnectionState, Direction, DisconnectReason, ErrorKind, MeshEvent, PeerInfo};
pub use identity::{MessageId, NodeId, PeerId};
pub use protocol::{Message, Payload, PROTOCOL_VERSION};
pub use seen::SeenCache;
pub use wire::{
    decode_frame, encode_frame, FrameBuffer, FrameDecodeError, FrameEncodeError, ProtocolError,
};
