//! Meshchat node: TCP transport, peer registry and the mesh manager driving `meshchat-core`.

pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod mesh;
pub mod registry;

pub use config::Config;
pub use error::{ConnectionError, HandshakeError, MeshError};
pub use mesh::{KnownPeer, Mesh};
