//! Peer registry: connected peers keyed by peer ID. The single source of truth for "who is connected".
//! Callers hold it behind the mesh's lock; nothing here is shared ambiently.

use std::collections::HashMap;
use std::net::SocketAddr;

use meshchat_core::{NodeId, PeerId, PeerInfo};

use crate::connection::PeerConnection;
use crate::error::ConnectionError;

struct Entry {
    connection: PeerConnection,
    info: PeerInfo,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerId),
    #[error("node {0} is already connected")]
    DuplicateNode(NodeId),
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Entry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connected peer. A node may be registered under at most one peer ID.
    pub fn register(
        &mut self,
        connection: PeerConnection,
        info: PeerInfo,
    ) -> Result<(), RegistryError> {
        if self.peers.contains_key(&info.peer_id) {
            return Err(RegistryError::DuplicatePeer(info.peer_id));
        }
        if self.contains_node(&info.node_id) {
            return Err(RegistryError::DuplicateNode(info.node_id));
        }
        self.peers.insert(info.peer_id, Entry { connection, info });
        Ok(())
    }

    /// Remove a peer and hand back its connection (not closed here).
    pub fn unregister(&mut self, peer_id: PeerId) -> Option<PeerConnection> {
        self.peers.remove(&peer_id).map(|e| e.connection)
    }

    /// Copy of all peer metadata, ordered by peer ID, with live connection state.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self
            .peers
            .values()
            .map(|e| PeerInfo {
                state: e.connection.state(),
                ..e.info.clone()
            })
            .collect();
        out.sort_by_key(|p| p.peer_id);
        out
    }

    /// Apply `f` to every open connection except `except`. Peers that closed meanwhile or whose
    /// send fails are skipped; their IDs are returned.
    pub fn for_each_connected<F>(&self, except: Option<PeerId>, mut f: F) -> Vec<PeerId>
    where
        F: FnMut(&PeerConnection) -> Result<(), ConnectionError>,
    {
        let mut skipped = Vec::new();
        for (peer_id, entry) in &self.peers {
            if Some(*peer_id) == except {
                continue;
            }
            if !entry.connection.is_open() || f(&entry.connection).is_err() {
                skipped.push(*peer_id);
            }
        }
        skipped
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&PeerConnection> {
        self.peers.get(&peer_id).map(|e| &e.connection)
    }

    pub fn contains_node(&self, node_id: &NodeId) -> bool {
        self.peers.values().any(|e| e.info.node_id == *node_id)
    }

    /// Peer whose listen address is `addr`.
    pub fn find_by_address(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .values()
            .find(|e| e.info.address == Some(addr))
            .map(|e| e.info.peer_id)
    }

    /// Listen addresses of connected peers.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.peers.values().filter_map(|e| e.info.address).collect()
    }

    /// Update the nickname for a node's connection, if it is connected directly.
    pub fn set_nickname(&mut self, node_id: &NodeId, nickname: &str) -> bool {
        match self.peers.values_mut().find(|e| e.info.node_id == *node_id) {
            Some(e) => {
                e.info.nickname = nickname.to_string();
                true
            }
            None => false,
        }
    }

    /// Remove every peer.
    pub fn drain(&mut self) -> Vec<(PeerId, PeerConnection)> {
        let mut out: Vec<(PeerId, PeerConnection)> = self
            .peers
            .drain()
            .map(|(id, e)| (id, e.connection))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
