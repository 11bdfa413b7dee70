//! Host-driven API: MeshCore receives decoded messages from the host, returns actions.
//! The host owns sockets and performs the forwards; the core decides what to forward and report.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::discovery::KnownPeers;
use crate::event::MeshEvent;
use crate::identity::{MessageId, NodeId, PeerId};
use crate::protocol::{Message, Payload, PROTOCOL_VERSION};
use crate::seen::SeenCache;

/// Flooding coordinator state: own identity, seen-message cache, known peers, nickname table.
pub struct MeshCore {
    node_id: NodeId,
    nickname: String,
    listen_port: Option<u16>,
    seen: SeenCache,
    known: KnownPeers,
    nicknames: HashMap<NodeId, String>,
}

impl MeshCore {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self::with_parts(
            NodeId::generate(),
            nickname,
            SeenCache::default(),
            KnownPeers::default(),
        )
    }

    pub fn with_parts(
        node_id: NodeId,
        nickname: impl Into<String>,
        seen: SeenCache,
        known: KnownPeers,
    ) -> Self {
        Self {
            node_id,
            nickname: nickname.into(),
            listen_port: None,
            seen,
            known,
            nicknames: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    pub fn set_listen_port(&mut self, port: Option<u16>) {
        self.listen_port = port;
        self.known.set_listen_port(port);
    }

    /// Last nickname observed for a node.
    pub fn nickname_of(&self, node_id: &NodeId) -> Option<&str> {
        self.nicknames.get(node_id).map(String::as_str)
    }

    /// Handshake frame announcing this node. Sent first on every new transport.
    pub fn handshake_message(&mut self) -> Message {
        self.fresh(Payload::HandshakeAnnounce {
            protocol_version: PROTOCOL_VERSION,
            listen_port: self.listen_port,
        })
    }

    /// Locally authored message. Uses `id` if given, else a fresh one.
    /// Fails if the ID has already been observed; the caller must not send it.
    pub fn originate(
        &mut self,
        payload: Payload,
        id: Option<MessageId>,
    ) -> Result<Message, CoreError> {
        let id = id.unwrap_or_else(MessageId::generate);
        if !self.seen.observe(&id) {
            return Err(CoreError::DuplicateMessage(id));
        }
        if let Payload::NicknameChange { new_nickname, .. } = &payload {
            self.nickname = new_nickname.clone();
        }
        Ok(Message::new(
            id,
            self.node_id.clone(),
            self.nickname.clone(),
            payload,
        ))
    }

    /// Change the local nickname and build the announcement for the mesh.
    pub fn change_nickname(&mut self, new_nickname: impl Into<String>) -> Message {
        let new_nickname = new_nickname.into();
        let old_nickname = std::mem::replace(&mut self.nickname, new_nickname.clone());
        self.fresh(Payload::NicknameChange {
            old_nickname,
            new_nickname,
        })
    }

    /// Known-peers snapshot for a newly connected peer, leaving out the peer's own address.
    pub fn peer_list_message(&mut self, exclude: Option<SocketAddr>) -> Message {
        let peers = self.known.snapshot(exclude);
        self.fresh(Payload::PeerListShare { peers })
    }

    /// Completed handshake: remember the node's nickname and its listen address.
    pub fn on_handshake(&mut self, announce: &Message, listen_addr: Option<SocketAddr>) {
        self.nicknames
            .insert(announce.sender_id.clone(), announce.sender_nickname.clone());
        if let Some(addr) = listen_addr {
            self.known.record_dial_success(addr);
        }
    }

    /// Flooding step for a message received from a connected peer:
    /// drop duplicates, apply side effects, forward to everyone except `from`.
    pub fn on_message_received(&mut self, from: PeerId, message: Message) -> Vec<Action> {
        if matches!(message.payload, Payload::HandshakeAnnounce { .. }) {
            tracing::warn!(peer = %from, "ignoring handshake on established connection");
            return Vec::new();
        }
        if !self.seen.observe(&message.message_id) {
            tracing::trace!(peer = %from, id = %message.message_id, "duplicate dropped");
            return Vec::new();
        }

        let mut actions = Vec::new();
        match &message.payload {
            Payload::Chat { text } => {
                self.remember_nickname(&message);
                actions.push(Action::Emit(MeshEvent::ChatReceived {
                    sender_id: message.sender_id.clone(),
                    sender_nickname: message.sender_nickname.clone(),
                    text: text.clone(),
                    timestamp: message.timestamp,
                }));
            }
            Payload::NicknameChange {
                old_nickname,
                new_nickname,
            } => {
                self.nicknames
                    .insert(message.sender_id.clone(), new_nickname.clone());
                actions.push(Action::Emit(MeshEvent::NicknameChanged {
                    node_id: message.sender_id.clone(),
                    old_nickname: old_nickname.clone(),
                    new_nickname: new_nickname.clone(),
                }));
            }
            Payload::FileTransfer { filename, data } => {
                self.remember_nickname(&message);
                actions.push(Action::Emit(MeshEvent::FileReceived {
                    sender_id: message.sender_id.clone(),
                    sender_nickname: message.sender_nickname.clone(),
                    filename: filename.clone(),
                    data: data.clone(),
                }));
            }
            Payload::PeerListShare { peers } => {
                self.remember_nickname(&message);
                let added = self.known.merge(peers.iter().copied());
                if !added.is_empty() {
                    tracing::debug!(peer = %from, added = added.len(), "learned peer addresses");
                }
            }
            Payload::HandshakeAnnounce { .. } => {}
        }
        actions.push(Action::Forward {
            message,
            except: Some(from),
        });
        actions
    }

    /// Known listen addresses (connected or not), sorted.
    pub fn known_peers(&self) -> Vec<SocketAddr> {
        self.known.snapshot(None)
    }

    pub fn note_self_address(&mut self, addr: SocketAddr) {
        self.known.note_self_address(addr);
    }

    /// True if `addr` designates this node.
    pub fn is_self_address(&self, addr: &SocketAddr) -> bool {
        self.known.is_self(addr)
    }

    /// Returns true if the address was pruned from the known set.
    pub fn record_dial_failure(&mut self, addr: SocketAddr) -> bool {
        self.known.record_dial_failure(addr)
    }

    fn fresh(&mut self, payload: Payload) -> Message {
        let msg = Message::new(
            MessageId::generate(),
            self.node_id.clone(),
            self.nickname.clone(),
            payload,
        );
        self.seen.observe(&msg.message_id);
        msg
    }

    fn remember_nickname(&mut self, message: &Message) {
        if message.sender_id != self.node_id {
            self.nicknames
                .insert(message.sender_id.clone(), message.sender_nickname.clone());
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("message {0} was already seen")]
    DuplicateMessage(MessageId),
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send `message` unchanged to every connected peer except `except`.
    Forward {
        message: Message,
        except: Option<PeerId>,
    },
    /// Report to the application layer.
    Emit(MeshEvent),
}
