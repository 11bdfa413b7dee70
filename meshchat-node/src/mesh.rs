//! Mesh network manager: accept loop, dialing, handshake -> register, flooding and discovery.
//!
//! Every connection reports into one channel drained by a single dispatcher task, so registry
//! and seen-cache updates are applied in arrival order. `MeshCore` and `PeerRegistry` each sit
//! behind their own lock; when both are held the core lock is always taken first.
//!
//! The accept loop and the dispatcher hold only a weak reference to the node, so dropping every
//! `Mesh` handle stops them. Call [`Mesh::shutdown`] first to close peers and report them.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use meshchat_core::{
    encode_frame, Action, ConnectionState, CoreError, Direction, DisconnectReason, ErrorKind,
    KnownPeers, MeshCore, MeshEvent, Message, MessageId, NodeId, Payload, PeerId, PeerInfo,
    SeenCache,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::Config;
use crate::connection::{ConnectionEvent, PeerConnection};
use crate::error::{HandshakeError, MeshError};
use crate::handshake;
use crate::registry::PeerRegistry;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A known listen address and whether a peer behind it is connected right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPeer {
    pub address: SocketAddr,
    pub connected: bool,
}

/// Handle to a running mesh node. Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<Shared>,
}

struct Shared {
    config: Config,
    node_id: NodeId,
    core: Mutex<MeshCore>,
    registry: Mutex<PeerRegistry>,
    events: mpsc::UnboundedSender<MeshEvent>,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    next_peer_id: AtomicU64,
    listen_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
}

impl Mesh {
    /// Create a node and start its dispatcher. Returns the handle and the event stream.
    /// Must be called within a tokio runtime. The dispatcher ends on `shutdown` or once the
    /// last handle is dropped.
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let node_id = NodeId::generate();
        let nickname = config
            .nickname
            .clone()
            .unwrap_or_else(|| format!("peer-{}", node_id.short()));
        let core = MeshCore::with_parts(
            node_id.clone(),
            nickname,
            SeenCache::new(config.seen_capacity, config.seen_max_age()),
            KnownPeers::new(config.max_dial_failures),
        );
        let (events, events_rx) = mpsc::unbounded_channel();
        let (connection_events, connection_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let mesh = Self {
            inner: Arc::new(Shared {
                config,
                node_id,
                core: Mutex::new(core),
                registry: Mutex::new(PeerRegistry::new()),
                events,
                connection_events,
                next_peer_id: AtomicU64::new(1),
                listen_addr: Mutex::new(None),
                shutdown,
            }),
        };
        tracing::info!(node = %mesh.inner.node_id, "mesh node created");
        tokio::spawn(dispatch_loop(Arc::downgrade(&mesh.inner), connection_rx));
        (mesh, events_rx)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub async fn nickname(&self) -> String {
        self.inner.core.lock().await.nickname().to_string()
    }

    /// Last nickname seen for `node_id`, from handshakes or message headers.
    pub async fn nickname_of(&self, node_id: &NodeId) -> Option<String> {
        self.inner
            .core
            .lock()
            .await
            .nickname_of(node_id)
            .map(str::to_string)
    }

    /// Address the listener is bound to, once listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.lock().await
    }

    /// Bind `bind_host:port` (0 picks a free port) and accept inbound peers until shutdown.
    pub async fn start_listening(&self, port: u16) -> Result<SocketAddr, MeshError> {
        self.ensure_running()?;
        let mut listen_addr = self.inner.listen_addr.lock().await;
        if let Some(addr) = *listen_addr {
            return Err(MeshError::AlreadyListening(addr));
        }
        let bind = SocketAddr::new(self.inner.config.bind_host, port);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| MeshError::Bind { port, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| MeshError::Bind { port, source })?;
        *listen_addr = Some(local);
        drop(listen_addr);

        {
            let mut core = self.inner.core.lock().await;
            core.set_listen_port(Some(local.port()));
            if !local.ip().is_unspecified() {
                core.note_self_address(local);
            }
        }
        tracing::info!(addr = %local, "listening");
        tokio::spawn(accept_loop(Arc::downgrade(&self.inner), listener));
        Ok(local)
    }

    /// Dial `addr` and run the same handshake -> register sequence as an inbound peer.
    /// Not retried; a failed dial counts against the address in the known-peer set.
    pub async fn connect_to(&self, addr: SocketAddr) -> Result<PeerId, MeshError> {
        self.ensure_running()?;
        if self.inner.core.lock().await.is_self_address(&addr) {
            return Err(MeshError::SelfDial(addr));
        }
        if self.inner.registry.lock().await.find_by_address(addr).is_some() {
            return Err(MeshError::AlreadyConnected(addr.to_string()));
        }

        tracing::debug!(%addr, "dialing");
        let dial = tokio::time::timeout(self.inner.config.dial_timeout(), TcpStream::connect(addr));
        let stream = match dial.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                self.note_dial_failure(addr).await;
                return Err(MeshError::Dial { addr, source });
            }
            Err(_) => {
                self.note_dial_failure(addr).await;
                return Err(MeshError::DialTimeout(addr));
            }
        };

        match self
            .establish(stream, addr, Direction::Outbound, Some(addr))
            .await
        {
            Err(MeshError::Handshake {
                source: HandshakeError::SelfConnection,
                ..
            }) => {
                self.inner.core.lock().await.note_self_address(addr);
                Err(MeshError::SelfDial(addr))
            }
            other => other,
        }
    }

    /// Originate a message with a fresh ID and flood it to every connected peer.
    pub async fn broadcast(&self, payload: Payload) -> Result<MessageId, MeshError> {
        self.broadcast_with_id(payload, None).await
    }

    /// Like `broadcast`, with a caller-chosen ID. An ID this node has already seen is refused
    /// and nothing is sent.
    pub async fn broadcast_with_id(
        &self,
        payload: Payload,
        id: Option<MessageId>,
    ) -> Result<MessageId, MeshError> {
        self.ensure_running()?;
        let message = self
            .inner
            .core
            .lock()
            .await
            .originate(payload, id)
            .map_err(|e| match e {
                CoreError::DuplicateMessage(id) => MeshError::DuplicateMessage(id),
            })?;
        self.send_to_all(&message).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<MessageId, MeshError> {
        self.broadcast(Payload::Chat { text: text.into() }).await
    }

    pub async fn send_file(
        &self,
        filename: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<MessageId, MeshError> {
        self.broadcast(Payload::FileTransfer {
            filename: filename.into(),
            data,
        })
        .await
    }

    /// Read a file from disk and broadcast it under its base name.
    pub async fn send_file_from_path(&self, path: &Path) -> Result<MessageId, MeshError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| MeshError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        self.send_file(filename, data).await
    }

    /// Rename this node and announce the change to the mesh.
    pub async fn change_nickname(
        &self,
        new_nickname: impl Into<String>,
    ) -> Result<MessageId, MeshError> {
        self.ensure_running()?;
        let message = self.inner.core.lock().await.change_nickname(new_nickname);
        self.send_to_all(&message).await
    }

    /// Close and unregister one peer. Emits `PeerDisconnected { reason: Local }`.
    pub async fn disconnect(&self, peer_id: PeerId) -> Result<(), MeshError> {
        if self.remove_peer(peer_id, DisconnectReason::Local).await {
            Ok(())
        } else {
            Err(MeshError::UnknownPeer(peer_id))
        }
    }

    /// Peers with a live, open connection, ordered by peer ID.
    pub async fn connected_peers(&self) -> Vec<PeerInfo> {
        self.inner
            .registry
            .lock()
            .await
            .snapshot()
            .into_iter()
            .filter(|p| p.state == ConnectionState::Connected)
            .collect()
    }

    /// Every listen address this node knows of, connected or not.
    pub async fn known_peers(&self) -> Vec<KnownPeer> {
        let known = self.inner.core.lock().await.known_peers();
        let connected = self.inner.registry.lock().await.addresses();
        known
            .into_iter()
            .map(|address| KnownPeer {
                address,
                connected: connected.contains(&address),
            })
            .collect()
    }

    /// Stop accepting, close every connection and emit one `PeerDisconnected` per peer.
    /// Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let mut registry = self.inner.registry.lock().await;
        for (peer_id, connection) in registry.drain() {
            connection.close();
            self.emit(MeshEvent::PeerDisconnected {
                peer_id,
                reason: DisconnectReason::Local,
            });
        }
        drop(registry);
        tracing::info!(node = %self.inner.node_id, "mesh shut down");
    }

    fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn ensure_running(&self) -> Result<(), MeshError> {
        if self.is_shut_down() {
            return Err(MeshError::ShutDown);
        }
        Ok(())
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn note_dial_failure(&self, addr: SocketAddr) {
        if self.inner.core.lock().await.record_dial_failure(addr) {
            tracing::info!(%addr, "dropping unreachable address from known peers");
        }
    }

    async fn accept_peer(&self, stream: TcpStream, remote: SocketAddr) {
        match self.establish(stream, remote, Direction::Inbound, None).await {
            Ok(_) => {}
            Err(MeshError::Handshake {
                source: HandshakeError::SelfConnection,
                ..
            }) => {
                tracing::debug!(%remote, "dropped connection from self");
            }
            Err(MeshError::ShutDown) => {
                tracing::debug!(%remote, "inbound handshake finished after shutdown");
            }
            Err(e) => {
                tracing::warn!(%remote, error = %e, "inbound connection rejected");
                self.emit(MeshEvent::Error {
                    kind: e.kind(),
                    detail: e.to_string(),
                });
            }
        }
    }

    /// Handshake a fresh transport, register it and send it our known-peer list.
    /// On any failure the stream is dropped (closed) without registering.
    async fn establish(
        &self,
        mut stream: TcpStream,
        remote: SocketAddr,
        direction: Direction,
        dialed: Option<SocketAddr>,
    ) -> Result<PeerId, MeshError> {
        let _ = stream.set_nodelay(true);
        let ours = self.inner.core.lock().await.handshake_message();
        let hs = handshake::exchange(
            &mut stream,
            &ours,
            &self.inner.node_id,
            self.inner.config.handshake_timeout(),
        )
        .await
        .map_err(|source| MeshError::Handshake {
            addr: remote,
            source,
        })?;

        let listen_addr = match direction {
            Direction::Outbound => dialed,
            Direction::Inbound => hs.listen_port.map(|p| SocketAddr::new(remote.ip(), p)),
        };
        {
            let mut core = self.inner.core.lock().await;
            core.on_handshake(&hs.announce, listen_addr);
            if let (Ok(local), Some(port)) = (stream.local_addr(), core.listen_port()) {
                core.note_self_address(SocketAddr::new(local.ip(), port));
            }
        }

        let peer_id = PeerId(self.inner.next_peer_id.fetch_add(1, Ordering::Relaxed));
        let info = PeerInfo {
            peer_id,
            node_id: hs.announce.sender_id.clone(),
            nickname: hs.announce.sender_nickname.clone(),
            address: listen_addr,
            remote_addr: remote,
            direction,
            state: ConnectionState::Connected,
        };
        {
            // Held across open + register so the dispatcher cannot see this peer's events first.
            let mut registry = self.inner.registry.lock().await;
            if self.is_shut_down() {
                return Err(MeshError::ShutDown);
            }
            if registry.contains_node(&info.node_id) {
                return Err(MeshError::AlreadyConnected(info.node_id.to_string()));
            }
            let connection = PeerConnection::open(
                stream,
                peer_id,
                hs.buffer,
                self.inner.connection_events.clone(),
            );
            if let Err(e) = registry.register(connection.clone(), info.clone()) {
                connection.close();
                return Err(MeshError::AlreadyConnected(e.to_string()));
            }
            tracing::info!(
                peer = %peer_id,
                node = %info.node_id,
                nickname = %info.nickname,
                %remote,
                ?direction,
                "peer connected"
            );
            self.emit(MeshEvent::PeerConnected {
                peer_id,
                info: info.clone(),
            });
        }

        let peer_list = self.inner.core.lock().await.peer_list_message(listen_addr);
        if let Some(connection) = self.inner.registry.lock().await.get(peer_id) {
            if let Err(e) = connection.send(&peer_list) {
                tracing::debug!(peer = %peer_id, error = %e, "peer list not sent");
            }
        }
        Ok(peer_id)
    }

    /// Flooding step for one message from a registered peer. A message from a peer that is no
    /// longer registered is dropped. The registry lock is held until the resulting events are
    /// emitted, so nothing from a peer is reported after its `PeerDisconnected`.
    async fn on_message_received(&self, from: PeerId, message: Message) {
        let mut core = self.inner.core.lock().await;
        let mut registry = self.inner.registry.lock().await;
        if registry.get(from).is_none() {
            tracing::trace!(
                peer = %from,
                id = %message.message_id,
                "dropped message from removed peer"
            );
            return;
        }
        let actions = core.on_message_received(from, message);
        drop(core);
        for action in actions {
            match action {
                Action::Emit(event) => {
                    if let MeshEvent::NicknameChanged {
                        node_id,
                        new_nickname,
                        ..
                    } = &event
                    {
                        registry.set_nickname(node_id, new_nickname);
                    }
                    self.emit(event);
                }
                Action::Forward { message, except } => {
                    if let Err(e) = forward(&registry, &message, except) {
                        tracing::warn!(id = %message.message_id, error = %e, "forward failed");
                    }
                }
            }
        }
    }

    async fn send_to_all(&self, message: &Message) -> Result<MessageId, MeshError> {
        let sent = forward(&*self.inner.registry.lock().await, message, None)?;
        tracing::debug!(
            id = %message.message_id,
            kind = message.payload.kind(),
            peers = sent,
            "broadcast"
        );
        Ok(message.message_id.clone())
    }

    /// Unregister and close `peer_id`. Returns false if it was not registered, in which case
    /// nothing is emitted.
    async fn remove_peer(&self, peer_id: PeerId, reason: DisconnectReason) -> bool {
        let mut registry = self.inner.registry.lock().await;
        let Some(connection) = registry.unregister(peer_id) else {
            return false;
        };
        connection.close();
        tracing::info!(peer = %peer_id, %reason, "peer disconnected");
        self.emit(MeshEvent::PeerDisconnected { peer_id, reason });
        true
    }
}

/// Encode once and queue on every open connection except `except`. Returns how many peers the
/// frame was queued for; peers closing meanwhile are skipped.
fn forward(
    registry: &PeerRegistry,
    message: &Message,
    except: Option<PeerId>,
) -> Result<usize, MeshError> {
    let frame = encode_frame(message)?;
    let mut sent = 0;
    let skipped = registry.for_each_connected(except, |connection| {
        connection.send_frame(frame.clone())?;
        sent += 1;
        Ok(())
    });
    if !skipped.is_empty() {
        tracing::debug!(id = %message.message_id, skipped = ?skipped, "skipped closing peers");
    }
    Ok(sent)
}

async fn accept_loop(shared: Weak<Shared>, listener: TcpListener) {
    let Some(mut closed) = shared.upgrade().map(|s| s.shutdown.subscribe()) else {
        return;
    };
    loop {
        if *closed.borrow() {
            break;
        }
        let accepted = tokio::select! {
            _ = closed.changed() => break,
            r = listener.accept() => r,
        };
        let Some(inner) = shared.upgrade() else {
            break;
        };
        let mesh = Mesh { inner };
        match accepted {
            Ok((stream, remote)) => {
                tracing::debug!(%remote, "accepted");
                tokio::spawn(async move { mesh.accept_peer(stream, remote).await });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                mesh.emit(MeshEvent::Error {
                    kind: ErrorKind::Io,
                    detail: e.to_string(),
                });
                drop(mesh);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

/// Single consumer of all connection events. Holds the node only while handling one event.
async fn dispatch_loop(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    let Some(mut closed) = shared.upgrade().map(|s| s.shutdown.subscribe()) else {
        return;
    };
    loop {
        if *closed.borrow() {
            break;
        }
        let event = tokio::select! {
            _ = closed.changed() => break,
            event = events.recv() => match event {
                Some(e) => e,
                None => break,
            },
        };
        let Some(inner) = shared.upgrade() else {
            break;
        };
        let mesh = Mesh { inner };
        match event {
            ConnectionEvent::Message { peer_id, message } => {
                mesh.on_message_received(peer_id, message).await
            }
            ConnectionEvent::Closed { peer_id, reason } => {
                mesh.remove_peer(peer_id, reason).await;
            }
        }
    }
    tracing::debug!("dispatcher stopped");
}
