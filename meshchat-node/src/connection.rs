//! Peer connection: one TCP stream to one remote peer.
//! The receive and send tasks own the socket halves; `PeerConnection` handles only queue frames
//! and request close, so they can be cloned into the registry freely.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshchat_core::{
    encode_frame, ConnectionState, DisconnectReason, FrameBuffer, Message, PeerId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::error::ConnectionError;

const READ_CHUNK: usize = 64 * 1024;
/// Upper bound on flushing queued frames after close.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Reported by a connection's tasks to whoever opened it.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message { peer_id: PeerId, message: Message },
    /// Sent when the receive loop ends, or when a write fails.
    Closed {
        peer_id: PeerId,
        reason: DisconnectReason,
    },
}

/// Handle to a live connection. Cheap to clone; all clones refer to the same transport.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    peer_id: PeerId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: Arc<watch::Sender<bool>>,
    state: Arc<AtomicU8>,
}

impl PeerConnection {
    /// Wrap an already-connected (and handshaken) stream and start its receive and send tasks.
    /// `buffer` holds bytes already read past the handshake; they are decoded first.
    /// Must be called within a tokio runtime.
    pub fn open(
        stream: TcpStream,
        peer_id: PeerId,
        buffer: FrameBuffer,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let state = Arc::new(AtomicU8::new(encode_state(ConnectionState::Connected)));

        tokio::spawn(receive_loop(
            reader,
            buffer,
            peer_id,
            events.clone(),
            shutdown.clone(),
            shutdown.subscribe(),
            state.clone(),
        ));
        tokio::spawn(send_loop(
            writer,
            outbound_rx,
            peer_id,
            events,
            shutdown.clone(),
            shutdown.subscribe(),
        ));

        Self {
            peer_id,
            outbound,
            shutdown,
            state,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Encode and queue a message. Frames from one caller are written in order.
    pub fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        let frame = encode_frame(message)?;
        self.send_frame(frame)
    }

    /// Queue an already-encoded frame.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed(self.peer_id));
        }
        self.outbound
            .send(frame)
            .map_err(|_| ConnectionError::Closed(self.peer_id))
    }

    /// Close the transport. Idempotent; the receive loop reports `Closed` once it stops.
    pub fn close(&self) {
        let closing = self.state.compare_exchange(
            encode_state(ConnectionState::Connected),
            encode_state(ConnectionState::Closing),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if closing.is_ok() {
            tracing::debug!(peer = %self.peer_id, "closing connection");
            self.shutdown.send_replace(true);
        }
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    mut buffer: FrameBuffer,
    peer_id: PeerId,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    mut closed: watch::Receiver<bool>,
    state: Arc<AtomicU8>,
) {
    let mut chunk = vec![0u8; READ_CHUNK];
    let reason = 'conn: loop {
        loop {
            // Frames still buffered after a local close are dropped.
            if *closed.borrow() {
                break 'conn DisconnectReason::Local;
            }
            match buffer.next_message() {
                Ok(Some(message)) => {
                    if events
                        .send(ConnectionEvent::Message { peer_id, message })
                        .is_err()
                    {
                        break 'conn DisconnectReason::Local;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = %peer_id, error = %e, "protocol error");
                    break 'conn DisconnectReason::Protocol(e.to_string());
                }
            }
        }
        if *closed.borrow() {
            break DisconnectReason::Local;
        }
        tokio::select! {
            _ = closed.changed() => break DisconnectReason::Local,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break DisconnectReason::Closed,
                Ok(n) => buffer.extend(&chunk[..n]),
                Err(e) => break DisconnectReason::Io(e.to_string()),
            },
        }
    };

    state.store(encode_state(ConnectionState::Closed), Ordering::Release);
    // Stop the send task as well.
    shutdown.send_replace(true);
    tracing::debug!(peer = %peer_id, %reason, "receive loop ended");
    let _ = events.send(ConnectionEvent::Closed { peer_id, reason });
}

async fn send_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    peer_id: PeerId,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.changed() => break,
            frame = outbound.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };
        let result = tokio::select! {
            _ = closed.changed() => break,
            r = writer.write_all(&frame) => r,
        };
        if let Err(e) = result {
            tracing::debug!(peer = %peer_id, error = %e, "write failed");
            let _ = events.send(ConnectionEvent::Closed {
                peer_id,
                reason: DisconnectReason::Io(e.to_string()),
            });
            shutdown.send_replace(true);
            return;
        }
    }

    // Best effort: flush what was queued before close.
    let flush = async {
        while let Ok(frame) = outbound.try_recv() {
            if writer.write_all(&frame).await.is_err() {
                return;
            }
        }
        let _ = writer.shutdown().await;
    };
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await;
}

fn encode_state(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Connecting => 0,
        ConnectionState::Handshaking => 1,
        ConnectionState::Connected => 2,
        ConnectionState::Closing => 3,
        ConnectionState::Closed => 4,
    }
}

fn decode_state(v: u8) -> ConnectionState {
    match v {
        0 => ConnectionState::Connecting,
        1 => ConnectionState::Handshaking,
        2 => ConnectionState::Connected,
        3 => ConnectionState::Closing,
        _ => ConnectionState::Closed,
    }
}
