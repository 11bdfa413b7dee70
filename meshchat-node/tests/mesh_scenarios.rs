//! End-to-end scenarios: real nodes on loopback TCP.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use meshchat_core::{
    encode_frame, DisconnectReason, ErrorKind, FrameBuffer, MeshEvent, Message, MessageId,
    NodeId, Payload, PROTOCOL_VERSION,
};
use meshchat_node::{Config, Mesh, MeshError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);
/// Time allowed for stray duplicates to show up before asserting there are none.
const SETTLE: Duration = Duration::from_millis(300);

type Events = UnboundedReceiver<MeshEvent>;

fn test_config(nick: &str) -> Config {
    Config {
        bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        nickname: Some(nick.to_string()),
        handshake_timeout_ms: 2_000,
        dial_timeout_ms: 2_000,
        ..Config::default()
    }
}

async fn node_with(config: Config) -> (Mesh, Events, SocketAddr) {
    let (mesh, events) = Mesh::new(config);
    let addr = mesh.start_listening(0).await.unwrap();
    (mesh, events, addr)
}

async fn node(nick: &str) -> (Mesh, Events, SocketAddr) {
    node_with(test_config(nick)).await
}

async fn next_matching<F>(events: &mut Events, mut pred: F) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn settle_and_drain(events: &mut Events) -> Vec<MeshEvent> {
    sleep(SETTLE).await;
    let mut out = Vec::new();
    while let Ok(e) = events.try_recv() {
        out.push(e);
    }
    out
}

fn chat_count(events: &[MeshEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, MeshEvent::ChatReceived { .. }))
        .count()
}

fn is_chat(text: &'static str) -> impl FnMut(&MeshEvent) -> bool {
    move |e: &MeshEvent| matches!(e, MeshEvent::ChatReceived { text: t, .. } if t == text)
}

async fn wait_for_peer(mesh: &Mesh, node: &NodeId) {
    timeout(WAIT, async {
        loop {
            if mesh
                .connected_peers()
                .await
                .iter()
                .any(|p| p.node_id == *node)
            {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer never registered");
}

/// Connect `a` to `b` and wait until both sides have registered the link.
async fn link(a: &Mesh, b: &Mesh, b_addr: SocketAddr) {
    a.connect_to(b_addr).await.unwrap();
    wait_for_peer(b, a.node_id()).await;
}

async fn read_frame(stream: &mut TcpStream, buffer: &mut FrameBuffer) -> Message {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(m) = buffer.next_message().unwrap() {
            return m;
        }
        let n = timeout(WAIT, stream.read(&mut chunk)).await.unwrap().unwrap();
        assert!(n > 0, "node closed the connection");
        buffer.extend(&chunk[..n]);
    }
}

fn raw_announce(node: &str) -> Message {
    Message::new(
        MessageId::generate(),
        NodeId::from(node),
        node,
        Payload::HandshakeAnnounce {
            protocol_version: PROTOCOL_VERSION,
            listen_port: None,
        },
    )
}

#[tokio::test]
async fn chain_delivers_exactly_once() {
    let (a, mut a_events, _) = node("A").await;
    let (b, mut b_events, b_addr) = node("B").await;
    let (c, mut c_events, c_addr) = node("C").await;
    link(&a, &b, b_addr).await;
    link(&b, &c, c_addr).await;

    a.broadcast_with_id(Payload::Chat { text: "hi".into() }, Some(MessageId::from("m1")))
        .await
        .unwrap();

    for events in [&mut b_events, &mut c_events] {
        match next_matching(events, is_chat("hi")).await {
            MeshEvent::ChatReceived {
                sender_id,
                sender_nickname,
                ..
            } => {
                assert_eq!(sender_nickname, "A");
                assert_eq!(sender_id, *a.node_id());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(chat_count(&settle_and_drain(&mut a_events).await), 0);
    assert_eq!(chat_count(&settle_and_drain(&mut b_events).await), 0);
    assert_eq!(chat_count(&settle_and_drain(&mut c_events).await), 0);
}

#[tokio::test]
async fn triangle_suppresses_second_path() {
    let (a, mut a_events, _) = node("A").await;
    let (b, mut b_events, b_addr) = node("B").await;
    let (c, mut c_events, c_addr) = node("C").await;
    link(&a, &b, b_addr).await;
    link(&b, &c, c_addr).await;
    link(&a, &c, c_addr).await;

    a.broadcast_with_id(Payload::Chat { text: "m2".into() }, Some(MessageId::from("m2")))
        .await
        .unwrap();

    next_matching(&mut b_events, is_chat("m2")).await;
    next_matching(&mut c_events, is_chat("m2")).await;
    assert_eq!(chat_count(&settle_and_drain(&mut b_events).await), 0);
    assert_eq!(chat_count(&settle_and_drain(&mut c_events).await), 0);
    assert_eq!(chat_count(&settle_and_drain(&mut a_events).await), 0);
}

#[tokio::test]
async fn malformed_frame_drops_only_that_peer() {
    let (a, _a_events, _) = node("A").await;
    let (b, mut b_events, b_addr) = node("B").await;
    link(&a, &b, b_addr).await;

    let mut raw = TcpStream::connect(b_addr).await.unwrap();
    let mut buffer = FrameBuffer::new();
    let announce = read_frame(&mut raw, &mut buffer).await;
    assert_eq!(announce.sender_id, *b.node_id());
    raw.write_all(&encode_frame(&raw_announce("raw-client")).unwrap())
        .await
        .unwrap();

    let raw_peer = match next_matching(&mut b_events, |e| {
        matches!(e, MeshEvent::PeerConnected { info, .. } if info.node_id.as_str() == "raw-client")
    })
    .await
    {
        MeshEvent::PeerConnected { peer_id, .. } => peer_id,
        other => panic!("unexpected {other:?}"),
    };

    let mut garbage = 7u32.to_be_bytes().to_vec();
    garbage.extend_from_slice(b"garbage");
    raw.write_all(&garbage).await.unwrap();

    match next_matching(&mut b_events, |e| {
        matches!(e, MeshEvent::PeerDisconnected { peer_id, .. } if *peer_id == raw_peer)
    })
    .await
    {
        MeshEvent::PeerDisconnected { reason, .. } => {
            assert!(matches!(reason, DisconnectReason::Protocol(_)), "{reason:?}")
        }
        other => panic!("unexpected {other:?}"),
    }

    let rest = settle_and_drain(&mut b_events).await;
    assert!(!rest
        .iter()
        .any(|e| matches!(e, MeshEvent::PeerDisconnected { .. })));
    assert_eq!(b.connected_peers().await.len(), 1);

    a.send_chat("still here").await.unwrap();
    next_matching(&mut b_events, is_chat("still here")).await;
}

#[tokio::test]
async fn discovery_learns_addresses_without_dialing() {
    let (a, _a_events, a_addr) = node("A").await;
    let (b, _b_events, b_addr) = node("B").await;
    let (c, _c_events, c_addr) = node("C").await;
    let (d, _d_events, _) = node("D").await;
    link(&a, &b, b_addr).await;
    link(&c, &b, b_addr).await;
    link(&d, &b, b_addr).await;

    timeout(WAIT, async {
        loop {
            let known: Vec<SocketAddr> = d.known_peers().await.iter().map(|k| k.address).collect();
            if known.contains(&a_addr) && known.contains(&c_addr) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer list never arrived");

    sleep(SETTLE).await;
    let connected = d.connected_peers().await;
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].node_id, *b.node_id());
    let known = d.known_peers().await;
    assert!(known.iter().any(|k| k.address == b_addr && k.connected));
    assert!(known.iter().any(|k| k.address == a_addr && !k.connected));
}

#[tokio::test]
async fn silent_transport_times_out_handshake() {
    let config = Config {
        handshake_timeout_ms: 200,
        ..test_config("B")
    };
    let (b, mut b_events, b_addr) = node_with(config).await;
    let _raw = TcpStream::connect(b_addr).await.unwrap();

    match next_matching(&mut b_events, |e| matches!(e, MeshEvent::Error { .. })).await {
        MeshEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::HandshakeTimeout),
        other => panic!("unexpected {other:?}"),
    }
    assert!(b.connected_peers().await.is_empty());
}

#[tokio::test]
async fn chat_before_handshake_is_rejected() {
    let (b, mut b_events, b_addr) = node("B").await;
    let mut raw = TcpStream::connect(b_addr).await.unwrap();
    let chat = Message::new(
        MessageId::generate(),
        NodeId::from("rude"),
        "rude",
        Payload::Chat { text: "hi".into() },
    );
    raw.write_all(&encode_frame(&chat).unwrap()).await.unwrap();

    match next_matching(&mut b_events, |e| matches!(e, MeshEvent::Error { .. })).await {
        MeshEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::Protocol),
        other => panic!("unexpected {other:?}"),
    }
    let rest = settle_and_drain(&mut b_events).await;
    assert!(!rest.iter().any(|e| matches!(e, MeshEvent::Error { .. })));
    assert!(b.connected_peers().await.is_empty());
}

#[tokio::test]
async fn dial_refusals() {
    let (a, _a_events, a_addr) = node("A").await;
    let (b, _b_events, b_addr) = node("B").await;
    assert_eq!(a.local_addr().await, Some(a_addr));

    assert!(matches!(
        a.connect_to(a_addr).await,
        Err(MeshError::SelfDial(_))
    ));

    link(&a, &b, b_addr).await;
    assert!(matches!(
        a.connect_to(b_addr).await,
        Err(MeshError::AlreadyConnected(_))
    ));
    assert!(matches!(
        b.connect_to(a_addr).await,
        Err(MeshError::AlreadyConnected(_))
    ));

    let closed = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    assert!(matches!(
        a.connect_to(closed).await,
        Err(MeshError::Dial { .. })
    ));
    assert!(matches!(
        a.start_listening(0).await,
        Err(MeshError::AlreadyListening(_))
    ));
}

#[tokio::test]
async fn port_in_use_is_a_bind_error() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();
    let (mesh, _events) = Mesh::new(test_config("A"));

    let err = mesh.start_listening(port).await.unwrap_err();
    assert!(matches!(err, MeshError::Bind { port: p, .. } if p == port), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Bind);
    assert_eq!(mesh.local_addr().await, None);
}

#[tokio::test]
async fn no_chat_after_local_disconnect() {
    let (a, _a_events, _) = node("A").await;
    let (b, mut b_events, b_addr) = node("B").await;
    link(&a, &b, b_addr).await;
    let peer = b
        .connected_peers()
        .await
        .into_iter()
        .find(|p| p.node_id == *a.node_id())
        .unwrap()
        .peer_id;

    for i in 0..200 {
        a.send_chat(format!("burst {i}")).await.unwrap();
    }
    next_matching(&mut b_events, |e| matches!(e, MeshEvent::ChatReceived { .. })).await;
    b.disconnect(peer).await.unwrap();

    next_matching(&mut b_events, |e| {
        matches!(e, MeshEvent::PeerDisconnected { peer_id, .. } if *peer_id == peer)
    })
    .await;
    let rest = settle_and_drain(&mut b_events).await;
    assert_eq!(chat_count(&rest), 0, "{rest:?}");
}

#[tokio::test]
async fn handshake_finishing_after_shutdown_is_silent() {
    let (b, mut b_events, b_addr) = node("B").await;
    let mut raw = TcpStream::connect(b_addr).await.unwrap();
    let mut buffer = FrameBuffer::new();
    let theirs = read_frame(&mut raw, &mut buffer).await;
    assert_eq!(theirs.sender_id, *b.node_id());

    b.shutdown().await;
    raw.write_all(&encode_frame(&raw_announce("late")).unwrap())
        .await
        .unwrap();

    let events = settle_and_drain(&mut b_events).await;
    assert!(
        !events.iter().any(|e| matches!(e, MeshEvent::Error { .. })),
        "{events:?}"
    );
    assert!(b.connected_peers().await.is_empty());
}

#[tokio::test]
async fn disconnect_reports_both_sides() {
    let (a, mut a_events, _) = node("A").await;
    let (b, mut b_events, b_addr) = node("B").await;
    let peer = a.connect_to(b_addr).await.unwrap();
    wait_for_peer(&b, a.node_id()).await;

    a.disconnect(peer).await.unwrap();
    match next_matching(&mut a_events, |e| matches!(e, MeshEvent::PeerDisconnected { .. })).await
    {
        MeshEvent::PeerDisconnected { peer_id, reason } => {
            assert_eq!(peer_id, peer);
            assert_eq!(reason, DisconnectReason::Local);
        }
        other => panic!("unexpected {other:?}"),
    }
    match next_matching(&mut b_events, |e| matches!(e, MeshEvent::PeerDisconnected { .. })).await
    {
        // A reset instead of a clean close is possible if frames were still in flight.
        MeshEvent::PeerDisconnected { reason, .. } => assert!(
            matches!(reason, DisconnectReason::Closed | DisconnectReason::Io(_)),
            "{reason:?}"
        ),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        a.disconnect(peer).await,
        Err(MeshError::UnknownPeer(_))
    ));
    let rest = settle_and_drain(&mut a_events).await;
    assert!(!rest
        .iter()
        .any(|e| matches!(e, MeshEvent::PeerDisconnected { .. })));
    assert!(b.connected_peers().await.is_empty());
}

#[tokio::test]
async fn shutdown_closes_everything() {
    let (a, mut a_events, _) = node("A").await;
    let (b, mut b_events, b_addr) = node("B").await;
    let (c, _c_events, c_addr) = node("C").await;
    link(&a, &b, b_addr).await;
    link(&a, &c, c_addr).await;

    a.shutdown().await;
    a.shutdown().await;
    let events = settle_and_drain(&mut a_events).await;
    let disconnects = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                MeshEvent::PeerDisconnected {
                    reason: DisconnectReason::Local,
                    ..
                }
            )
        })
        .count();
    assert_eq!(disconnects, 2);
    next_matching(&mut b_events, |e| matches!(e, MeshEvent::PeerDisconnected { .. })).await;

    assert!(a.connected_peers().await.is_empty());
    assert!(matches!(a.send_chat("late").await, Err(MeshError::ShutDown)));
    assert!(matches!(
        a.connect_to(c_addr).await,
        Err(MeshError::ShutDown)
    ));
}

#[tokio::test]
async fn nickname_change_propagates() {
    let (a, _a_events, _) = node("A").await;
    let (b, mut b_events, b_addr) = node("B").await;
    let (c, mut c_events, c_addr) = node("C").await;
    link(&a, &b, b_addr).await;
    link(&b, &c, c_addr).await;

    a.change_nickname("alicia").await.unwrap();
    assert_eq!(a.nickname().await, "alicia");

    match next_matching(&mut c_events, |e| matches!(e, MeshEvent::NicknameChanged { .. })).await {
        MeshEvent::NicknameChanged {
            node_id,
            old_nickname,
            new_nickname,
        } => {
            assert_eq!(node_id, *a.node_id());
            assert_eq!(old_nickname, "A");
            assert_eq!(new_nickname, "alicia");
        }
        other => panic!("unexpected {other:?}"),
    }
    next_matching(&mut b_events, |e| matches!(e, MeshEvent::NicknameChanged { .. })).await;
    let on_b = b.connected_peers().await;
    let a_on_b = on_b.iter().find(|p| p.node_id == *a.node_id()).unwrap();
    assert_eq!(a_on_b.nickname, "alicia");
    assert_eq!(c.nickname_of(a.node_id()).await.as_deref(), Some("alicia"));

    a.send_chat("renamed").await.unwrap();
    match next_matching(&mut c_events, is_chat("renamed")).await {
        MeshEvent::ChatReceived {
            sender_nickname, ..
        } => assert_eq!(sender_nickname, "alicia"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn file_transfer_reaches_every_node() {
    let (a, _a_events, _) = node("A").await;
    let (b, mut b_events, b_addr) = node("B").await;
    let (c, mut c_events, c_addr) = node("C").await;
    link(&a, &b, b_addr).await;
    link(&b, &c, c_addr).await;

    let data: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
    a.send_file("notes.bin", data.clone()).await.unwrap();

    for events in [&mut b_events, &mut c_events] {
        match next_matching(events, |e| matches!(e, MeshEvent::FileReceived { .. })).await {
            MeshEvent::FileReceived {
                sender_nickname,
                filename,
                data: got,
                ..
            } => {
                assert_eq!(sender_nickname, "A");
                assert_eq!(filename, "notes.bin");
                assert_eq!(got, data);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn reused_message_id_is_refused() {
    let (a, _a_events, _) = node("A").await;
    let id = MessageId::from("fixed");
    a.broadcast_with_id(Payload::Chat { text: "one".into() }, Some(id.clone()))
        .await
        .unwrap();
    assert!(matches!(
        a.broadcast_with_id(Payload::Chat { text: "two".into() }, Some(id)).await,
        Err(MeshError::DuplicateMessage(_))
    ));
}
