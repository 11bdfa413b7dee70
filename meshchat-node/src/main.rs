// meshchat: terminal front end for a mesh node. Lines on stdin are chat; slash commands below.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use meshchat_core::{MeshEvent, PeerId};
use meshchat_node::{config, Config, Mesh};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
/help                   show this help
/nick <name>            change nickname
/peers                  list connected and known peers
/connect <ip> <port>    connect to a peer (also <ip:port>)
/disconnect <peer>      drop a connected peer by number
/send <path>            send a file to the mesh
/exit                   quit";

#[derive(Debug, Parser)]
#[command(name = "meshchat", version, about = "Peer-to-peer mesh chat")]
struct Args {
    /// Config file; default ~/.config/meshchat/config.toml then /etc/meshchat/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    /// TCP listen port.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    nick: Option<String>,
    /// Peer to dial at start-up (repeatable).
    #[arg(long, value_name = "ADDR")]
    connect: Vec<SocketAddr>,
    /// Do not accept inbound connections.
    #[arg(long)]
    no_listen: bool,
    /// Save received files here.
    #[arg(long)]
    download_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut cfg = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    if let Some(port) = args.port {
        cfg.listen_port = port;
    }
    if let Some(nick) = args.nick {
        cfg.nickname = Some(nick);
    }
    if let Some(dir) = args.download_dir {
        cfg.download_dir = Some(dir);
    }
    cfg.peers.extend(args.connect);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, !args.no_listen))
}

async fn run(cfg: Config, listen: bool) -> anyhow::Result<()> {
    let port = cfg.listen_port;
    let bootstrap = cfg.peers.clone();
    let download_dir = cfg.download_dir.clone();
    let (mesh, mut events) = Mesh::new(cfg);

    if listen {
        let addr = mesh
            .start_listening(port)
            .await
            .with_context(|| format!("cannot listen on port {port}"))?;
        tracing::info!(%addr, nickname = %mesh.nickname().await, "ready");
    }
    for addr in bootstrap {
        connect(&mesh, addr).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                tracing::info!("shutdown requested");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&mesh, line.trim()).await {
                        break;
                    }
                }
                None => {
                    tracing::info!("stdin closed");
                    break;
                }
            },
            Some(event) = events.recv() => report(event, download_dir.as_deref()).await,
        }
    }

    mesh.shutdown().await;
    while let Ok(event) = events.try_recv() {
        report(event, download_dir.as_deref()).await;
    }
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line(mesh: &Mesh, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (command, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };
    match command {
        "/exit" | "/quit" => return false,
        "/help" => println!("{HELP}"),
        "/nick" if !rest.is_empty() => match mesh.change_nickname(rest).await {
            Ok(_) => println!("* you are now {rest}"),
            Err(e) => tracing::warn!(error = %e, "nickname change failed"),
        },
        "/peers" => list_peers(mesh).await,
        "/connect" => match parse_addr(rest) {
            Some(addr) => connect(mesh, addr).await,
            None => println!("usage: /connect <ip> <port>"),
        },
        "/disconnect" => match rest.trim_start_matches('#').parse::<u64>() {
            Ok(n) => {
                if let Err(e) = mesh.disconnect(PeerId(n)).await {
                    println!("* {e}");
                }
            }
            Err(_) => println!("usage: /disconnect <peer>"),
        },
        "/send" if !rest.is_empty() => match mesh.send_file_from_path(Path::new(rest)).await {
            Ok(_) => println!("* sent {rest}"),
            Err(e) => tracing::warn!(error = %e, "file send failed"),
        },
        c if c.starts_with('/') => println!("unknown command {c}; /help lists commands"),
        _ => {
            if let Err(e) = mesh.send_chat(line).await {
                tracing::warn!(error = %e, "chat send failed");
            }
        }
    }
    true
}

fn parse_addr(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse() {
        return Some(addr);
    }
    let (ip, port) = s.split_once(' ')?;
    Some(SocketAddr::new(ip.trim().parse().ok()?, port.trim().parse().ok()?))
}

async fn connect(mesh: &Mesh, addr: SocketAddr) {
    if let Err(e) = mesh.connect_to(addr).await {
        tracing::warn!(%addr, kind = ?e.kind(), error = %e, "connect failed");
    }
}

async fn list_peers(mesh: &Mesh) {
    match mesh.local_addr().await {
        Some(addr) => println!("{} listening on {addr}", mesh.nickname().await),
        None => println!("{} (not listening)", mesh.nickname().await),
    }
    let connected = mesh.connected_peers().await;
    println!("connected ({}):", connected.len());
    for p in &connected {
        let addr = p
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| format!("{} (not listening)", p.remote_addr));
        println!("  {} {} {} {:?}", p.peer_id, p.nickname, addr, p.direction);
    }
    let known = mesh.known_peers().await;
    println!("known ({}):", known.len());
    for k in known {
        println!(
            "  {}{}",
            k.address,
            if k.connected { " (connected)" } else { "" }
        );
    }
}

async fn report(event: MeshEvent, download_dir: Option<&Path>) {
    match event {
        MeshEvent::ChatReceived {
            sender_nickname,
            text,
            ..
        } => println!("<{sender_nickname}> {text}"),
        MeshEvent::NicknameChanged {
            old_nickname,
            new_nickname,
            ..
        } => println!("* {old_nickname} is now {new_nickname}"),
        MeshEvent::FileReceived {
            sender_nickname,
            filename,
            data,
            ..
        } => {
            println!("* {sender_nickname} sent {filename} ({} bytes)", data.len());
            if let Some(dir) = download_dir {
                save_file(dir, &filename, &data).await;
            }
        }
        MeshEvent::PeerConnected { peer_id, info } => {
            tracing::info!(peer = %peer_id, nickname = %info.nickname, "connected")
        }
        MeshEvent::PeerDisconnected { peer_id, reason } => {
            tracing::info!(peer = %peer_id, %reason, "disconnected")
        }
        MeshEvent::Error { kind, detail } => tracing::warn!(?kind, %detail, "mesh error"),
    }
}

/// Write under `dir` using only the base name the sender supplied.
async fn save_file(dir: &Path, filename: &str, data: &[u8]) {
    let Some(name) = Path::new(filename).file_name() else {
        tracing::warn!(%filename, "refusing to save file without a name");
        return;
    };
    let path = dir.join(name);
    match tokio::fs::write(&path, data).await {
        Ok(()) => println!("* saved {}", path.display()),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "saving file failed"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
