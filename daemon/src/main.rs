//! veild — entry point for running a VEIL node.
//!
//! The daemon owns everything the reactor core deliberately does not:
//! sockets, timers, the UDP beacon, the dev PoW solver, and persistence
//! flushes. All of it funnels into the node as [`NodeEvent`]s and applies
//! the returned [`NodeAction`]s.

mod engine;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use ed25519_dalek::SigningKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use veil_messages::WireMessage;
use veil_network::{run_beacon, BeaconPayload};
use veil_node::events::{NodeAction, NodeEvent, TimerKind};
use veil_node::peer::PeerId;
use veil_node::shutdown::Shutdown;
use veil_node::{Node, NodeCallbacks, NodeConfig};
use veil_protocol::{encode_frame, FrameBuffer};
use veil_store::{BbsStore, MemoryStore, PeerStore};
use veil_types::Timestamp;

use crate::engine::DevEngine;

/// Dev solver: pretend PoW takes this long.
const FAKE_POW_SOLVE_MS: u64 = 15_000;

#[derive(Parser)]
#[command(name = "veild", about = "VEIL node daemon")]
struct Cli {
    /// Path to a TOML configuration file. CLI flags override it.
    #[arg(long, env = "VEIL_CONFIG")]
    config: Option<PathBuf>,

    /// P2P listen address.
    #[arg(long, env = "VEIL_LISTEN")]
    listen: Option<SocketAddr>,

    /// Peers to dial at startup (comma-separated).
    #[arg(long, env = "VEIL_CONNECT", value_delimiter = ',')]
    connect: Vec<SocketAddr>,

    /// Number of mining threads; 0 disables mining.
    #[arg(long, env = "VEIL_MINING_THREADS")]
    mining_threads: Option<usize>,

    /// Number of verification worker threads.
    #[arg(long, env = "VEIL_VERIFICATION_THREADS")]
    verification_threads: Option<usize>,
}

/// Everything the connection tasks report back to the main loop.
enum IoEvent {
    /// A connection finished its nonce exchange and is ready for traffic.
    Ready {
        peer: PeerId,
        addr: SocketAddr,
        inbound: bool,
        nonce: [u8; 32],
        writer: mpsc::UnboundedSender<WireMessage>,
    },
    Node(NodeEvent),
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    veil_utils::init_tracing();
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => NodeConfig::from_toml_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if !cli.connect.is_empty() {
        cfg.connect = cli.connect.clone();
    }
    if let Some(threads) = cli.mining_threads {
        cfg.mining_threads = threads;
    }
    if let Some(threads) = cli.verification_threads {
        cfg.verification_threads = threads;
    }

    let store = Arc::new(MemoryStore::new());
    let engine = DevEngine::new(Arc::clone(&store), cfg.horizon);
    let identity = SigningKey::from_bytes(&rand::random::<[u8; 32]>());

    let mut callbacks = NodeCallbacks::new();
    callbacks.on_sync_progress = Some(Box::new(|p| {
        tracing::info!(done = p.done, total = p.total, "sync progress");
    }));
    callbacks.on_sync_error = Some(Box::new(|e| {
        tracing::error!(?e, "sync error");
    }));

    let mut node = Node::new(cfg.clone(), engine, callbacks, identity);
    node.restore_peers(&store.iter_peers()?, now_ms() / 1000);
    node.load_bbs(store.all_msgs()?, Timestamp::now());

    tracing::info!(listen = %cfg.listen, node_id = %node.node_id(), "starting veild");

    let (io_tx, mut io_rx) = mpsc::channel::<IoEvent>(4096);
    let peer_ids = Arc::new(AtomicU64::new(1));
    let mut writers: HashMap<PeerId, mpsc::UnboundedSender<WireMessage>> = HashMap::new();

    // Shutdown.
    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { shutdown.listen_for_signals().await });
    }
    let mut stop = shutdown.token();

    // Acceptor.
    let listener = TcpListener::bind(cfg.listen).await?;
    {
        let io_tx = io_tx.clone();
        let peer_ids = Arc::clone(&peer_ids);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        spawn_connection(stream, addr, true, &peer_ids, io_tx.clone())
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
    }

    // Beacon.
    if cfg.beacon_period_ms > 0 {
        let beacon_port = if cfg.beacon_port != 0 {
            cfg.beacon_port
        } else {
            cfg.listen.port()
        };
        let payload = BeaconPayload {
            node_id: node.node_id(),
            listen_port: cfg.listen.port(),
        };
        let period = Duration::from_millis(cfg.beacon_period_ms);
        let (beacon_tx, mut beacon_rx) = mpsc::channel(64);
        match UdpSocket::bind(("0.0.0.0", beacon_port)).await {
            Ok(socket) => {
                tokio::spawn(async move {
                    if let Err(e) = run_beacon(socket, beacon_port, payload, period, beacon_tx).await
                    {
                        tracing::warn!(error = %e, "beacon stopped");
                    }
                });
                let io_tx = io_tx.clone();
                tokio::spawn(async move {
                    while let Some(peer) = beacon_rx.recv().await {
                        let event = NodeEvent::BeaconRx {
                            node_id: peer.node_id,
                            addr: peer.addr,
                        };
                        if io_tx.send(IoEvent::Node(event)).await.is_err() {
                            return;
                        }
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, port = beacon_port, "beacon bind failed"),
        }
    }

    // Bootstrap dials.
    for addr in cfg.connect.clone() {
        dial(addr, &peer_ids, io_tx.clone());
    }

    // Timers.
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    let mut peers_update = tokio::time::interval(Duration::from_millis(cfg.timeouts.peers_update_ms));
    let mut peers_flush = tokio::time::interval(Duration::from_millis(cfg.timeouts.peers_flush_ms));
    let mut peers_resend = tokio::time::interval(Duration::from_millis(cfg.timeouts.peers_resend_ms));
    let mut bbs_cleanup = tokio::time::interval(Duration::from_millis(cfg.bbs.cleanup_period_ms));
    let mut miner_restart =
        tokio::time::interval(Duration::from_millis(cfg.timeouts.mining_soft_restart_ms));
    let mut last_dispatched_job = 0u64;

    loop {
        let (event, timer) = tokio::select! {
            _ = stop.wait() => break,
            maybe = io_rx.recv() => match maybe {
                Some(event) => (Some(event), None),
                None => break,
            },
            _ = tick.tick() => (None, Some(TimerKind::Tick)),
            _ = peers_update.tick() => (None, Some(TimerKind::PeersUpdate)),
            _ = peers_flush.tick() => (None, Some(TimerKind::PeersFlush)),
            _ = peers_resend.tick() => (None, Some(TimerKind::PeersResend)),
            _ = bbs_cleanup.tick() => (None, Some(TimerKind::BbsCleanup)),
            _ = miner_restart.tick() => (None, Some(TimerKind::MinerRestart)),
        };

        let now = now_ms();
        let actions = match (event, timer) {
            (Some(IoEvent::Ready { peer, addr, inbound, nonce, writer }), _) => {
                writers.insert(peer, writer);
                node.handle_event(
                    NodeEvent::PeerConnected {
                        peer,
                        addr,
                        inbound,
                        channel_nonce: nonce,
                    },
                    now,
                )
            }
            (Some(IoEvent::Node(event)), _) => node.handle_event(event, now),
            (None, Some(kind)) => {
                if kind == TimerKind::PeersFlush {
                    flush_state(&node, &store);
                }
                node.handle_event(NodeEvent::Timer(kind), now)
            }
            (None, None) => Vec::new(),
        };

        for action in actions {
            match action {
                NodeAction::Send { peer, msg } => {
                    if let Some(writer) = writers.get(&peer) {
                        let _ = writer.send(msg);
                    }
                }
                NodeAction::Disconnect { peer, .. } => {
                    writers.remove(&peer);
                }
                NodeAction::Dial { addr } => dial(addr, &peer_ids, io_tx.clone()),
            }
        }

        // Hand fresh mining jobs to the dev solver.
        if let Some(job) = node.miner_job() {
            if job.job_id != last_dispatched_job {
                last_dispatched_job = job.job_id;
                let job = job.clone();
                let io_tx = io_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(FAKE_POW_SOLVE_MS)).await;
                    if job.stop.load(Ordering::Relaxed) {
                        return;
                    }
                    let event = NodeEvent::MinedSolution {
                        job_id: job.job_id,
                        pow_nonce: rand::random(),
                    };
                    let _ = io_tx.send(IoEvent::Node(event)).await;
                });
            }
        }
    }

    flush_state(&node, &store);
    tracing::info!("veild exited cleanly");
    Ok(())
}

/// Persist the peer cache and BBS history.
fn flush_state<P: veil_node::Processor>(node: &Node<P>, store: &MemoryStore) {
    for (addr, rating, last_seen) in node.peer_manager().snapshot() {
        if let Err(e) = store.put_peer(addr, rating, last_seen) {
            tracing::warn!(error = %e, "peer cache flush failed");
            return;
        }
    }
    for record in node.bbs().records() {
        if let Err(e) = store.save_msg(&record) {
            tracing::warn!(error = %e, "bbs flush failed");
            return;
        }
    }
}

fn dial(addr: SocketAddr, peer_ids: &Arc<AtomicU64>, io_tx: mpsc::Sender<IoEvent>) {
    let peer_ids = Arc::clone(peer_ids);
    tokio::spawn(async move {
        match tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => spawn_connection(stream, addr, false, &peer_ids, io_tx),
            Ok(Err(e)) => tracing::debug!(%addr, error = %e, "dial failed"),
            Err(_) => tracing::debug!(%addr, "dial timed out"),
        }
    });
}

/// Complete the nonce exchange, then run the read and write loops.
///
/// Each side sends 32 random bytes before any framed traffic; the shared
/// channel nonce both sides sign in `Authentication` is the XOR of the two.
fn spawn_connection(
    stream: TcpStream,
    addr: SocketAddr,
    inbound: bool,
    peer_ids: &Arc<AtomicU64>,
    io_tx: mpsc::Sender<IoEvent>,
) {
    let peer = PeerId(peer_ids.fetch_add(1, Ordering::Relaxed));
    tokio::spawn(async move {
        let (mut reader, mut writer_half) = stream.into_split();

        let ours: [u8; 32] = rand::random();
        if writer_half.write_all(&ours).await.is_err() {
            return;
        }
        let mut theirs = [0u8; 32];
        if reader.read_exact(&mut theirs).await.is_err() {
            return;
        }
        let mut nonce = [0u8; 32];
        for i in 0..32 {
            nonce[i] = ours[i] ^ theirs[i];
        }

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WireMessage>();
        if io_tx
            .send(IoEvent::Ready {
                peer,
                addr,
                inbound,
                nonce,
                writer: writer_tx,
            })
            .await
            .is_err()
        {
            return;
        }

        // Write loop: drain queued messages and report flushed bytes.
        let write_io = io_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                let frame = match encode_frame(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "frame encode failed");
                        continue;
                    }
                };
                if writer_half.write_all(&frame).await.is_err() {
                    break;
                }
                let drained = NodeEvent::OutboundDrained {
                    peer,
                    bytes: frame.len(),
                };
                if write_io.send(IoEvent::Node(drained)).await.is_err() {
                    break;
                }
            }
            // Sender dropped or socket failed: flush and close.
            let _ = writer_half.shutdown().await;
        });

        // Read loop: reassemble frames into messages.
        let mut frames = FrameBuffer::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    frames.extend(&buf[..n]);
                    loop {
                        match frames.next_message() {
                            Ok(Some(msg)) => {
                                let event = NodeEvent::Message { from: peer, msg };
                                if io_tx.send(IoEvent::Node(event)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(%peer, error = %e, "bad frame from peer");
                                let _ = io_tx
                                    .send(IoEvent::Node(NodeEvent::PeerDisconnected { peer }))
                                    .await;
                                return;
                            }
                        }
                    }
                }
            }
        }
        let _ = io_tx
            .send(IoEvent::Node(NodeEvent::PeerDisconnected { peer }))
            .await;
    });
}
