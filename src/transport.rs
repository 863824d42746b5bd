//! # Broadcast Transport Layer
//!
//! The relay core never talks to a socket directly. It drives a
//! [`WorldTransport`] capability: join a connection to a world, fan an event
//! out to a world's members, or deliver a sender-only notice. Keeping the
//! seam here lets the session tests substitute an in-process transport for
//! the real network.
//!
//! ## Implementations
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`MemoryTransport`] | In-process fake for tests and embedding |
//! | [`WsTransport`] | Production WebSocket listener |
//!
//! ## Semantics
//!
//! - Membership is owned by the transport. `join` is idempotent; there is no
//!   explicit leave, the transport clears membership when a connection
//!   closes.
//! - Delivery is best effort. A member that disconnected by the time a
//!   broadcast executes is skipped silently; one dead recipient never fails
//!   the fan-out.
//!
//! ## Locking
//!
//! Both implementations keep membership and per-connection senders behind a
//! std `Mutex` that is never held across an await: frames to deliver are
//! collected under the lock and pushed to per-connection queues after it is
//! released.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::identity::{ConnId, WorldKey};
use crate::messages::{ServerEvent, MAX_FRAME_SIZE};
use crate::session::Relay;

/// Capability interface the relay core fans out through.
#[async_trait]
pub trait WorldTransport: Send + Sync + 'static {
    /// Add a connection to a world's broadcast group. Idempotent.
    async fn join(&self, conn: ConnId, world: &WorldKey);

    /// Deliver an event to every current member of a world, skipping
    /// `exclude` when given. Best effort: dead members are skipped.
    async fn broadcast(
        &self,
        world: &WorldKey,
        event: &ServerEvent,
        exclude: Option<ConnId>,
    );

    /// Deliver an event to a single connection. Best effort.
    async fn send(&self, conn: ConnId, event: &ServerEvent);

    /// Current member count of a world.
    async fn occupancy(&self, world: &WorldKey) -> usize;
}

// ============================================================================
// MemoryTransport (in-process fake)
// ============================================================================

#[derive(Default)]
struct MemoryState {
    worlds: HashMap<WorldKey, HashSet<ConnId>>,
    peers: HashMap<ConnId, mpsc::UnboundedSender<String>>,
}

/// In-process transport: membership plus an unbounded frame queue per
/// connection. Tests open a connection, drive the relay, and assert on the
/// frames that land in the queue.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiving end of its delivery
    /// queue.
    pub fn open(&self, conn: ConnId) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().expect("memory transport lock");
        state.peers.insert(conn, tx);
        rx
    }

    /// Drop a connection: delivery queue and all world memberships. This is
    /// the transport-managed leave that happens when a socket closes.
    pub fn close(&self, conn: ConnId) {
        let mut state = self.state.lock().expect("memory transport lock");
        state.peers.remove(&conn);
        for members in state.worlds.values_mut() {
            members.remove(&conn);
        }
        state.worlds.retain(|_, members| !members.is_empty());
    }
}

#[async_trait]
impl WorldTransport for MemoryTransport {
    async fn join(&self, conn: ConnId, world: &WorldKey) {
        let mut state = self.state.lock().expect("memory transport lock");
        state.worlds.entry(world.clone()).or_default().insert(conn);
    }

    async fn broadcast(
        &self,
        world: &WorldKey,
        event: &ServerEvent,
        exclude: Option<ConnId>,
    ) {
        let frame = event.encode();
        let targets: Vec<mpsc::UnboundedSender<String>> = {
            let state = self.state.lock().expect("memory transport lock");
            let Some(members) = state.worlds.get(world) else {
                return;
            };
            members
                .iter()
                .filter(|conn| Some(**conn) != exclude)
                .filter_map(|conn| state.peers.get(conn).cloned())
                .collect()
        };

        for tx in targets {
            // Receiver dropped means the member is gone: skip silently.
            let _ = tx.send(frame.clone());
        }
    }

    async fn send(&self, conn: ConnId, event: &ServerEvent) {
        let tx = {
            let state = self.state.lock().expect("memory transport lock");
            state.peers.get(&conn).cloned()
        };
        if let Some(tx) = tx {
            let _ = tx.send(event.encode());
        }
    }

    async fn occupancy(&self, world: &WorldKey) -> usize {
        let state = self.state.lock().expect("memory transport lock");
        state.worlds.get(world).map_or(0, HashSet::len)
    }
}

// ============================================================================
// WsTransport (production WebSocket listener)
// ============================================================================

struct WsState {
    worlds: HashMap<WorldKey, HashSet<ConnId>>,
    peers: HashMap<ConnId, mpsc::UnboundedSender<Message>>,
}

/// WebSocket transport: one accept loop, one reader/writer task pair per
/// connection, membership owned here.
///
/// The handshake enforces the configured origin allow-list and captures the
/// `X-Forwarded-For` chain so the relay can resolve world keys behind
/// proxies.
pub struct WsTransport {
    state: Mutex<WsState>,
    config: RelayConfig,
}

impl WsTransport {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WsState {
                worlds: HashMap::new(),
                peers: HashMap::new(),
            }),
            config,
        })
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address (useful when binding port 0) and the loop's task handle.
    pub async fn bind(
        self: &Arc<Self>,
        bind: SocketAddr,
        relay: Relay,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        let addr = listener.local_addr().context("listener local_addr")?;
        info!(addr = %addr, "websocket listener ready");

        let transport = self.clone();
        let handle = tokio::spawn(async move {
            transport.accept_loop(listener, relay).await;
        });

        Ok((addr, handle))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, relay: Relay) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let transport = self.clone();
                    let relay = relay.clone();
                    tokio::spawn(async move {
                        if let Err(err) =
                            transport.handle_client(stream, peer_addr, relay).await
                        {
                            debug!(client = %peer_addr, error = %err, "client error");
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                }
            }
        }
    }

    async fn handle_client(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        relay: Relay,
    ) -> Result<()> {
        let mut forwarded: Option<String> = None;
        let allowed = &self.config;

        let callback = |req: &Request, resp: Response| {
            if let Some(origin) = req
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok())
            {
                if !allowed.origin_allowed(origin) {
                    debug!(client = %peer_addr, origin = %origin, "origin refused");
                    let mut reject =
                        ErrorResponse::new(Some("origin not allowed".to_string()));
                    *reject.status_mut() = StatusCode::FORBIDDEN;
                    return Err(reject);
                }
            }

            forwarded = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(String::from);

            Ok(resp)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .context("websocket handshake failed")?;

        let conn = ConnId::generate().context("connection id entropy unavailable")?;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        {
            let mut state = self.state.lock().expect("ws transport lock");
            state.peers.insert(conn, out_tx);
        }

        // The transport-reported address is the bare IP: the ephemeral port
        // must not split clients behind one NAT into different worlds.
        relay
            .connect(conn, forwarded, peer_addr.ip().to_string())
            .await;

        let (mut sink, mut source) = ws.split();

        loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(msg) => {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        // Transport state dropped the sender: shutting down.
                        None => break,
                    }
                }
                inbound = source.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > MAX_FRAME_SIZE {
                                trace!(conn = %conn, len = text.len(), "dropping oversized frame");
                                continue;
                            }
                            relay.inbound(conn, text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            // Binary/ping/pong frames are not part of the
                            // protocol; tungstenite answers pings itself.
                        }
                        Some(Err(err)) => {
                            trace!(conn = %conn, error = %err, "websocket read error");
                            break;
                        }
                    }
                }
            }
        }

        // Transport-managed leave happens before the relay learns about the
        // disconnect, so the user-left notice cannot reach the departed peer.
        self.drop_connection(conn);
        relay.disconnect(conn).await;

        Ok(())
    }

    fn drop_connection(&self, conn: ConnId) {
        let mut state = self.state.lock().expect("ws transport lock");
        state.peers.remove(&conn);
        for members in state.worlds.values_mut() {
            members.remove(&conn);
        }
        state.worlds.retain(|_, members| !members.is_empty());
    }
}

#[async_trait]
impl WorldTransport for WsTransport {
    async fn join(&self, conn: ConnId, world: &WorldKey) {
        let mut state = self.state.lock().expect("ws transport lock");
        state.worlds.entry(world.clone()).or_default().insert(conn);
    }

    async fn broadcast(
        &self,
        world: &WorldKey,
        event: &ServerEvent,
        exclude: Option<ConnId>,
    ) {
        let frame = event.encode();
        let targets: Vec<mpsc::UnboundedSender<Message>> = {
            let state = self.state.lock().expect("ws transport lock");
            let Some(members) = state.worlds.get(world) else {
                return;
            };
            members
                .iter()
                .filter(|conn| Some(**conn) != exclude)
                .filter_map(|conn| state.peers.get(conn).cloned())
                .collect()
        };

        for tx in targets {
            let _ = tx.send(Message::Text(frame.clone()));
        }
    }

    async fn send(&self, conn: ConnId, event: &ServerEvent) {
        let tx = {
            let state = self.state.lock().expect("ws transport lock");
            state.peers.get(&conn).cloned()
        };
        if let Some(tx) = tx {
            let _ = tx.send(Message::Text(event.encode()));
        }
    }

    async fn occupancy(&self, world: &WorldKey) -> usize {
        let state = self.state.lock().expect("ws transport lock");
        state.worlds.get(world).map_or(0, HashSet::len)
    }
}
