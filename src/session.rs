//! # Relay Sessions with Actor-based Orchestration
//!
//! One actor owns every connection's lifecycle and all mutable relay state.
//! The transport feeds connect, message, and disconnect events into a single
//! command channel; the actor processes them strictly one at a time in
//! arrival order, so the sessions map and the rate limiter need no locking.
//!
//! ## Architecture
//!
//! - [`Relay`]: the public handle (cheap to clone, used by transports)
//! - `RelayActor`: owns all state, processes events sequentially
//! - `RelayEvent`: events sent from handles to the actor
//!
//! ## Connection Lifecycle
//!
//! connect: resolve the world key from the forwarded chain or transport
//! address, join the world, log occupancy. message: optional moderation,
//! then the rate limiter decides between world-wide fan-out of `new-thought`
//! and a sender-only `error-msg`. disconnect: fan out `user-left` exactly
//! once, then release the connection's rate-limit window.
//!
//! ## Moderation Suspension
//!
//! When a guard is configured, classification is the only suspension point
//! in the message path. The actor never awaits the guard inline: it spawns
//! the check and the verdict re-enters the event channel as
//! `RelayEvent::Moderated`. Other connections' events interleave freely
//! during the check, and a verdict arriving after its sender disconnected is
//! discarded because the session lookup is re-run when the verdict lands.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::identity::{ConnId, WorldKey};
use crate::messages::{ClientEvent, RejectReason, ServerEvent};
use crate::moderation::{ModerationGuard, ModerationPolicy};
use crate::ratelimit::RateLimiter;
use crate::router::WorldRouter;
use crate::transport::WorldTransport;

/// Event channel depth. Transports back-pressure on a full relay rather
/// than buffering unboundedly.
const EVENT_CHANNEL_DEPTH: usize = 1024;

// ============================================================================
// Events sent from handles to the actor
// ============================================================================

enum RelayEvent {
    Connect {
        conn: ConnId,
        forwarded: Option<String>,
        transport_addr: String,
    },
    Inbound {
        conn: ConnId,
        raw: String,
    },
    /// A spawned moderation check resolved.
    Moderated {
        conn: ConnId,
        fields: Map<String, Value>,
        verdict: anyhow::Result<bool>,
    },
    Disconnect {
        conn: ConnId,
    },
    Telemetry {
        reply: oneshot::Sender<RelayTelemetry>,
    },
}

/// Point-in-time counters for the telemetry log.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayTelemetry {
    /// Live sessions.
    pub sessions: usize,
    /// Distinct worlds with at least one live session.
    pub worlds: usize,
    /// Connections with a tracked rate window.
    pub rate_tracked: usize,
}

// ============================================================================
// Relay Handle (public API - cheap to clone)
// ============================================================================

/// Handle to the relay actor. Cheap to clone; transports hold one per
/// listener and call it from per-connection tasks.
#[derive(Clone)]
pub struct Relay {
    event_tx: mpsc::Sender<RelayEvent>,
}

impl Relay {
    /// Spawn the relay actor over a transport.
    ///
    /// `guard` enables moderation; `None` matches the reference deployment.
    pub fn spawn<T: WorldTransport>(
        transport: Arc<T>,
        config: &RelayConfig,
        guard: Option<Arc<dyn ModerationGuard>>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);

        let actor = RelayActor {
            router: WorldRouter::new(transport),
            sessions: HashMap::new(),
            limiter: RateLimiter::new(config.rate_window, config.rate_max_in_window),
            guard,
            moderation_policy: config.moderation_policy,
            event_tx: event_tx.clone(),
        };
        tokio::spawn(actor.run(event_rx));

        Self { event_tx }
    }

    /// A connection was accepted by the transport.
    pub async fn connect(
        &self,
        conn: ConnId,
        forwarded: Option<String>,
        transport_addr: String,
    ) {
        let _ = self
            .event_tx
            .send(RelayEvent::Connect {
                conn,
                forwarded,
                transport_addr,
            })
            .await;
    }

    /// A text frame arrived from a connection.
    pub async fn inbound(&self, conn: ConnId, raw: String) {
        let _ = self.event_tx.send(RelayEvent::Inbound { conn, raw }).await;
    }

    /// A connection closed. The transport has already cleared its
    /// membership, so the departure notice cannot echo back to it.
    pub async fn disconnect(&self, conn: ConnId) {
        let _ = self.event_tx.send(RelayEvent::Disconnect { conn }).await;
    }

    /// Snapshot the relay's counters.
    pub async fn telemetry(&self) -> RelayTelemetry {
        let (tx, rx) = oneshot::channel();
        if self
            .event_tx
            .send(RelayEvent::Telemetry { reply: tx })
            .await
            .is_err()
        {
            return RelayTelemetry::default();
        }
        rx.await.unwrap_or_default()
    }
}

// ============================================================================
// Relay Actor (owns all state, processes events sequentially)
// ============================================================================

/// Per-connection state. The world key is resolved once at connect time and
/// immutable for the connection's lifetime.
struct SessionState {
    world: WorldKey,
}

struct RelayActor<T: WorldTransport> {
    router: WorldRouter<T>,
    sessions: HashMap<ConnId, SessionState>,
    limiter: RateLimiter,
    guard: Option<Arc<dyn ModerationGuard>>,
    moderation_policy: ModerationPolicy,
    /// Handle back into our own channel for re-enqueueing moderation
    /// verdicts.
    event_tx: mpsc::Sender<RelayEvent>,
}

impl<T: WorldTransport> RelayActor<T> {
    async fn run(mut self, mut event_rx: mpsc::Receiver<RelayEvent>) {
        while let Some(event) = event_rx.recv().await {
            match event {
                RelayEvent::Connect {
                    conn,
                    forwarded,
                    transport_addr,
                } => {
                    self.handle_connect(conn, forwarded, transport_addr).await;
                }
                RelayEvent::Inbound { conn, raw } => {
                    self.handle_inbound(conn, raw).await;
                }
                RelayEvent::Moderated {
                    conn,
                    fields,
                    verdict,
                } => {
                    self.handle_moderated(conn, fields, verdict).await;
                }
                RelayEvent::Disconnect { conn } => {
                    self.handle_disconnect(conn).await;
                }
                RelayEvent::Telemetry { reply } => {
                    let _ = reply.send(self.telemetry());
                }
            }
        }
        debug!("relay actor shutting down");
    }

    async fn handle_connect(
        &mut self,
        conn: ConnId,
        forwarded: Option<String>,
        transport_addr: String,
    ) {
        let world = WorldKey::resolve(forwarded.as_deref(), &transport_addr);

        // Raw addressing information stays at debug level (privacy).
        debug!(
            conn = %conn,
            forwarded = forwarded.as_deref().unwrap_or("-"),
            addr = %transport_addr,
            "resolving world for new connection"
        );

        self.router.join(conn, &world).await;
        self.sessions.insert(conn, SessionState { world: world.clone() });

        let occupancy = self.router.occupancy(&world).await;
        info!(
            conn = %conn,
            world = %world,
            occupancy = occupancy,
            "new signal assigned to world"
        );
    }

    async fn handle_inbound(&mut self, conn: ConnId, raw: String) {
        if !self.sessions.contains_key(&conn) {
            // Frame raced a disconnect; nothing to do.
            trace!(conn = %conn, "dropping frame from unknown connection");
            return;
        }

        let Some(event) = ClientEvent::decode(&raw) else {
            trace!(conn = %conn, "dropping unroutable frame");
            return;
        };

        let text = event.text().map(str::to_string);
        let ClientEvent::BroadcastThought(fields) = event;

        match (&self.guard, text) {
            (Some(guard), Some(text)) => {
                self.spawn_moderation(conn, guard.clone(), text, fields);
            }
            // No guard, or a payload with nothing to classify: payloads
            // forward as-is, field checks are not this relay's job.
            _ => self.gate_and_forward(conn, fields).await,
        }
    }

    /// Run the moderation check off the event loop. The verdict re-enters
    /// the channel as `Moderated`, where session liveness is re-validated.
    fn spawn_moderation(
        &self,
        conn: ConnId,
        guard: Arc<dyn ModerationGuard>,
        text: String,
        fields: Map<String, Value>,
    ) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let verdict = guard.is_toxic(&text).await;
            // An actor that shut down while the check was in flight just
            // drops the verdict, same as a disconnect would.
            let _ = event_tx
                .send(RelayEvent::Moderated {
                    conn,
                    fields,
                    verdict,
                })
                .await;
        });
    }

    async fn handle_moderated(
        &mut self,
        conn: ConnId,
        fields: Map<String, Value>,
        verdict: anyhow::Result<bool>,
    ) {
        if !self.sessions.contains_key(&conn) {
            debug!(conn = %conn, "discarding moderation verdict for dead connection");
            return;
        }

        match verdict {
            Ok(true) => {
                // Moderation rejection consumes no rate-limit slot.
                warn!(conn = %conn, reason = %RejectReason::ContentRejected, "thought blocked");
                self.router
                    .send(
                        conn,
                        ServerEvent::ErrorMsg {
                            reason: RejectReason::ContentRejected,
                        },
                    )
                    .await;
            }
            Ok(false) => self.gate_and_forward(conn, fields).await,
            Err(err) => {
                warn!(conn = %conn, error = %err, "moderation guard unavailable");
                if self.moderation_policy.admit_on_error() {
                    self.gate_and_forward(conn, fields).await;
                } else {
                    self.router
                        .send(
                            conn,
                            ServerEvent::ErrorMsg {
                                reason: RejectReason::ContentRejected,
                            },
                        )
                        .await;
                }
            }
        }
    }

    /// Rate-limit gate, then world-wide fan-out or sender-only rejection.
    async fn gate_and_forward(&mut self, conn: ConnId, fields: Map<String, Value>) {
        let Some(session) = self.sessions.get(&conn) else {
            return;
        };
        let world = session.world.clone();

        if self.limiter.admit(conn, Instant::now()) {
            self.router
                .broadcast(
                    &world,
                    ServerEvent::NewThought {
                        sender: conn,
                        fields,
                    },
                    None,
                )
                .await;
        } else {
            warn!(conn = %conn, world = %world, reason = %RejectReason::RateLimited, "thought rejected");
            self.router
                .send(
                    conn,
                    ServerEvent::ErrorMsg {
                        reason: RejectReason::RateLimited,
                    },
                )
                .await;
        }
    }

    async fn handle_disconnect(&mut self, conn: ConnId) {
        let Some(session) = self.sessions.remove(&conn) else {
            trace!(conn = %conn, "disconnect for unknown connection");
            return;
        };

        // The transport has already cleared the departing connection's
        // membership; the exclusion covers transports that clear it after
        // notifying the relay instead.
        self.router
            .broadcast(
                &session.world,
                ServerEvent::UserLeft { sender: conn },
                Some(conn),
            )
            .await;

        self.limiter.release(conn);

        info!(conn = %conn, world = %session.world, "connection closed");
    }

    fn telemetry(&self) -> RelayTelemetry {
        let worlds: HashSet<&WorldKey> =
            self.sessions.values().map(|s| &s.world).collect();
        RelayTelemetry {
            sessions: self.sessions.len(),
            worlds: worlds.len(),
            rate_tracked: self.limiter.tracked(),
        }
    }
}
