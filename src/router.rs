//! # World Router
//!
//! Thin routing layer between the relay session and the transport: joins a
//! connection to the broadcast group named by its world key and fans events
//! out to that group. Membership itself lives in the transport; the router
//! adds the relay-side vocabulary (worlds, thoughts, notices) and the fan-out
//! logging, and gives the session a single seam to hold.

use std::sync::Arc;

use tracing::trace;

use crate::identity::{ConnId, WorldKey};
use crate::messages::ServerEvent;
use crate::transport::WorldTransport;

/// Routes relay events to a world's broadcast group.
pub struct WorldRouter<T: WorldTransport> {
    transport: Arc<T>,
}

impl<T: WorldTransport> WorldRouter<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Join a connection to its world. Idempotent: joining a group the
    /// connection is already a member of is a no-op.
    pub async fn join(&self, conn: ConnId, world: &WorldKey) {
        self.transport.join(conn, world).await;
    }

    /// Fan an event out to every member of a world, minus `exclude`.
    ///
    /// Best effort: members that disconnected since the membership snapshot
    /// are skipped by the transport, never failing the remaining deliveries.
    pub async fn broadcast(
        &self,
        world: &WorldKey,
        event: ServerEvent,
        exclude: Option<ConnId>,
    ) {
        trace!(world = %world, event = event.event_name(), "fan-out");
        self.transport.broadcast(world, &event, exclude).await;
    }

    /// Deliver a sender-only notice.
    pub async fn send(&self, conn: ConnId, event: ServerEvent) {
        trace!(conn = %conn, event = event.event_name(), "direct notice");
        self.transport.send(conn, &event).await;
    }

    /// Current member count of a world.
    pub async fn occupancy(&self, world: &WorldKey) -> usize {
        self.transport.occupancy(world).await
    }
}
