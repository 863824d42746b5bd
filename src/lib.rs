//! # Whorl - Anonymous World Relay
//!
//! Whorl is a real-time relay that partitions anonymous clients into
//! ephemeral "worlds" keyed by a hashed network address, and fans short text
//! "thoughts" out within each world while protecting it from flooding.
//!
//! ## Architecture
//!
//! The relay core uses the **Actor Pattern** for safe concurrent state:
//! one actor owns the sessions map and the rate limiter, processes connect,
//! message, and disconnect events strictly in arrival order, and never
//! blocks on the one asynchronous capability (moderation) inline. Transports
//! plug in behind a capability trait, so the core runs identically over the
//! production WebSocket listener and the in-memory test transport.
//!
//! ## Privacy Model
//!
//! - World keys are one-way truncated digests of the client address; no
//!   recoverable encoding of an address ever leaves the resolver
//! - Connections are identified by opaque random ids
//! - Nothing is persisted; all state dies with the process
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Connection ids and world-key resolution |
//! | `messages` | JSON wire events and rejection notices |
//! | `ratelimit` | Per-connection sliding-window admission control |
//! | `moderation` | Optional content-screening seam |
//! | `router` | World-scoped fan-out over a transport |
//! | `transport` | Transport capability trait, WebSocket and in-memory impls |
//! | `session` | Relay actor orchestrating connection lifecycles |
//! | `config` | Ports, origins, and rate-limit policy |

mod config;
mod identity;
mod messages;
mod moderation;
mod ratelimit;
mod router;
mod session;
mod transport;

pub use config::{RelayConfig, DEFAULT_ALLOWED_ORIGINS, DEFAULT_PORT};
pub use identity::{ConnId, WorldKey, WORLD_KEY_DIGEST_LEN, WORLD_KEY_PREFIX};
pub use messages::{
    ClientEvent, RejectReason, ServerEvent, MAX_FRAME_SIZE, MODERATION_NOTICE,
    RATE_LIMIT_NOTICE,
};
pub use moderation::{BlocklistGuard, ModerationGuard, ModerationPolicy};
pub use ratelimit::{
    RateLimiter, DEFAULT_RATE_MAX_IN_WINDOW, DEFAULT_RATE_WINDOW,
    MAX_RATE_ENTRIES,
};
pub use router::WorldRouter;
pub use session::{Relay, RelayTelemetry};
pub use transport::{MemoryTransport, WorldTransport, WsTransport};
