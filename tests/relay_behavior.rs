//! Integration tests for relay session behavior.
//!
//! These tests drive the relay actor end-to-end over the in-memory
//! transport: world grouping, fan-out scope, rate limiting, disconnect
//! lifecycle, and the moderation seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use whorl::{
    BlocklistGuard, ConnId, MemoryTransport, ModerationGuard, ModerationPolicy,
    Relay, RelayConfig, MODERATION_NOTICE, RATE_LIMIT_NOTICE,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Long enough for queued relay events to drain before a negative
/// assertion.
const SETTLE: Duration = Duration::from_millis(150);

// =============================================================================
// Helper Functions
// =============================================================================

fn conn(byte: u8) -> ConnId {
    ConnId::from_bytes([byte; 8])
}

fn test_config() -> RelayConfig {
    RelayConfig::default()
}

fn thought_frame(text: &str) -> String {
    json!({"event": "broadcast-thought", "data": {"text": text}}).to_string()
}

/// Open a connection on the transport and announce it to the relay.
async fn connect(
    relay: &Relay,
    transport: &MemoryTransport,
    id: ConnId,
    forwarded: Option<&str>,
    addr: &str,
) -> mpsc::UnboundedReceiver<String> {
    let rx = transport.open(id);
    relay
        .connect(id, forwarded.map(String::from), addr.to_string())
        .await;
    rx
}

/// Close a connection on the transport, then announce the disconnect, the
/// same order the WebSocket transport uses.
async fn disconnect(relay: &Relay, transport: &MemoryTransport, id: ConnId) {
    transport.close(id);
    relay.disconnect(id).await;
}

async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let raw = timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("delivery channel closed");
    serde_json::from_str(&raw).expect("frame is valid JSON")
}

/// Assert no frame is delivered within the settle window.
async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<String>) {
    tokio::time::sleep(SETTLE).await;
    assert!(rx.try_recv().is_err(), "expected no frame");
}

// =============================================================================
// Test: world grouping and fan-out scope
// =============================================================================

/// Connections sharing an address see each other's thoughts, sender
/// included; a connection with a different address never does.
#[tokio::test]
async fn thoughts_fan_out_within_world_only() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(transport.clone(), &test_config(), None);

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;
    let mut rx2 = connect(&relay, &transport, conn(2), None, "203.0.113.7").await;
    let mut rx3 = connect(&relay, &transport, conn(3), None, "198.51.100.9").await;

    relay.inbound(conn(1), thought_frame("hello world")).await;

    for rx in [&mut rx1, &mut rx2] {
        let frame = recv_frame(rx).await;
        assert_eq!(frame["event"], "new-thought");
        assert_eq!(frame["data"]["text"], "hello world");
        assert_eq!(frame["data"]["id"], json!(conn(1).to_hex()));
    }

    assert_silent(&mut rx3).await;
}

/// A proxied connection whose forwarded chain starts with some public
/// address lands in the same world as a direct connection from it.
#[tokio::test]
async fn forwarded_chain_groups_with_direct_address() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(transport.clone(), &test_config(), None);

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;
    let _rx2 = connect(
        &relay,
        &transport,
        conn(2),
        Some("203.0.113.7, 10.0.0.1"),
        "10.0.0.1",
    )
    .await;

    relay.inbound(conn(2), thought_frame("through the proxy")).await;

    let frame = recv_frame(&mut rx1).await;
    assert_eq!(frame["data"]["text"], "through the proxy");
}

/// Extra payload fields ride along untouched; the relay adds only the id.
#[tokio::test]
async fn payload_fields_forward_as_is() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(transport.clone(), &test_config(), None);

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;

    let frame = json!({
        "event": "broadcast-thought",
        "data": {"text": "hi", "mood": "calm", "hue": 220}
    })
    .to_string();
    relay.inbound(conn(1), frame).await;

    let delivered = recv_frame(&mut rx1).await;
    assert_eq!(delivered["data"]["mood"], "calm");
    assert_eq!(delivered["data"]["hue"], 220);
    assert_eq!(delivered["data"]["id"], json!(conn(1).to_hex()));
}

// =============================================================================
// Test: rate limiting
// =============================================================================

/// Five thoughts pass, the sixth draws a sender-only rejection and is
/// never delivered to the world.
#[tokio::test]
async fn sixth_thought_in_window_is_rejected() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(transport.clone(), &test_config(), None);

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;
    let mut rx2 = connect(&relay, &transport, conn(2), None, "203.0.113.7").await;

    for i in 0..6 {
        relay.inbound(conn(1), thought_frame(&format!("thought {i}"))).await;
    }

    for i in 0..5 {
        let frame = recv_frame(&mut rx1).await;
        assert_eq!(frame["event"], "new-thought");
        assert_eq!(frame["data"]["text"], format!("thought {i}"));
    }

    // The sender alone sees the rejection notice.
    let rejection = recv_frame(&mut rx1).await;
    assert_eq!(rejection["event"], "error-msg");
    assert_eq!(rejection["data"], json!(RATE_LIMIT_NOTICE));

    // The neighbor got the five admitted thoughts and nothing else.
    for _ in 0..5 {
        let frame = recv_frame(&mut rx2).await;
        assert_eq!(frame["event"], "new-thought");
    }
    assert_silent(&mut rx2).await;
}

/// One connection exhausting its window does not affect its neighbors.
#[tokio::test]
async fn rate_limit_is_per_connection() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(transport.clone(), &test_config(), None);

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;
    let _rx2 = connect(&relay, &transport, conn(2), None, "203.0.113.7").await;

    for _ in 0..6 {
        relay.inbound(conn(1), thought_frame("flood")).await;
    }
    relay.inbound(conn(2), thought_frame("calm")).await;

    let mut seen_calm = false;
    for _ in 0..7 {
        let frame = recv_frame(&mut rx1).await;
        if frame["event"] == "new-thought" && frame["data"]["text"] == "calm" {
            seen_calm = true;
        }
    }
    assert!(seen_calm, "neighbor's thought must be admitted");
}

/// Disconnecting drops the rate window: a reconnect under a new id starts
/// fresh even though it lands in the same world.
#[tokio::test]
async fn reconnect_starts_with_fresh_window() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(transport.clone(), &test_config(), None);

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;

    for _ in 0..6 {
        relay.inbound(conn(1), thought_frame("x")).await;
    }
    for _ in 0..5 {
        assert_eq!(recv_frame(&mut rx1).await["event"], "new-thought");
    }
    assert_eq!(recv_frame(&mut rx1).await["event"], "error-msg");

    disconnect(&relay, &transport, conn(1)).await;

    let mut rx9 = connect(&relay, &transport, conn(9), None, "203.0.113.7").await;
    relay.inbound(conn(9), thought_frame("fresh start")).await;

    let frame = recv_frame(&mut rx9).await;
    assert_eq!(frame["event"], "new-thought");
    assert_eq!(frame["data"]["text"], "fresh start");
}

// =============================================================================
// Test: disconnect lifecycle
// =============================================================================

/// Every disconnect produces exactly one user-left notice for the world,
/// and none for the departed connection.
#[tokio::test]
async fn user_left_broadcast_exactly_once() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(transport.clone(), &test_config(), None);

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;
    let mut rx2 = connect(&relay, &transport, conn(2), None, "203.0.113.7").await;

    disconnect(&relay, &transport, conn(1)).await;

    let frame = recv_frame(&mut rx2).await;
    assert_eq!(frame["event"], "user-left");
    assert_eq!(frame["data"], json!(conn(1).to_hex()));
    assert_silent(&mut rx2).await;

    // The departed connection's queue saw nothing.
    assert!(rx1.try_recv().is_err());
}

/// Telemetry counters track sessions and worlds across the lifecycle.
#[tokio::test]
async fn telemetry_tracks_lifecycle() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(transport.clone(), &test_config(), None);

    let _rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;
    let _rx2 = connect(&relay, &transport, conn(2), None, "203.0.113.7").await;
    let _rx3 = connect(&relay, &transport, conn(3), None, "198.51.100.9").await;

    let snapshot = relay.telemetry().await;
    assert_eq!(snapshot.sessions, 3);
    assert_eq!(snapshot.worlds, 2);

    disconnect(&relay, &transport, conn(3)).await;

    let snapshot = relay.telemetry().await;
    assert_eq!(snapshot.sessions, 2);
    assert_eq!(snapshot.worlds, 1);
}

// =============================================================================
// Test: moderation seam
// =============================================================================

/// Guards used by the moderation tests.
struct FailingGuard;

#[async_trait]
impl ModerationGuard for FailingGuard {
    async fn is_toxic(&self, _text: &str) -> anyhow::Result<bool> {
        anyhow::bail!("classifier offline")
    }
}

struct SlowApproveGuard;

#[async_trait]
impl ModerationGuard for SlowApproveGuard {
    async fn is_toxic(&self, _text: &str) -> anyhow::Result<bool> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(false)
    }
}

/// A blocked thought draws the moderation notice, reaches nobody, and
/// consumes no rate-limit slot.
#[tokio::test]
async fn blocked_thought_costs_no_rate_slot() {
    let transport = Arc::new(MemoryTransport::new());
    let guard: Arc<dyn ModerationGuard> = Arc::new(BlocklistGuard::new(["venom"]));
    let relay = Relay::spawn(transport.clone(), &test_config(), Some(guard));

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;
    let mut rx2 = connect(&relay, &transport, conn(2), None, "203.0.113.7").await;

    relay.inbound(conn(1), thought_frame("pure venom")).await;

    let rejection = recv_frame(&mut rx1).await;
    assert_eq!(rejection["event"], "error-msg");
    assert_eq!(rejection["data"], json!(MODERATION_NOTICE));
    assert_silent(&mut rx2).await;

    // All five window slots are still free.
    for i in 0..5 {
        relay.inbound(conn(1), thought_frame(&format!("calm {i}"))).await;
    }
    for _ in 0..5 {
        assert_eq!(recv_frame(&mut rx2).await["event"], "new-thought");
    }
}

/// With the default fail-open policy a guard failure admits the thought.
#[tokio::test]
async fn guard_failure_fails_open() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(
        transport.clone(),
        &test_config(),
        Some(Arc::new(FailingGuard)),
    );

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;
    relay.inbound(conn(1), thought_frame("still here")).await;

    let frame = recv_frame(&mut rx1).await;
    assert_eq!(frame["event"], "new-thought");
    assert_eq!(frame["data"]["text"], "still here");
}

/// Fail-closed turns the same guard failure into a sender-only rejection.
#[tokio::test]
async fn guard_failure_fails_closed_when_configured() {
    let transport = Arc::new(MemoryTransport::new());
    let mut config = test_config();
    config.moderation_policy = ModerationPolicy::FailClosed;
    let relay = Relay::spawn(transport.clone(), &config, Some(Arc::new(FailingGuard)));

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;
    let mut rx2 = connect(&relay, &transport, conn(2), None, "203.0.113.7").await;

    relay.inbound(conn(1), thought_frame("anything")).await;

    let rejection = recv_frame(&mut rx1).await;
    assert_eq!(rejection["event"], "error-msg");
    assert_eq!(rejection["data"], json!(MODERATION_NOTICE));
    assert_silent(&mut rx2).await;
}

/// A verdict resolving after its sender disconnected is discarded: no
/// forward, no notice, no panic.
#[tokio::test]
async fn pending_verdict_discarded_after_disconnect() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(
        transport.clone(),
        &test_config(),
        Some(Arc::new(SlowApproveGuard)),
    );

    let _rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;
    let mut rx2 = connect(&relay, &transport, conn(2), None, "203.0.113.7").await;

    relay.inbound(conn(1), thought_frame("parting words")).await;
    disconnect(&relay, &transport, conn(1)).await;

    // The neighbor sees the departure, then nothing when the verdict lands.
    let frame = recv_frame(&mut rx2).await;
    assert_eq!(frame["event"], "user-left");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(rx2.try_recv().is_err(), "dead connection's thought must not forward");
}

/// Frames that are not routable thoughts are dropped without side effects.
#[tokio::test]
async fn unroutable_frames_are_ignored() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = Relay::spawn(transport.clone(), &test_config(), None);

    let mut rx1 = connect(&relay, &transport, conn(1), None, "203.0.113.7").await;

    relay.inbound(conn(1), "not json at all".to_string()).await;
    relay
        .inbound(conn(1), json!({"event": "unknown", "data": {}}).to_string())
        .await;

    assert_silent(&mut rx1).await;

    // The relay still works afterwards.
    relay.inbound(conn(1), thought_frame("fine")).await;
    assert_eq!(recv_frame(&mut rx1).await["event"], "new-thought");
}
