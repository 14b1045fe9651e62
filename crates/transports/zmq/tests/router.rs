//! ROUTER contract tests driven by a DEALER client

use std::time::Duration;

use warden_core::protocol::{ConnectionIdentity, RequestEnvelope};
use warden_core::transport::{ToolTransport, TransportEvent};
use warden_core::{Error, ResponseEnvelope, SessionContext, WireMessage};
use warden_zmq::{RouterConfig, RouterTransport};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

struct Dealer {
    socket: zmq::Socket,
    _context: zmq::Context,
}

impl Dealer {
    fn connect(endpoint: &str, identity: &[u8]) -> Self {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::DEALER).unwrap();
        socket.set_identity(identity).unwrap();
        socket.set_linger(0).unwrap();
        socket
            .set_rcvtimeo(RECV_TIMEOUT.as_millis() as i32)
            .unwrap();
        socket.connect(endpoint).unwrap();
        Self {
            socket,
            _context: context,
        }
    }

    fn send_raw(&self, payload: &[u8]) {
        // DEALER adds its identity; the empty delimiter comes from us
        self.socket
            .send_multipart([Vec::new(), payload.to_vec()], 0)
            .unwrap();
    }

    fn send_wire(&self, topic: &str, correlation: &str, arguments: serde_json::Value) {
        let payload = serde_json::json!({
            "topic": topic,
            "correlation": correlation,
            "arguments": arguments,
        });
        self.send_raw(payload.to_string().as_bytes());
    }

    fn recv_response(&self) -> ResponseEnvelope {
        let frames = self.socket.recv_multipart(0).unwrap();
        assert_eq!(frames.len(), 2, "expected [empty, payload]");
        assert!(frames[0].is_empty());
        serde_json::from_slice(&frames[1]).unwrap()
    }
}

fn ipc_endpoint(dir: &tempfile::TempDir, name: &str) -> String {
    format!("ipc://{}/{}.sock", dir.path().display(), name)
}

fn bound_router(config: RouterConfig) -> (tempfile::TempDir, RouterTransport, String) {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = ipc_endpoint(&dir, "router");
    let transport = RouterTransport::new(config);
    transport.bind(&endpoint).unwrap();
    (dir, transport, endpoint)
}

async fn next_event(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
) -> TransportEvent {
    tokio::time::timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("event channel closed")
}

fn response_for(wire: &WireMessage, identity: &ConnectionIdentity) -> ResponseEnvelope {
    let session = SessionContext {
        session_id: "sess-1".to_string(),
        group: "email".to_string(),
        source: "ctr-1".to_string(),
        connection_identity: identity.clone(),
        started_at: chrono::Utc::now(),
    };
    let request = RequestEnvelope::from_wire(wire, &session);
    ResponseEnvelope::success(&request, serde_json::json!({"ok": true}))
}

#[tokio::test]
async fn test_bind_contract() {
    let (_dir, transport, endpoint) = bound_router(RouterConfig::default());

    // re-binding a bound instance fails
    assert!(matches!(
        transport.bind(&endpoint),
        Err(Error::AlreadyBound)
    ));

    // close twice is safe, rebind afterwards works
    transport.close();
    transport.close();
    transport.bind(&endpoint).unwrap();
    transport.close();
}

#[tokio::test]
async fn test_request_response_round_trip() {
    let (_dir, transport, endpoint) = bound_router(RouterConfig::default());
    let mut events = transport.take_events().unwrap();

    let dealer = Dealer::connect(&endpoint, b"agent-1");
    dealer.send_wire(
        "tool.invoke.create_reminder",
        "c1",
        serde_json::json!({"text": "hi"}),
    );

    let (identity, wire) = match next_event(&mut events).await {
        TransportEvent::Request { identity, wire } => (identity, wire),
        other => panic!("unexpected event: {:?}", other),
    };
    assert_eq!(identity.as_bytes(), b"agent-1");
    assert_eq!(wire.topic, "tool.invoke.create_reminder");
    assert_eq!(wire.correlation, "c1");
    assert_eq!(transport.pending_len(), 1);

    let response = response_for(&wire, &identity);
    transport.send_response(&identity, &response).unwrap();
    assert_eq!(transport.pending_len(), 0);

    let received = dealer.recv_response();
    assert_eq!(received.correlation, "c1");
    assert_eq!(
        received.payload.result,
        Some(serde_json::json!({"ok": true}))
    );
    assert!(received.payload.error.is_none());

    transport.close();
}

#[tokio::test]
async fn test_interleaved_replies_in_any_order() {
    let (_dir, transport, endpoint) = bound_router(RouterConfig::default());
    let mut events = transport.take_events().unwrap();

    let alpha = Dealer::connect(&endpoint, b"agent-alpha");
    let beta = Dealer::connect(&endpoint, b"agent-beta");
    alpha.send_wire("tool.invoke.x", "a1", serde_json::json!({}));
    beta.send_wire("tool.invoke.x", "b1", serde_json::json!({}));

    let mut requests = Vec::new();
    for _ in 0..2 {
        if let TransportEvent::Request { identity, wire } = next_event(&mut events).await {
            requests.push((identity, wire));
        }
    }
    // reply in reverse arrival order
    requests.reverse();
    for (identity, wire) in &requests {
        let response = response_for(wire, identity);
        transport.send_response(identity, &response).unwrap();
    }

    assert_eq!(alpha.recv_response().correlation, "a1");
    assert_eq!(beta.recv_response().correlation, "b1");
    transport.close();
}

#[tokio::test]
async fn test_send_response_failure_modes() {
    let (_dir, transport, endpoint) = bound_router(RouterConfig::default());
    let mut events = transport.take_events().unwrap();

    let dealer = Dealer::connect(&endpoint, b"agent-1");
    dealer.send_wire("tool.invoke.x", "c1", serde_json::json!({}));
    let (identity, wire) = match next_event(&mut events).await {
        TransportEvent::Request { identity, wire } => (identity, wire),
        other => panic!("unexpected event: {:?}", other),
    };

    // unknown correlation
    let mut response = response_for(&wire, &identity);
    response.correlation = "never-seen".to_string();
    assert!(matches!(
        transport.send_response(&identity, &response),
        Err(Error::NoPendingRequest(_))
    ));

    // right correlation, wrong identity
    let response = response_for(&wire, &identity);
    let wrong = ConnectionIdentity::new(b"agent-2".to_vec());
    assert!(matches!(
        transport.send_response(&wrong, &response),
        Err(Error::IdentityMismatch(_))
    ));
    // the failed attempts left the entry in place
    assert_eq!(transport.pending_len(), 1);

    // correct identity succeeds exactly once
    transport.send_response(&identity, &response).unwrap();
    assert!(matches!(
        transport.send_response(&identity, &response),
        Err(Error::NoPendingRequest(_))
    ));

    transport.close();
    // sends after close are refused
    assert!(matches!(
        transport.send_response(&identity, &response),
        Err(Error::NotBound)
    ));
}

#[tokio::test]
async fn test_malformed_frames_dropped_silently() {
    let (_dir, transport, endpoint) = bound_router(RouterConfig::default());
    let mut events = transport.take_events().unwrap();

    let dealer = Dealer::connect(&endpoint, b"agent-1");
    dealer.send_raw(b"not json at all");
    dealer.send_raw(br#"{"topic":"tool.invoke.x","correlation":"","arguments":{}}"#);
    // a valid frame after the garbage still gets through
    dealer.send_wire("tool.invoke.x", "c-ok", serde_json::json!({}));

    match next_event(&mut events).await {
        TransportEvent::Request { wire, .. } => assert_eq!(wire.correlation, "c-ok"),
        other => panic!("unexpected event: {:?}", other),
    }
    // nothing pending for the dropped frames
    assert_eq!(transport.pending_len(), 1);
    transport.close();
}

#[tokio::test]
async fn test_correlations_are_scoped_per_identity() {
    let (_dir, transport, endpoint) = bound_router(RouterConfig::default());
    let mut events = transport.take_events().unwrap();

    // correlations are agent-chosen: two agents picking the same
    // string must both stay in flight
    let alpha = Dealer::connect(&endpoint, b"agent-alpha");
    let beta = Dealer::connect(&endpoint, b"agent-beta");
    alpha.send_wire("tool.invoke.x", "c1", serde_json::json!({}));
    beta.send_wire("tool.invoke.x", "c1", serde_json::json!({}));

    let mut requests = Vec::new();
    for _ in 0..2 {
        if let TransportEvent::Request { identity, wire } = next_event(&mut events).await {
            requests.push((identity, wire));
        }
    }
    assert_eq!(transport.pending_len(), 2);

    // reusing a correlation still in flight on the SAME connection is
    // dropped
    alpha.send_wire("tool.invoke.x", "c1", serde_json::json!({}));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.pending_len(), 2);

    // each reply routes to its own connection
    for (identity, wire) in &requests {
        let response = response_for(wire, identity);
        transport.send_response(identity, &response).unwrap();
    }
    assert_eq!(alpha.recv_response().correlation, "c1");
    assert_eq!(beta.recv_response().correlation, "c1");
    assert_eq!(transport.pending_len(), 0);
    transport.close();
}

#[tokio::test]
async fn test_deadline_expiry_fires_timeout_event() {
    let (_dir, transport, endpoint) = bound_router(RouterConfig {
        request_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(20),
    });
    let mut events = transport.take_events().unwrap();

    let dealer = Dealer::connect(&endpoint, b"agent-1");
    dealer.send_wire("tool.invoke.slow", "c-slow", serde_json::json!({}));

    let (identity, wire) = match next_event(&mut events).await {
        TransportEvent::Request { identity, wire } => (identity, wire),
        other => panic!("unexpected event: {:?}", other),
    };

    match next_event(&mut events).await {
        TransportEvent::DeadlineExpired {
            identity: expired_identity,
            correlation,
        } => {
            assert_eq!(correlation, "c-slow");
            assert_eq!(expired_identity, identity);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(transport.pending_len(), 0);

    // a late response now has nowhere to go
    let response = response_for(&wire, &identity);
    assert!(matches!(
        transport.send_response(&identity, &response),
        Err(Error::NoPendingRequest(_))
    ));
    transport.close();
}

#[tokio::test]
async fn test_oversize_outbound_leaves_entry_for_fallback() {
    let (_dir, transport, endpoint) = bound_router(RouterConfig::default());
    let mut events = transport.take_events().unwrap();

    let dealer = Dealer::connect(&endpoint, b"agent-1");
    dealer.send_wire("tool.invoke.x", "c1", serde_json::json!({}));
    let (identity, wire) = match next_event(&mut events).await {
        TransportEvent::Request { identity, wire } => (identity, wire),
        other => panic!("unexpected event: {:?}", other),
    };

    // a response over the frame limit is refused without consuming
    // the pending entry
    let mut oversize = response_for(&wire, &identity);
    oversize.payload.result = Some(serde_json::json!({
        "blob": "x".repeat(warden_core::protocol::MAX_FRAME_BYTES)
    }));
    assert!(matches!(
        transport.send_response(&identity, &oversize),
        Err(Error::FrameTooLarge { .. })
    ));
    assert_eq!(transport.pending_len(), 1);

    // so a substitute response can still reach the agent
    let fallback = response_for(&wire, &identity);
    transport.send_response(&identity, &fallback).unwrap();
    assert_eq!(dealer.recv_response().correlation, "c1");
    transport.close();
}

#[tokio::test]
async fn test_oversize_inbound_dropped() {
    let (_dir, transport, endpoint) = bound_router(RouterConfig::default());
    let mut events = transport.take_events().unwrap();

    let dealer = Dealer::connect(&endpoint, b"agent-1");
    let oversize = format!(
        r#"{{"topic":"tool.invoke.x","correlation":"big","arguments":{{"blob":"{}"}}}}"#,
        "x".repeat(warden_core::protocol::MAX_FRAME_BYTES)
    );
    dealer.send_raw(oversize.as_bytes());
    dealer.send_wire("tool.invoke.x", "small", serde_json::json!({}));

    match next_event(&mut events).await {
        TransportEvent::Request { wire, .. } => assert_eq!(wire.correlation, "small"),
        other => panic!("unexpected event: {:?}", other),
    }
    transport.close();
}
