//! ZeroMQ ROUTER transport for Warden
//!
//! The host endpoint agent containers dial. A ROUTER socket
//! demultiplexes concurrent connections: every inbound frame arrives
//! as `[identity, empty delimiter, payload]`, and the identity bytes
//! are the only authenticated routing key for a reply.
//!
//! zmq sockets are not `Sync`, so the socket lives on a dedicated I/O
//! thread. Inbound frames are decoded there and handed to the
//! supervisor over a tokio channel; outbound frames arrive over a
//! crossbeam command channel. Pending requests are tracked in a shared
//! table keyed by the `(identity, correlation)` tuple — correlations
//! are agent-chosen, so two agents picking the same string must not
//! collide. The per-request deadline is enforced by a scan on each
//! poll tick, so the poll interval bounds timer skew.
//!
//! Malformed, oversize, or over-deep payloads are warn-logged and
//! dropped without a reply: with no trustworthy correlation there is
//! nothing to answer.

#![warn(clippy::all)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use tokio::sync::mpsc;

use warden_core::protocol::ConnectionIdentity;
use warden_core::transport::{ToolTransport, TransportEvent};
use warden_core::{Error, Result, ResponseEnvelope, WireMessage};

/// Router tuning
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deadline for unanswered requests
    pub request_timeout: Duration,
    /// Poll tick; bounds both command latency and deadline skew
    pub poll_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

enum Command {
    Send {
        identity: Vec<u8>,
        payload: Vec<u8>,
    },
    Close,
}

/// Pending requests: `(identity, correlation)` → reply deadline.
///
/// The tuple is the uniqueness unit; the same correlation string may
/// be live under any number of distinct identities.
type PendingTable = HashMap<(ConnectionIdentity, String), Instant>;

enum State {
    Idle,
    Bound {
        cmd_tx: Sender<Command>,
        thread: Option<std::thread::JoinHandle<()>>,
    },
    Closed,
}

/// ROUTER endpoint implementing `ToolTransport`
pub struct RouterTransport {
    config: RouterConfig,
    state: Mutex<State>,
    pending: Arc<Mutex<PendingTable>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl RouterTransport {
    /// Unbound transport with the given tuning
    pub fn new(config: RouterConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: Mutex::new(State::Idle),
            pending: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Number of requests currently awaiting a response
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }
}

impl ToolTransport for RouterTransport {
    fn bind(&self, endpoint: &str) -> Result<()> {
        let mut state = self.state.lock().expect("state lock");
        if matches!(*state, State::Bound { .. }) {
            return Err(Error::AlreadyBound);
        }

        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<zmq::Result<()>>();

        let endpoint = endpoint.to_string();
        let pending = self.pending.clone();
        let events_tx = self.events_tx.clone();
        let config = self.config.clone();

        let thread = std::thread::Builder::new()
            .name("warden-router".to_string())
            .spawn(move || {
                io_loop(endpoint, cmd_rx, ready_tx, pending, events_tx, config)
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *state = State::Bound {
                    cmd_tx,
                    thread: Some(thread),
                };
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(Error::Transport(format!("bind failed: {}", e)))
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Transport(
                    "router thread died during bind".to_string(),
                ))
            }
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().expect("events lock").take()
    }

    fn send_response(
        &self,
        identity: &ConnectionIdentity,
        response: &ResponseEnvelope,
    ) -> Result<()> {
        let cmd_tx = {
            let state = self.state.lock().expect("state lock");
            match &*state {
                State::Bound { cmd_tx, .. } => cmd_tx.clone(),
                _ => return Err(Error::NotBound),
            }
        };

        // encode before touching the pending table: a framing failure
        // must leave the entry in place so the caller can still answer
        // with a substitute response
        let payload = response.encode_checked()?;

        // match and remove the pending entry atomically with its timer
        {
            let mut pending = self.pending.lock().expect("pending lock");
            let key = (identity.clone(), response.correlation.clone());
            if pending.remove(&key).is_none() {
                if pending
                    .keys()
                    .any(|(_, correlation)| correlation == &response.correlation)
                {
                    return Err(Error::IdentityMismatch(response.correlation.clone()));
                }
                return Err(Error::NoPendingRequest(response.correlation.clone()));
            }
        }

        cmd_tx
            .send(Command::Send {
                identity: identity.as_bytes().to_vec(),
                payload,
            })
            .map_err(|_| Error::NotBound)
    }

    fn close(&self) {
        let previous = {
            let mut state = self.state.lock().expect("state lock");
            std::mem::replace(&mut *state, State::Closed)
        };
        if let State::Bound { cmd_tx, thread } = previous {
            let _ = cmd_tx.send(Command::Close);
            if let Some(thread) = thread {
                let _ = thread.join();
            }
            // all pending timers die with the endpoint
            self.pending.lock().expect("pending lock").clear();
        }
    }
}

impl Drop for RouterTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn io_loop(
    endpoint: String,
    cmd_rx: Receiver<Command>,
    ready_tx: std::sync::mpsc::Sender<zmq::Result<()>>,
    pending: Arc<Mutex<PendingTable>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    config: RouterConfig,
) {
    let context = zmq::Context::new();
    let socket = match setup_socket(&context, &endpoint) {
        Ok(socket) => {
            let _ = ready_tx.send(Ok(()));
            socket
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    tracing::info!(endpoint = %endpoint, "router bound");

    let poll_ms = config.poll_interval.as_millis() as i64;
    loop {
        // outbound commands first so replies are not starved by inbound load
        loop {
            match cmd_rx.try_recv() {
                Ok(Command::Send { identity, payload }) => {
                    let frames: Vec<Vec<u8>> = vec![identity, Vec::new(), payload];
                    if let Err(e) = socket.send_multipart(frames, 0) {
                        tracing::warn!(error = %e, "failed to send response frame");
                    }
                }
                Ok(Command::Close) => {
                    tracing::info!(endpoint = %endpoint, "router closing");
                    return;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        match socket.poll(zmq::POLLIN, poll_ms) {
            Ok(n) if n > 0 => loop {
                match socket.recv_multipart(zmq::DONTWAIT) {
                    Ok(frames) => {
                        handle_frames(frames, &pending, &events_tx, &config);
                    }
                    Err(zmq::Error::EAGAIN) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "receive failed");
                        break;
                    }
                }
            },
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "poll failed, router stopping");
                return;
            }
        }

        expire_deadlines(&pending, &events_tx);
    }
}

fn setup_socket(context: &zmq::Context, endpoint: &str) -> zmq::Result<zmq::Socket> {
    let socket = context.socket(zmq::ROUTER)?;
    socket.set_linger(0)?;
    socket.set_router_mandatory(true)?;
    socket.bind(endpoint)?;
    Ok(socket)
}

fn handle_frames(
    frames: Vec<Vec<u8>>,
    pending: &Arc<Mutex<PendingTable>>,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
    config: &RouterConfig,
) {
    // ROUTER framing: [identity, empty delimiter, payload]
    if frames.len() != 3 || !frames[1].is_empty() {
        tracing::warn!(frame_count = frames.len(), "malformed frame dropped");
        return;
    }
    let mut frames = frames;
    let payload = frames.pop().unwrap_or_default();
    frames.pop();
    let identity = ConnectionIdentity::new(frames.pop().unwrap_or_default());

    let wire = match WireMessage::decode(&payload) {
        Ok(wire) => wire,
        Err(e) => {
            // no trustworthy correlation, so no reply
            tracing::warn!(
                identity = %identity.to_hex(),
                error = %e,
                "undecodable frame dropped"
            );
            return;
        }
    };

    {
        let mut pending = pending.lock().expect("pending lock");
        let key = (identity.clone(), wire.correlation.clone());
        if pending.contains_key(&key) {
            // replacing the entry would orphan the in-flight reply
            tracing::warn!(
                identity = %identity.to_hex(),
                correlation = %wire.correlation,
                "frame reusing a correlation still in flight on this connection dropped"
            );
            return;
        }
        pending.insert(key, Instant::now() + config.request_timeout);
    }

    if events_tx
        .send(TransportEvent::Request { identity, wire })
        .is_err()
    {
        tracing::warn!("event receiver dropped, request lost");
    }
}

fn expire_deadlines(
    pending: &Arc<Mutex<PendingTable>>,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
) {
    let now = Instant::now();
    let expired: Vec<(ConnectionIdentity, String)> = {
        let mut pending = pending.lock().expect("pending lock");
        let keys: Vec<(ConnectionIdentity, String)> = pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            pending.remove(key);
        }
        keys
    };

    for (identity, correlation) in expired {
        tracing::warn!(
            correlation = %correlation,
            identity = %identity.to_hex(),
            "request deadline expired"
        );
        let _ = events_tx.send(TransportEvent::DeadlineExpired {
            identity,
            correlation,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_before_bind_is_not_bound() {
        let transport = RouterTransport::new(RouterConfig::default());
        let response_err = transport.send_response(
            &ConnectionIdentity::new(b"x".to_vec()),
            &sample_response(),
        );
        assert!(matches!(response_err, Err(Error::NotBound)));
    }

    #[test]
    fn test_take_events_is_take_once() {
        let transport = RouterTransport::new(RouterConfig::default());
        assert!(transport.take_events().is_some());
        assert!(transport.take_events().is_none());
    }

    #[test]
    fn test_close_without_bind_is_safe() {
        let transport = RouterTransport::new(RouterConfig::default());
        transport.close();
        transport.close();
    }

    fn sample_response() -> ResponseEnvelope {
        use warden_core::protocol::RequestEnvelope;
        use warden_core::SessionContext;

        let wire = WireMessage::decode(
            br#"{"topic":"tool.invoke.x","correlation":"c1","arguments":{}}"#,
        )
        .unwrap();
        let session = SessionContext {
            session_id: "s".to_string(),
            group: "g".to_string(),
            source: "ctr".to_string(),
            connection_identity: ConnectionIdentity::new(b"x".to_vec()),
            started_at: chrono::Utc::now(),
        };
        let request = RequestEnvelope::from_wire(&wire, &session);
        ResponseEnvelope::success(&request, serde_json::json!({}))
    }
}
