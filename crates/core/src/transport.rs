//! Transport abstraction
//!
//! The core is transport-agnostic: it consumes `TransportEvent`s and
//! answers through `ToolTransport`, nothing more. The ROUTER
//! realization lives in its own crate and depends on this one, never
//! the other way around.

use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{ConnectionIdentity, ResponseEnvelope, WireMessage};

/// Events a transport delivers to the supervisor
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded wire message from an identified connection
    Request {
        /// Sender's connection identity
        identity: ConnectionIdentity,
        /// The decoded message
        wire: WireMessage,
    },
    /// A pending request's deadline fired before any response was sent
    DeadlineExpired {
        /// Identity the request arrived under
        identity: ConnectionIdentity,
        /// Correlation whose entry was dropped
        correlation: String,
    },
}

/// The host endpoint containers dial.
///
/// Contract:
/// - `bind` fails with `AlreadyBound` while bound; rebinding is
///   possible only after `close`.
/// - `take_events` hands out the single event receiver (once).
/// - `send_response` fails with `NotBound` before bind or after close,
///   `NoPendingRequest` when the correlation has no pending entry, and
///   `IdentityMismatch` when it is pending under a different identity.
///   On success the pending entry and its timer are removed
///   atomically.
/// - `close` cancels all pending timers, refuses further sends, and
///   releases the endpoint; calling it twice is safe.
pub trait ToolTransport: Send + Sync {
    /// Bind the endpoint
    fn bind(&self, endpoint: &str) -> Result<()>;

    /// Take the event receiver; `None` after the first call
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Route a response back to the originating connection
    fn send_response(
        &self,
        identity: &ConnectionIdentity,
        response: &ResponseEnvelope,
    ) -> Result<()>;

    /// Release the endpoint
    fn close(&self);
}
