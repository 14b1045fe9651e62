//! Wire protocol types
//!
//! Everything that crosses the agent boundary lives here: the untrusted
//! wire message, the host-constructed request/response envelopes, the
//! error taxonomy, and the frame limits enforced on both directions.
//!
//! Envelope `source` and `group` always come from the host-side session
//! context. The wire message contributes only `topic`, `correlation`,
//! and `arguments`; anything else an agent sends is carried through
//! unread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::SessionContext;

/// Maximum payload size per frame, both inbound and outbound
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Maximum JSON nesting depth, both inbound and outbound
pub const MAX_JSON_DEPTH: usize = 64;

/// Envelope protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Topic prefix for tool invocations
pub const TOOL_TOPIC_PREFIX: &str = "tool.invoke.";

/// Opaque transport-layer identity of an agent connection.
///
/// The identity bytes are stable for the life of a connection and are
/// the host's only authenticated routing key for a reply. They carry no
/// structure; rendering is hex for log readability.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionIdentity(Vec<u8>);

impl ConnectionIdentity {
    /// Wrap raw identity bytes received from the transport
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Mint a fresh identity for a new session
    pub fn mint() -> Self {
        Self(Uuid::new_v4().simple().to_string().into_bytes())
    }

    /// Raw identity bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the raw bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Hex rendering used in logs and spawn env vars
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionIdentity({})", self.to_hex())
    }
}

impl From<&[u8]> for ConnectionIdentity {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Untrusted `{topic, correlation, arguments}` frame from an agent.
///
/// Unknown fields are collected into `extra` and never consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Requested topic, `tool.invoke.<name>` for tool calls
    pub topic: String,
    /// Agent-chosen reply key, treated as opaque
    pub correlation: String,
    /// Tool arguments
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Extra fields carried through unread
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WireMessage {
    /// Decode a raw frame payload, enforcing the frame limits.
    ///
    /// Size and depth violations and undecodable payloads all yield an
    /// error; callers drop the frame (there is no trustworthy
    /// correlation to reply to).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge {
                size: payload.len(),
                limit: MAX_FRAME_BYTES,
            });
        }

        let value: Value = serde_json::from_slice(payload)?;
        let depth = json_depth(&value);
        if depth > MAX_JSON_DEPTH {
            return Err(Error::DepthExceeded {
                depth,
                limit: MAX_JSON_DEPTH,
            });
        }

        let wire: WireMessage = serde_json::from_value(value)?;
        if wire.correlation.is_empty() {
            return Err(Error::MalformedFrame("empty correlation".to_string()));
        }
        Ok(wire)
    }
}

/// Error codes surfaced to agents.
///
/// The first six are reserved pipeline codes: when a handler emits one
/// of them, the executor rewrites it to `HANDLER_ERROR` (message
/// preserved) so that pipeline-level semantics cannot be spoofed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Topic does not resolve to a registered tool
    UnknownTool,
    /// Arguments rejected by the tool schema
    ValidationFailed,
    /// Session group not allowed for the tool
    Unauthorized,
    /// Token bucket exhausted
    RateLimited,
    /// Confirmation flow timed out
    ConfirmationTimeout,
    /// Confirmation flow denied
    ConfirmationDenied,
    /// Handler-reported failure
    HandlerError,
    /// Host-side failure, details withheld
    PluginError,
    /// Handler deadline expired
    PluginTimeout,
    /// Handler capability unavailable
    PluginUnavailable,
}

impl ErrorCode {
    /// Default retriability for this code
    pub fn default_retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::PluginTimeout | ErrorCode::PluginUnavailable
        )
    }

    /// Whether only the pipeline may emit this code
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownTool
                | ErrorCode::ValidationFailed
                | ErrorCode::Unauthorized
                | ErrorCode::RateLimited
                | ErrorCode::ConfirmationTimeout
                | ErrorCode::ConfirmationDenied
        )
    }
}

/// Structured error carried in a response payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    /// Error code from the fixed taxonomy
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Whether the agent may retry the request
    pub retriable: bool,
    /// Seconds until a retry can succeed (rate limiting only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

impl ToolError {
    /// Build an error with the code's default retriability
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retriable: code.default_retriable(),
            retry_after: None,
        }
    }

    /// Override retriability
    pub fn with_retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }

    /// Attach a retry-after hint in seconds
    pub fn with_retry_after(mut self, seconds: f64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

/// Host-constructed, trusted request wrapper.
///
/// `source` and `group` are promoted from the session context, never
/// taken from the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Fresh host-minted id
    pub id: String,
    /// Protocol version
    pub version: u32,
    /// Always `"request"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Topic copied from the wire
    pub topic: String,
    /// Container identifier from the session (audit/source tag)
    pub source: String,
    /// Reply key copied from the wire
    pub correlation: String,
    /// Authorization compartment from the session
    pub group: String,
    /// Construction time
    pub timestamp: DateTime<Utc>,
    /// Tool arguments from the wire
    pub payload: Map<String, Value>,
}

impl RequestEnvelope {
    /// Promote trusted session fields around an untrusted wire message
    pub fn from_wire(wire: &WireMessage, session: &SessionContext) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: PROTOCOL_VERSION,
            kind: "request".to_string(),
            topic: wire.topic.clone(),
            source: session.source.clone(),
            correlation: wire.correlation.clone(),
            group: session.group.clone(),
            timestamp: Utc::now(),
            payload: wire.arguments.clone(),
        }
    }
}

/// Response payload: exactly one of `result` / `error` is non-null.
///
/// Both keys are always serialized (the null side included) so agents
/// can pattern-match without probing for key presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    /// Successful result, or null
    pub result: Option<Value>,
    /// Failure, or null
    pub error: Option<ToolError>,
}

/// Host-constructed response wrapper, mirroring the request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// Fresh host-minted id
    pub id: String,
    /// Protocol version
    pub version: u32,
    /// Always `"response"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Topic of the originating request
    pub topic: String,
    /// Container identifier of the originating session
    pub source: String,
    /// Reply key of the originating request
    pub correlation: String,
    /// Authorization compartment of the originating session
    pub group: String,
    /// Construction time
    pub timestamp: DateTime<Utc>,
    /// Result-or-error payload
    pub payload: ResponsePayload,
}

impl ResponseEnvelope {
    fn from_request(request: &RequestEnvelope, payload: ResponsePayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: PROTOCOL_VERSION,
            kind: "response".to_string(),
            topic: request.topic.clone(),
            source: request.source.clone(),
            correlation: request.correlation.clone(),
            group: request.group.clone(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Build a success response (`error` is null)
    pub fn success(request: &RequestEnvelope, result: Value) -> Self {
        Self::from_request(
            request,
            ResponsePayload {
                result: Some(result),
                error: None,
            },
        )
    }

    /// Build a failure response (`result` is null)
    pub fn failure(request: &RequestEnvelope, error: ToolError) -> Self {
        Self::from_request(
            request,
            ResponsePayload {
                result: None,
                error: Some(error),
            },
        )
    }

    /// Enforce the outbound frame limits on the serialized form.
    ///
    /// Returns the encoded bytes; violations surface as errors so the
    /// caller can substitute a `PLUGIN_ERROR` response.
    pub fn encode_checked(&self) -> Result<Vec<u8>> {
        let depth = json_depth(&serde_json::to_value(self)?);
        if depth > MAX_JSON_DEPTH {
            return Err(Error::DepthExceeded {
                depth,
                limit: MAX_JSON_DEPTH,
            });
        }
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge {
                size: bytes.len(),
                limit: MAX_FRAME_BYTES,
            });
        }
        Ok(bytes)
    }
}

/// Nesting depth of a JSON value (scalars are depth 1)
pub fn json_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 1,
    }
}
