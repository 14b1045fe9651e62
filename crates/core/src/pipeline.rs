//! Validation pipeline
//!
//! The only path from untrusted bytes to privileged code. Every wire
//! message traverses four synchronous stages in fixed order — construct,
//! topic, payload, authorize — and comes out as either a validated
//! `(envelope, tool)` pair or a typed rejection. The first failing
//! stage wins: an unknown tool is reported as `UNKNOWN_TOOL` even when
//! the arguments and group would also have failed.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::protocol::{
    ErrorCode, RequestEnvelope, ToolError, WireMessage, TOOL_TOPIC_PREFIX,
};
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::session::SessionContext;
use crate::tools::{ToolCatalog, ToolDescriptor};

/// Pipeline stage names, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Envelope construction from trusted session fields
    Construct,
    /// Topic whitelist and catalog lookup
    Topic,
    /// Argument validation against the compiled schema
    Payload,
    /// Group restriction and rate limiting
    Authorize,
}

impl Stage {
    /// Stage name as recorded in audit entries
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Construct => "construct",
            Stage::Topic => "topic",
            Stage::Payload => "payload",
            Stage::Authorize => "authorize",
        }
    }
}

/// A typed pipeline rejection.
///
/// The envelope is always present: construction runs first, so even a
/// rejected request has its trusted wrapper for the reply path.
#[derive(Debug)]
pub struct Rejection {
    /// Stage that rejected the request
    pub stage: Stage,
    /// Structured error to surface
    pub error: ToolError,
    /// Envelope built in stage 1
    pub envelope: RequestEnvelope,
}

/// A validated `(envelope, tool)` pair ready for the executor
#[derive(Debug)]
pub struct Validated {
    /// Fully qualified request envelope
    pub envelope: RequestEnvelope,
    /// Resolved tool descriptor
    pub tool: Arc<ToolDescriptor>,
}

/// Everything a rejection sink needs to observe one rejection
pub struct RejectionNotice<'a> {
    /// The offending wire message
    pub wire: &'a WireMessage,
    /// The session it arrived under
    pub session: &'a SessionContext,
    /// Stage that rejected
    pub stage: Stage,
    /// Structured error
    pub error: &'a ToolError,
}

/// Callback fired exactly once per rejected wire message
pub type RejectionSink = Box<dyn Fn(&RejectionNotice<'_>) + Send + Sync>;

/// The four-stage validation pipeline
pub struct ValidationPipeline {
    catalog: Arc<ToolCatalog>,
    limiter: Arc<RateLimiter>,
    on_rejection: RwLock<Option<RejectionSink>>,
}

impl ValidationPipeline {
    /// Pipeline over a tool catalog and rate limiter
    pub fn new(catalog: Arc<ToolCatalog>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            catalog,
            limiter,
            on_rejection: RwLock::new(None),
        }
    }

    /// Install the single rejection sink (the audit log is the typical
    /// consumer)
    pub fn set_rejection_sink(&self, sink: RejectionSink) {
        *self.on_rejection.write().expect("sink lock") = Some(sink);
    }

    /// Run a wire message through all stages.
    ///
    /// On rejection the sink fires exactly once, before this returns.
    pub fn process(
        &self,
        wire: &WireMessage,
        session: &SessionContext,
    ) -> std::result::Result<Validated, Rejection> {
        match self.run_stages(wire, session) {
            Ok(validated) => Ok(validated),
            Err(rejection) => {
                tracing::debug!(
                    topic = %wire.topic,
                    correlation = %wire.correlation,
                    stage = rejection.stage.name(),
                    code = ?rejection.error.code,
                    "pipeline rejected request"
                );
                if let Some(sink) = self.on_rejection.read().expect("sink lock").as_ref() {
                    sink(&RejectionNotice {
                        wire,
                        session,
                        stage: rejection.stage,
                        error: &rejection.error,
                    });
                }
                Err(rejection)
            }
        }
    }

    fn run_stages(
        &self,
        wire: &WireMessage,
        session: &SessionContext,
    ) -> std::result::Result<Validated, Rejection> {
        // Stage 1: construct. Trusted fields come from the session, the
        // wire contributes topic/correlation/arguments only.
        let envelope = RequestEnvelope::from_wire(wire, session);
        let attached_envelope = Some(envelope.clone());

        // Stage 2: topic
        let tool_name = match wire.topic.strip_prefix(TOOL_TOPIC_PREFIX) {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(Rejection {
                    stage: Stage::Topic,
                    error: ToolError::new(
                        ErrorCode::UnknownTool,
                        format!("topic '{}' is not a tool invocation", wire.topic),
                    ),
                    envelope,
                })
            }
        };
        let tool = match self.catalog.get(tool_name) {
            Some(tool) => tool,
            None => {
                return Err(Rejection {
                    stage: Stage::Topic,
                    error: ToolError::new(
                        ErrorCode::UnknownTool,
                        format!("tool '{}' is not registered", tool_name),
                    ),
                    envelope,
                })
            }
        };
        let attached_tool = Some(tool.clone());

        // Stage 3: payload
        if let Err(violations) = tool.validate_arguments(&wire.arguments) {
            return Err(Rejection {
                stage: Stage::Payload,
                error: ToolError::new(
                    ErrorCode::ValidationFailed,
                    format!(
                        "arguments for '{}' failed validation: {}",
                        tool.name,
                        violations.join("; ")
                    ),
                ),
                envelope,
            });
        }

        // Stage 4: authorize — group restriction first, then the bucket
        if !tool.allows_group(&session.group) {
            return Err(Rejection {
                stage: Stage::Authorize,
                error: ToolError::new(
                    ErrorCode::Unauthorized,
                    format!("group '{}' may not invoke '{}'", session.group, tool.name),
                ),
                envelope,
            });
        }
        if let RateDecision::Limited { retry_after } = self
            .limiter
            .try_consume(&session.session_id, &session.group)
        {
            return Err(Rejection {
                stage: Stage::Authorize,
                error: ToolError::new(
                    ErrorCode::RateLimited,
                    format!("rate limit exceeded for group '{}'", session.group),
                )
                .with_retriable(true)
                .with_retry_after(retry_after),
                envelope,
            });
        }

        // Defensive guard: a stage that passed without attaching its
        // output is a programming error, not a request error.
        match (attached_envelope, attached_tool) {
            (Some(envelope), Some(tool)) => Ok(Validated { envelope, tool }),
            _ => Err(Rejection {
                stage: Stage::Construct,
                error: ToolError::new(
                    ErrorCode::PluginError,
                    "pipeline completed without a validated envelope",
                )
                .with_retriable(false),
                envelope,
            }),
        }
    }
}
