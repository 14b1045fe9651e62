//! Handler executor
//!
//! Drives a validated invocation against its tool handler under a
//! deadline and a response size cap, then normalizes whatever comes
//! back into a well-formed response envelope:
//!
//! - reserved pipeline codes from handlers are rewritten to
//!   `HANDLER_ERROR` (message preserved),
//! - internal failures and panics become an opaque `PLUGIN_ERROR` —
//!   the original message and backtrace never leave the host,
//! - oversize results (success or error) become `HANDLER_ERROR`.
//!
//! Every normalized error writes two linked audit entries
//! (`before_normalization`, then `after_normalization`); successes
//! write a single `routed` entry.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditLog, AuditOutcome, NormalizationPhase};
use crate::protocol::{
    ErrorCode, RequestEnvelope, ResponseEnvelope, ToolError, MAX_FRAME_BYTES,
};
use crate::session::SessionContext;
use crate::tools::{HandlerFailure, InvocationContext, ToolDescriptor};

/// Executor bounds
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Wall-clock budget for one handler invocation
    pub handler_deadline: Duration,
    /// Serialized size cap for a result or error payload
    pub max_response_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            handler_deadline: Duration::from_secs(35),
            max_response_bytes: MAX_FRAME_BYTES,
        }
    }
}

/// Drives tool handlers under deadline and size caps
pub struct HandlerExecutor {
    config: ExecutorConfig,
    audit: Arc<AuditLog>,
    shutdown: CancellationToken,
}

impl HandlerExecutor {
    /// Executor writing to the given audit log; `shutdown` is the
    /// supervisor's cancellation root
    pub fn new(config: ExecutorConfig, audit: Arc<AuditLog>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            audit,
            shutdown,
        }
    }

    /// Execute one validated invocation and produce its response.
    ///
    /// Never fails: every outcome, including audit I/O trouble, ends in
    /// a well-formed response envelope.
    pub async fn execute(
        &self,
        envelope: RequestEnvelope,
        tool: Arc<ToolDescriptor>,
        session: SessionContext,
    ) -> ResponseEnvelope {
        if self.shutdown.is_cancelled() {
            let error = ToolError::new(
                ErrorCode::PluginUnavailable,
                format!("tool '{}' unavailable: supervisor is shutting down", tool.name),
            );
            self.audit_single_error(&envelope, &error, "shutdown").await;
            return ResponseEnvelope::failure(&envelope, error);
        }

        let token = self.shutdown.child_token();
        let handler = tool.handler.clone();
        let tool_name = tool.name.clone();
        let arguments = envelope.payload.clone();
        let invocation_token = token.clone();

        // The handler runs in its own task so a panic is contained and
        // a deadline overrun leaves it to finish cooperatively.
        let mut task = tokio::spawn(async move {
            let ctx = InvocationContext {
                session,
                cancellation_token: invocation_token,
            };
            handler
                .handle_tool_invocation(&tool_name, &arguments, &ctx)
                .await
        });

        let outcome = tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(join_error) => {
                    if join_error.is_panic() {
                        tracing::error!(tool = %tool.name, "handler panicked");
                        Err(HandlerFailure::Internal(anyhow::anyhow!(
                            "handler panicked"
                        )))
                    } else {
                        Err(HandlerFailure::Internal(anyhow::anyhow!(
                            "handler task was aborted"
                        )))
                    }
                }
            },
            _ = tokio::time::sleep(self.config.handler_deadline) => {
                token.cancel();
                tracing::warn!(
                    tool = %tool.name,
                    deadline_ms = self.config.handler_deadline.as_millis() as u64,
                    "handler deadline expired"
                );
                let error = ToolError::new(
                    ErrorCode::PluginTimeout,
                    format!(
                        "tool '{}' timed out after {} ms",
                        tool.name,
                        self.config.handler_deadline.as_millis()
                    ),
                );
                self.audit_single_error(&envelope, &error, "deadline expired").await;
                return ResponseEnvelope::failure(&envelope, error);
            }
            _ = self.shutdown.cancelled() => {
                token.cancel();
                let error = ToolError::new(
                    ErrorCode::PluginUnavailable,
                    format!("tool '{}' aborted: supervisor is shutting down", tool.name),
                );
                self.audit_single_error(&envelope, &error, "shutdown").await;
                return ResponseEnvelope::failure(&envelope, error);
            }
        };

        match outcome {
            Ok(result) => {
                let size = serialized_len(&result);
                if size > self.config.max_response_bytes {
                    let error = self.oversize_error(&tool.name);
                    self.audit_pair(
                        &envelope,
                        None,
                        Some(format!(
                            "success result of {} bytes exceeds the {} byte size cap",
                            size, self.config.max_response_bytes
                        )),
                        &error,
                    )
                    .await;
                    return ResponseEnvelope::failure(&envelope, error);
                }

                self.append(
                    AuditEntry::new(
                        envelope.group.clone(),
                        envelope.source.clone(),
                        envelope.topic.clone(),
                        AuditOutcome::Routed,
                    )
                    .with_correlation(envelope.correlation.clone()),
                )
                .await;
                ResponseEnvelope::success(&envelope, result)
            }
            Err(HandlerFailure::Tool(original)) => {
                let mut normalized = original.clone();
                if normalized.code.is_reserved() {
                    tracing::warn!(
                        tool = %tool.name,
                        code = ?original.code,
                        "handler used a reserved pipeline code"
                    );
                    normalized.code = ErrorCode::HandlerError;
                }
                if serialized_len_error(&normalized) > self.config.max_response_bytes {
                    normalized = self.oversize_error(&tool.name);
                }
                self.audit_pair(&envelope, Some(&original), None, &normalized)
                    .await;
                ResponseEnvelope::failure(&envelope, normalized)
            }
            Err(HandlerFailure::Internal(cause)) => {
                // Logged host-side only; the agent sees a generic code.
                tracing::error!(tool = %tool.name, error = %cause, "handler failed");
                let normalized =
                    ToolError::new(ErrorCode::PluginError, "tool handler failed unexpectedly");
                self.audit_pair(&envelope, None, Some(cause.to_string()), &normalized)
                    .await;
                ResponseEnvelope::failure(&envelope, normalized)
            }
        }
    }

    fn oversize_error(&self, tool: &str) -> ToolError {
        ToolError::new(
            ErrorCode::HandlerError,
            format!(
                "tool '{}' response exceeds the maximum size of {} bytes",
                tool, self.config.max_response_bytes
            ),
        )
        .with_retriable(false)
    }

    async fn append(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.append(&entry).await {
            tracing::warn!(error = %e, "failed to append audit entry");
        }
    }

    async fn audit_single_error(
        &self,
        envelope: &RequestEnvelope,
        error: &ToolError,
        reason: &str,
    ) {
        self.append(
            AuditEntry::new(
                envelope.group.clone(),
                envelope.source.clone(),
                envelope.topic.clone(),
                AuditOutcome::Error,
            )
            .with_correlation(envelope.correlation.clone())
            .with_reason(reason.to_string())
            .with_error(error.clone()),
        )
        .await;
    }

    /// The linked before/after pair for a normalized error, written in
    /// order under the same correlation
    async fn audit_pair(
        &self,
        envelope: &RequestEnvelope,
        before_error: Option<&ToolError>,
        before_reason: Option<String>,
        after: &ToolError,
    ) {
        let mut before = AuditEntry::new(
            envelope.group.clone(),
            envelope.source.clone(),
            envelope.topic.clone(),
            AuditOutcome::Error,
        )
        .with_correlation(envelope.correlation.clone())
        .with_phase(NormalizationPhase::BeforeNormalization);
        if let Some(error) = before_error {
            before = before.with_error(error.clone());
        }
        if let Some(reason) = before_reason {
            before = before.with_reason(reason);
        }
        self.append(before).await;

        self.append(
            AuditEntry::new(
                envelope.group.clone(),
                envelope.source.clone(),
                envelope.topic.clone(),
                AuditOutcome::Error,
            )
            .with_correlation(envelope.correlation.clone())
            .with_phase(NormalizationPhase::AfterNormalization)
            .with_error(after.clone()),
        )
        .await;
    }
}

fn serialized_len(value: &serde_json::Value) -> usize {
    serde_json::to_vec(value).map(|b| b.len()).unwrap_or(usize::MAX)
}

fn serialized_len_error(error: &ToolError) -> usize {
    serde_json::to_vec(error).map(|b| b.len()).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionIdentity, WireMessage};
    use crate::tools::{HandlerResult, RiskLevel, ToolHandler};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Map, Value};

    struct ScriptedHandler {
        script: Script,
    }

    enum Script {
        Succeed(Value),
        FailTool(ToolError),
        FailInternal(String),
        Panic,
        Hang,
    }

    #[async_trait]
    impl ToolHandler for ScriptedHandler {
        async fn handle_tool_invocation(
            &self,
            _tool: &str,
            _arguments: &Map<String, Value>,
            ctx: &InvocationContext,
        ) -> HandlerResult {
            match &self.script {
                Script::Succeed(value) => Ok(value.clone()),
                Script::FailTool(error) => Err(HandlerFailure::Tool(error.clone())),
                Script::FailInternal(message) => {
                    Err(HandlerFailure::Internal(anyhow::anyhow!(message.clone())))
                }
                Script::Panic => panic!("boom"),
                Script::Hang => {
                    ctx.cancellation_token.cancelled().await;
                    Err(HandlerFailure::Internal(anyhow::anyhow!("cancelled")))
                }
            }
        }
    }

    fn tool_with(script: Script) -> Arc<ToolDescriptor> {
        Arc::new(
            ToolDescriptor::new(
                "probe",
                json!({"type": "object"}),
                None,
                RiskLevel::Low,
                Arc::new(ScriptedHandler { script }),
            )
            .unwrap(),
        )
    }

    fn request(correlation: &str) -> (RequestEnvelope, SessionContext) {
        let session = SessionContext {
            session_id: "sess-1".to_string(),
            group: "email".to_string(),
            source: "ctr-1".to_string(),
            connection_identity: ConnectionIdentity::new(b"id".to_vec()),
            started_at: Utc::now(),
        };
        let wire = WireMessage {
            topic: "tool.invoke.probe".to_string(),
            correlation: correlation.to_string(),
            arguments: Map::new(),
            extra: Map::new(),
        };
        (RequestEnvelope::from_wire(&wire, &session), session)
    }

    async fn executor(config: ExecutorConfig) -> (tempfile::TempDir, HandlerExecutor, Arc<AuditLog>) {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path()).await.unwrap());
        let executor = HandlerExecutor::new(config, audit.clone(), CancellationToken::new());
        (dir, executor, audit)
    }

    #[tokio::test]
    async fn test_success_writes_single_routed_entry() {
        let (_dir, executor, audit) = executor(ExecutorConfig::default()).await;
        let (envelope, session) = request("c1");
        let response = executor
            .execute(envelope, tool_with(Script::Succeed(json!({"id": 7}))), session)
            .await;

        assert_eq!(response.payload.result, Some(json!({"id": 7})));
        assert!(response.payload.error.is_none());

        let entries = audit.by_correlation("email", "c1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Routed);
        assert!(entries[0].phase.is_none());
    }

    #[tokio::test]
    async fn test_reserved_code_rewritten_with_message_preserved() {
        let (_dir, executor, audit) = executor(ExecutorConfig::default()).await;
        let (envelope, session) = request("c2");
        let script = Script::FailTool(
            ToolError::new(ErrorCode::RateLimited, "calendar backend throttled").with_retriable(true),
        );
        let response = executor.execute(envelope, tool_with(script), session).await;

        let error = response.payload.error.unwrap();
        assert_eq!(error.code, ErrorCode::HandlerError);
        assert_eq!(error.message, "calendar backend throttled");
        assert!(error.retriable);
        assert!(response.payload.result.is_none());

        let entries = audit.by_correlation("email", "c2").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].phase,
            Some(NormalizationPhase::BeforeNormalization)
        );
        assert_eq!(
            entries[0].error.as_ref().unwrap().code,
            ErrorCode::RateLimited
        );
        assert_eq!(
            entries[1].phase,
            Some(NormalizationPhase::AfterNormalization)
        );
        assert_eq!(
            entries[1].error.as_ref().unwrap().code,
            ErrorCode::HandlerError
        );
    }

    #[tokio::test]
    async fn test_non_reserved_handler_error_passes_through() {
        let (_dir, executor, _audit) = executor(ExecutorConfig::default()).await;
        let (envelope, session) = request("c3");
        let script = Script::FailTool(
            ToolError::new(ErrorCode::HandlerError, "mailbox is full").with_retriable(true),
        );
        let response = executor.execute(envelope, tool_with(script), session).await;

        let error = response.payload.error.unwrap();
        assert_eq!(error.code, ErrorCode::HandlerError);
        assert_eq!(error.message, "mailbox is full");
        assert!(error.retriable);
    }

    #[tokio::test]
    async fn test_internal_failure_is_opaque() {
        let (_dir, executor, _audit) = executor(ExecutorConfig::default()).await;
        let (envelope, session) = request("c4");
        let script = Script::FailInternal("ECONNREFUSED 127.0.0.1:5432".to_string());
        let response = executor.execute(envelope, tool_with(script), session).await;

        let serialized = serde_json::to_string(&response).unwrap();
        assert!(!serialized.contains("ECONNREFUSED"));
        assert!(!serialized.contains("127.0.0.1:5432"));

        let error = response.payload.error.unwrap();
        assert_eq!(error.code, ErrorCode::PluginError);
        assert!(!error.retriable);
    }

    #[tokio::test]
    async fn test_panic_is_opaque() {
        let (_dir, executor, _audit) = executor(ExecutorConfig::default()).await;
        let (envelope, session) = request("c5");
        let response = executor.execute(envelope, tool_with(Script::Panic), session).await;

        let serialized = serde_json::to_string(&response).unwrap();
        assert!(!serialized.contains("boom"));
        let error = response.payload.error.unwrap();
        assert_eq!(error.code, ErrorCode::PluginError);
    }

    #[tokio::test]
    async fn test_deadline_yields_plugin_timeout() {
        let (_dir, executor, _audit) = executor(ExecutorConfig {
            handler_deadline: Duration::from_millis(50),
            max_response_bytes: MAX_FRAME_BYTES,
        })
        .await;
        let (envelope, session) = request("c6");
        let response = executor.execute(envelope, tool_with(Script::Hang), session).await;

        let error = response.payload.error.unwrap();
        assert_eq!(error.code, ErrorCode::PluginTimeout);
        assert!(error.retriable);
        assert!(error.message.contains("probe"));
    }

    #[tokio::test]
    async fn test_oversize_success_becomes_handler_error() {
        let (_dir, executor, audit) = executor(ExecutorConfig {
            handler_deadline: Duration::from_secs(5),
            max_response_bytes: 128,
        })
        .await;
        let (envelope, session) = request("c7");
        let script = Script::Succeed(json!({"blob": "x".repeat(4096)}));
        let response = executor.execute(envelope, tool_with(script), session).await;

        let error = response.payload.error.unwrap();
        assert_eq!(error.code, ErrorCode::HandlerError);
        assert!(!error.retriable);
        assert!(error.message.contains("size"));

        let entries = audit.by_correlation("email", "c7").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path()).await.unwrap());
        let shutdown = CancellationToken::new();
        let executor = HandlerExecutor::new(ExecutorConfig::default(), audit, shutdown.clone());
        shutdown.cancel();

        let (envelope, session) = request("c8");
        let response = executor
            .execute(envelope, tool_with(Script::Succeed(json!({}))), session)
            .await;
        let error = response.payload.error.unwrap();
        assert_eq!(error.code, ErrorCode::PluginUnavailable);
        assert!(error.retriable);
    }
}
