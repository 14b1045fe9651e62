//! Supervisor: the ownership root
//!
//! Owns every component for its lifetime and wires the data path:
//! transport events → session lookup → validation pipeline → handler
//! executor → sanitizer → reply, with the audit log observing each
//! outcome. Shutdown propagates top-down through one cancellation
//! token: the pipeline refuses new work, in-flight handlers see their
//! tokens fire, the transport closes, and the lifecycle manager tears
//! down every container.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditLog, AuditOutcome};
use crate::config::SupervisorConfig;
use crate::container::runtime::ContainerRuntime;
use crate::container::{LifecycleConfig, LifecycleManager};
use crate::dispatch::{
    DispatchOutcome, DispatcherConfig, EventDispatcher, EventMessage, GroupManifest,
};
use crate::error::{Error, Result};
use crate::executor::{ExecutorConfig, HandlerExecutor};
use crate::pipeline::ValidationPipeline;
use crate::protocol::{
    ConnectionIdentity, ErrorCode, ResponseEnvelope, ResponsePayload, ToolError, WireMessage,
};
use crate::ratelimit::RateLimiter;
use crate::sanitize::Sanitizer;
use crate::session::{SessionContext, SessionManager};
use crate::store::ResumeStore;
use crate::tools::{ToolCatalog, ToolDescriptor, ToolHandler};
use crate::transport::{ToolTransport, TransportEvent};

/// The supervisor process root
pub struct Supervisor {
    config: SupervisorConfig,
    catalog: Arc<ToolCatalog>,
    limiter: Arc<RateLimiter>,
    pipeline: Arc<ValidationPipeline>,
    executor: Arc<HandlerExecutor>,
    sanitizer: Arc<Sanitizer>,
    sessions: Arc<SessionManager>,
    lifecycle: Arc<LifecycleManager>,
    audit: Arc<AuditLog>,
    store: Arc<ResumeStore>,
    dispatcher: Arc<EventDispatcher>,
    transport: Arc<dyn ToolTransport>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Build every component from configuration.
    ///
    /// Nothing is bound or spawned yet; call `start` for that.
    pub async fn new(
        config: SupervisorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        transport: Arc<dyn ToolTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let audit = Arc::new(AuditLog::new(config.audit.base_path.clone()).await?);
        let limiter = Arc::new(RateLimiter::new(config.ratelimit.default_config())?);
        for (group, group_config) in &config.ratelimit.groups {
            limiter.set_group_config(group, *group_config)?;
        }

        let catalog = Arc::new(ToolCatalog::new());
        let sessions = Arc::new(SessionManager::new());
        let pipeline = Arc::new(ValidationPipeline::new(catalog.clone(), limiter.clone()));

        let shutdown = CancellationToken::new();
        let executor = Arc::new(HandlerExecutor::new(
            ExecutorConfig {
                handler_deadline: config.handler_deadline(),
                max_response_bytes: config.executor.max_response_bytes,
            },
            audit.clone(),
            shutdown.clone(),
        ));

        let lifecycle = Arc::new(LifecycleManager::new(
            runtime,
            sessions.clone(),
            LifecycleConfig {
                stop_timeout: config.stop_timeout(),
            },
        ));

        let store = Arc::new(ResumeStore::open(&config.store.path, config.store_ttl())?);
        let dispatcher = Arc::new(EventDispatcher::new(
            lifecycle.clone(),
            sessions.clone(),
            store.clone(),
            DispatcherConfig {
                allowed_topic_prefix: config.dispatch.allowed_topic_prefix.clone(),
                resume_fallback: config.dispatch.resume_fallback,
                socket_dir: config.lifecycle.socket_dir.clone(),
            },
        ));

        Ok(Self {
            config,
            catalog,
            limiter,
            pipeline,
            executor,
            sanitizer: Arc::new(Sanitizer::new()),
            sessions,
            lifecycle,
            audit,
            store,
            dispatcher,
            transport,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register a tool (atomic replace on re-registration)
    pub fn register_tool(&self, descriptor: ToolDescriptor) {
        self.catalog.register(descriptor);
    }

    /// Register a group's spawn manifest and, optionally, the handler
    /// serving its `explicit` session policy
    pub fn register_group(&self, manifest: GroupManifest, handler: Option<Arc<dyn ToolHandler>>) {
        self.dispatcher.register_group(manifest, handler);
    }

    /// Dispatch an externally published event
    pub async fn dispatch_event(&self, event: &EventMessage) -> Result<DispatchOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.dispatcher.dispatch(event).await
    }

    /// Component accessors for collaborators and tests
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The lifecycle manager
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// The audit log
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// The rate limiter
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The resume-session store
    pub fn store(&self) -> &Arc<ResumeStore> {
        &self.store
    }

    /// Initialize handlers, bind the endpoint, and start serving.
    ///
    /// The rejection sink is installed here: rejections stream into the
    /// audit log through a dedicated writer task, and the sink fires
    /// before any response for the correlation reaches the transport.
    pub async fn start(&self) -> Result<()> {
        for handler in self.catalog.handlers() {
            handler.initialize().await?;
        }

        let (rejection_tx, mut rejection_rx) = mpsc::unbounded_channel::<AuditEntry>();
        self.pipeline.set_rejection_sink(Box::new(move |notice| {
            let entry = AuditEntry::new(
                notice.session.group.clone(),
                notice.session.source.clone(),
                notice.wire.topic.clone(),
                AuditOutcome::Rejected,
            )
            .with_correlation(notice.wire.correlation.clone())
            .with_stage(notice.stage.name())
            .with_error(notice.error.clone());
            let _ = rejection_tx.send(entry);
        }));

        let audit = self.audit.clone();
        let writer_shutdown = self.shutdown.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    entry = rejection_rx.recv() => match entry {
                        Some(entry) => {
                            if let Err(e) = audit.append(&entry).await {
                                tracing::warn!(error = %e, "failed to write rejection entry");
                            }
                        }
                        None => break,
                    },
                    _ = writer_shutdown.cancelled() => {
                        // drain whatever is already queued, then stop
                        while let Ok(entry) = rejection_rx.try_recv() {
                            if let Err(e) = audit.append(&entry).await {
                                tracing::warn!(error = %e, "failed to write rejection entry");
                            }
                        }
                        break;
                    }
                }
            }
        });

        self.transport.bind(&self.config.transport.endpoint)?;
        let mut events = self
            .transport
            .take_events()
            .ok_or_else(|| Error::InvalidConfig("transport events already taken".to_string()))?;

        let pipeline = self.pipeline.clone();
        let executor = self.executor.clone();
        let sanitizer = self.sanitizer.clone();
        let sessions = self.sessions.clone();
        let audit = self.audit.clone();
        let transport = self.transport.clone();
        let shutdown = self.shutdown.clone();

        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        None => break,
                        Some(TransportEvent::DeadlineExpired { identity, correlation }) => {
                            tracing::warn!(
                                identity = %identity.to_hex(),
                                correlation,
                                "request deadline expired without a response"
                            );
                        }
                        Some(TransportEvent::Request { identity, wire }) => {
                            let Some(session) = sessions.get_by_connection_identity(&identity)
                            else {
                                tracing::warn!(
                                    identity = %identity.to_hex(),
                                    topic = %wire.topic,
                                    "request from unknown connection dropped"
                                );
                                continue;
                            };
                            let pipeline = pipeline.clone();
                            let executor = executor.clone();
                            let sanitizer = sanitizer.clone();
                            let audit = audit.clone();
                            let transport = transport.clone();
                            tokio::spawn(async move {
                                handle_request(
                                    identity,
                                    wire,
                                    session.context(),
                                    pipeline,
                                    executor,
                                    sanitizer,
                                    audit,
                                    transport,
                                )
                                .await;
                            });
                        }
                    }
                }
            }
            tracing::info!("supervisor event loop stopped");
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(writer);
        tasks.push(event_loop);
        tracing::info!(endpoint = %self.config.transport.endpoint, "supervisor started");
        Ok(())
    }

    /// Stop everything, top-down.
    ///
    /// Pipeline and executor refuse new work immediately; pending
    /// handlers see their cancellation tokens fire; the transport
    /// closes; handlers shut down; every container and session is
    /// released.
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("supervisor stopping");
        self.shutdown.cancel();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        drop(tasks);

        self.transport.close();

        for handler in self.catalog.handlers() {
            if let Err(e) = handler.shutdown().await {
                tracing::warn!(error = %e, "handler shutdown failed");
            }
        }

        self.lifecycle.shutdown_all().await?;
        self.limiter.cleanup();
        tracing::info!("supervisor stopped");
        Ok(())
    }
}

/// One request, end to end: validate, execute, sanitize, reply.
#[allow(clippy::too_many_arguments)]
async fn handle_request(
    identity: ConnectionIdentity,
    wire: WireMessage,
    session: SessionContext,
    pipeline: Arc<ValidationPipeline>,
    executor: Arc<HandlerExecutor>,
    sanitizer: Arc<Sanitizer>,
    audit: Arc<AuditLog>,
    transport: Arc<dyn ToolTransport>,
) {
    let response = match pipeline.process(&wire, &session) {
        Ok(validated) => {
            executor
                .execute(validated.envelope, validated.tool, session.clone())
                .await
        }
        Err(rejection) => ResponseEnvelope::failure(&rejection.envelope, rejection.error),
    };

    let response = sanitize_response(response, &sanitizer, &audit).await;

    match transport.send_response(&identity, &response) {
        Ok(()) => {}
        Err(Error::NoPendingRequest(correlation)) => {
            tracing::debug!(correlation = %correlation, "late response discarded");
        }
        Err(Error::FrameTooLarge { .. }) | Err(Error::DepthExceeded { .. }) => {
            // executor caps bound the payload; envelope framing pushed
            // it over, so substitute an opaque failure
            let mut fallback = response.clone();
            fallback.payload = ResponsePayload {
                result: None,
                error: Some(ToolError::new(
                    ErrorCode::PluginError,
                    "response exceeded outbound frame limits",
                )),
            };
            if let Err(e) = transport.send_response(&identity, &fallback) {
                tracing::warn!(error = %e, "failed to send fallback response");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, correlation = %response.correlation, "failed to send response");
        }
    }
}

/// Run the payload through the sanitizer; on redaction, rewrite the
/// response and append the `sanitized` audit entry
async fn sanitize_response(
    response: ResponseEnvelope,
    sanitizer: &Sanitizer,
    audit: &AuditLog,
) -> ResponseEnvelope {
    let payload_value = match serde_json::to_value(&response.payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(error = %e, "response payload not serializable");
            return response;
        }
    };

    let sanitized = sanitizer.sanitize(&payload_value);
    if !sanitized.is_redacted() {
        return response;
    }

    let entry = AuditEntry::new(
        response.group.clone(),
        response.source.clone(),
        response.topic.clone(),
        AuditOutcome::Sanitized,
    )
    .with_correlation(response.correlation.clone())
    .with_field_paths(sanitized.redacted_paths.clone());
    if let Err(e) = audit.append(&entry).await {
        tracing::warn!(error = %e, "failed to write sanitize entry");
    }

    match serde_json::from_value(sanitized.value) {
        Ok(payload) => {
            let mut response = response;
            response.payload = payload;
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "sanitized payload lost its shape");
            let mut response = response;
            response.payload = ResponsePayload {
                result: None,
                error: Some(ToolError::new(
                    ErrorCode::PluginError,
                    "response could not be sanitized",
                )),
            };
            response
        }
    }
}
