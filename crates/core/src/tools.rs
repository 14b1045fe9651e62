//! Tool catalog and handler capability interface
//!
//! Tools are registered explicitly at startup. A descriptor is
//! immutable once registered; re-registration replaces it atomically.
//! Argument schemas are compiled once (draft 7) at registration and
//! are forced to forbid unknown properties.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::dispatch::EventMessage;
use crate::error::{Error, Result};
use crate::protocol::ToolError;
use crate::session::SessionContext;

/// Coarse risk classification of a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only or otherwise benign
    Low,
    /// Mutates user-visible state
    Medium,
    /// Sensitive side effects
    High,
}

/// Runtime context provided to handlers during an invocation
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Session on whose behalf the invocation runs
    pub session: SessionContext,
    /// Fires on deadline expiry and on supervisor stop; handlers doing
    /// I/O should wire it through
    pub cancellation_token: CancellationToken,
}

/// A handler-side failure.
///
/// `Tool` is the structured `{ok: false, error}` path and surfaces to
/// the agent (after reserved-code normalization). `Internal` is opaque:
/// it is logged host-side and the agent only ever sees a generic
/// `PLUGIN_ERROR`.
#[derive(Debug)]
pub enum HandlerFailure {
    /// Structured tool error, surfaced after normalization
    Tool(ToolError),
    /// Opaque host-side failure, never surfaced verbatim
    Internal(anyhow::Error),
}

impl From<ToolError> for HandlerFailure {
    fn from(error: ToolError) -> Self {
        HandlerFailure::Tool(error)
    }
}

impl From<anyhow::Error> for HandlerFailure {
    fn from(error: anyhow::Error) -> Self {
        HandlerFailure::Internal(error)
    }
}

/// Outcome of a handler invocation
pub type HandlerResult = std::result::Result<Value, HandlerFailure>;

/// Capability interface implemented by tool handlers.
///
/// Handlers are external collaborators: the core never implements a
/// concrete tool. Registration is explicit at startup; there is no
/// runtime discovery.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// One-time startup hook
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Execute one tool invocation
    async fn handle_tool_invocation(
        &self,
        tool: &str,
        arguments: &Map<String, Value>,
        ctx: &InvocationContext,
    ) -> HandlerResult;

    /// One-time teardown hook
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Resolve a session for an `explicit`-policy event spawn.
    ///
    /// Returns a live session id to resume, or `None` for a fresh
    /// container. Errors are dispatcher errors: logged, no spawn.
    async fn resolve_session(
        &self,
        event: &EventMessage,
        sessions: &[SessionContext],
    ) -> anyhow::Result<Option<String>> {
        let _ = (event, sessions);
        Ok(None)
    }
}

/// Registered tool: schema, authorization, risk, handler
pub struct ToolDescriptor {
    /// Tool name (the `tool.invoke.` topic tail)
    pub name: String,
    /// Raw argument schema after closed-schema enforcement
    pub arguments_schema: Value,
    /// Groups allowed to call the tool; `None` means unrestricted
    pub allowed_groups: Option<HashSet<String>>,
    /// Risk classification
    pub risk_level: RiskLevel,
    /// Handler capability
    pub handler: Arc<dyn ToolHandler>,
    compiled: Validator,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("allowed_groups", &self.allowed_groups)
            .field("risk_level", &self.risk_level)
            .finish()
    }
}

impl ToolDescriptor {
    /// Compile a descriptor.
    ///
    /// Object schemas that do not state `additionalProperties` get
    /// `false` injected so unknown argument keys are always rejected.
    pub fn new(
        name: impl Into<String>,
        arguments_schema: Value,
        allowed_groups: Option<HashSet<String>>,
        risk_level: RiskLevel,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<Self> {
        let name = name.into();
        let arguments_schema = close_schema(arguments_schema);
        let compiled = jsonschema::draft7::new(&arguments_schema).map_err(|e| Error::Schema {
            tool: name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name,
            arguments_schema,
            allowed_groups,
            risk_level,
            handler,
            compiled,
        })
    }

    /// Validate arguments against the compiled schema.
    ///
    /// Returns every violation as a rendered message.
    pub fn validate_arguments(
        &self,
        arguments: &Map<String, Value>,
    ) -> std::result::Result<(), Vec<String>> {
        let value = Value::Object(arguments.clone());
        if self.compiled.validate(&value).is_ok() {
            return Ok(());
        }
        let errors: Vec<String> = self
            .compiled
            .iter_errors(&value)
            .map(|error| format!("{} at /{}", error, error.instance_path))
            .collect();
        Err(errors)
    }

    /// Whether the group may call this tool
    pub fn allows_group(&self, group: &str) -> bool {
        match &self.allowed_groups {
            Some(groups) => groups.contains(group),
            None => true,
        }
    }
}

/// Inject `additionalProperties: false` into object schemas that leave
/// it unstated
fn close_schema(mut schema: Value) -> Value {
    if let Value::Object(map) = &mut schema {
        let is_object_schema = map.get("type").and_then(Value::as_str) == Some("object")
            || map.contains_key("properties");
        if is_object_schema && !map.contains_key("additionalProperties") {
            map.insert("additionalProperties".to_string(), Value::Bool(false));
        }
    }
    schema
}

/// Thread-safe tool registry with atomic replacement
#[derive(Default)]
pub struct ToolCatalog {
    tools: RwLock<HashMap<String, Arc<ToolDescriptor>>>,
}

impl ToolCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, atomically replacing any previous descriptor
    /// under the same name
    pub fn register(&self, descriptor: ToolDescriptor) {
        let name = descriptor.name.clone();
        self.tools
            .write()
            .expect("catalog lock")
            .insert(name.clone(), Arc::new(descriptor));
        tracing::debug!(tool = %name, "tool registered");
    }

    /// Look up a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.read().expect("catalog lock").get(name).cloned()
    }

    /// Remove a tool; returns whether it was present
    pub fn remove(&self, name: &str) -> bool {
        self.tools
            .write()
            .expect("catalog lock")
            .remove(name)
            .is_some()
    }

    /// Registered tool names
    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .expect("catalog lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.read().expect("catalog lock").len()
    }

    /// Whether no tools are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct handlers across all tools (one handler often serves
    /// several tools; lifecycle hooks must run once per handler)
    pub fn handlers(&self) -> Vec<Arc<dyn ToolHandler>> {
        let tools = self.tools.read().expect("catalog lock");
        let mut seen: Vec<Arc<dyn ToolHandler>> = Vec::new();
        for descriptor in tools.values() {
            let handler = descriptor.handler.clone();
            let data_ptr = Arc::as_ptr(&handler) as *const ();
            if !seen
                .iter()
                .any(|h| std::ptr::eq(Arc::as_ptr(h) as *const (), data_ptr))
            {
                seen.push(handler);
            }
        }
        seen
    }
}
