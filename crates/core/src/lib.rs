//! Warden core - host-side sandbox supervision
//!
//! Warden mediates every tool invocation issued by untrusted agent
//! processes running inside per-session containers. An agent dials the
//! host's ROUTER endpoint and asks for privileged work by naming a
//! tool; the host validates, authorizes, rate-limits, executes,
//! sanitizes, audits, and replies. Agents hold no credentials and have
//! no network or filesystem authority of their own.
//!
//! # Architecture
//!
//! This crate is transport-agnostic. It owns:
//!
//! - the wire protocol types and frame limits (`protocol`)
//! - the four-stage validation pipeline (`pipeline`), the only path
//!   from untrusted bytes to privileged code
//! - per-session token-bucket rate limiting (`ratelimit`)
//! - the handler executor with deadline/size bounds and error
//!   normalization (`executor`)
//! - the credential sanitizer (`sanitize`)
//! - session minting and lookup (`session`)
//! - container lifecycle over pluggable engine adapters (`container`)
//! - the append-only per-group audit log (`audit`)
//! - event-triggered session spawning (`dispatch`)
//! - the resume-session store (`store`)
//! - the supervisor that owns and wires all of the above
//!   (`supervisor`)
//!
//! Transport implementations depend on this crate and implement the
//! `transport::ToolTransport` trait; the ZeroMQ ROUTER realization
//! lives in the `warden-zmq` crate.

#![warn(clippy::all)]

pub mod audit;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod executor;
pub mod pipeline;
pub mod protocol;
pub mod ratelimit;
pub mod sanitize;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod tools;
pub mod transport;

// Error types
mod error;
pub use error::{Error, Result};

// Re-export the types most integrations touch
pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use config::SupervisorConfig;
pub use pipeline::ValidationPipeline;
pub use protocol::{
    ConnectionIdentity, ErrorCode, RequestEnvelope, ResponseEnvelope, ToolError, WireMessage,
};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use sanitize::Sanitizer;
pub use session::{SessionContext, SessionManager};
pub use supervisor::Supervisor;
pub use tools::{ToolCatalog, ToolDescriptor, ToolHandler};
pub use transport::{ToolTransport, TransportEvent};

/// Initialize the Warden core
///
/// This should be called once at startup to initialize logging.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Warden core initialized");
    Ok(())
}
