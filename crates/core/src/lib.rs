//! # Warden Core
//!
//! Framework crate for the Warden authentication and authorization system:
//! the audit event vocabulary and pipeline algebra, the per-call audit
//! journal and enforcement harness, the data model, the provider
//! capability contracts, configuration, and the `AuthGateway`
//! orchestration service.
//!
//! Every security operation declares the audit events it must emit as a
//! [`pipeline::Pipeline`]; the [`enforcement`] harness verifies at runtime
//! that the operation's journal slice satisfies that declaration and fails
//! the call otherwise — even on the success path.
//!
//! Concrete providers live in the `warden-providers` crate; this crate
//! defines only their contracts.

pub mod config;
pub mod enforcement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod journal;
pub mod pipeline;
pub mod providers;
pub mod registry;
pub mod types;
pub mod util;

pub use config::AuthConfig;
pub use enforcement::enforce;
pub use error::{Error, ErrorCode, ErrorSeverity, Result};
pub use events::EventKind;
pub use gateway::AuthGateway;
pub use journal::{AuditJournal, EventContext};
pub use pipeline::{Pipeline, PipelineViolation};
pub use registry::ProviderRegistry;
pub use types::{
    AuditEvent, Credential, CredentialKind, Decision, PolicyDecision, PolicyRule,
    RateLimitResult, Role, Session, SubjectContext, Token, TokenType, User,
};
