//! Capability contracts for pluggable providers.
//!
//! Each provider kind is an async trait whose audited operations take an
//! [`crate::journal::AuditJournal`] and are bound to a declared pipeline in
//! the module's contract table. The enforcement harness consults these
//! tables when wrapping provider calls.

pub mod audit;
pub mod credential;
pub mod policy;
pub mod rate_limit;
pub mod session;
pub mod token;
pub mod user;

pub use audit::{AuditQuery, AuditSink, ExportFormat};
pub use credential::{CredentialMaterial, CredentialStore, PresentedCredential};
pub use policy::PolicyEngine;
pub use rate_limit::RateLimiter;
pub use session::{ClientInfo, SessionStore};
pub use token::TokenService;
pub use user::{NewUser, RoleChange, UserDirectory, UserUpdate};
