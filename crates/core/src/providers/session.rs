use crate::enforcement::ContractMap;
use crate::error::Result;
use crate::events::EventKind;
use crate::journal::AuditJournal;
use crate::pipeline::Pipeline;
use crate::types::Session;
use async_trait::async_trait;
use chrono::Duration;
use once_cell::sync::Lazy;

/// Client context supplied with session operations.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Pipelines each audited operation must satisfy.
pub static CONTRACT: Lazy<ContractMap> = Lazy::new(|| {
    let mut table = ContractMap::new();
    table.insert("create_session", Pipeline::event(EventKind::SessionCreate));
    table.insert(
        "validate_session",
        Pipeline::any_of([
            EventKind::SessionAccess,
            EventKind::SessionExpire,
            EventKind::SessionInvalid,
            EventKind::SecurityViolation,
        ]),
    );
    table.insert("refresh_session", Pipeline::event(EventKind::SessionRefresh));
    table.insert("destroy_session", Pipeline::event(EventKind::SessionDestroy));
    table
});

/// Lifecycle management for opaque sessions.
///
/// Session identifiers are cryptographically random; sessions are bound to
/// a device fingerprint at creation and validation requires exact equality.
/// Validation runs under a minimum-time budget so lookup misses, expiry and
/// fingerprint mismatches are not timing-distinguishable from success.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session bound to the given fingerprint.
    ///
    /// Must record `session.create`.
    async fn create_session(
        &self,
        user_id: &str,
        fingerprint: &str,
        client: ClientInfo,
        duration: Option<Duration>,
        journal: &AuditJournal,
    ) -> Result<Session>;

    /// Fetch without validating. Expired sessions are dropped and reported
    /// as absent.
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Validate and touch a session.
    ///
    /// Returns `None` for unknown, expired or hijack-suspect sessions.
    /// Must record one of `session.access`, `session.expire`,
    /// `session.invalid` or `security.violation`.
    async fn validate_session(
        &self,
        session_id: &str,
        fingerprint: &str,
        client: ClientInfo,
        journal: &AuditJournal,
    ) -> Result<Option<Session>>;

    /// Extend a session's expiry if the refresh threshold has elapsed;
    /// otherwise return it unchanged.
    ///
    /// Must record `session.refresh`.
    async fn refresh_session(
        &self,
        session_id: &str,
        journal: &AuditJournal,
    ) -> Result<Option<Session>>;

    /// Destroy a session. Idempotent; the second call returns `false`.
    ///
    /// Must record `session.destroy`.
    async fn destroy_session(&self, session_id: &str, journal: &AuditJournal) -> Result<bool>;

    /// Destroy every session belonging to a user. Returns the count.
    async fn destroy_user_sessions(&self, user_id: &str) -> Result<u64>;

    /// Sweep expired sessions. Returns the count removed.
    async fn cleanup_expired_sessions(&self) -> Result<u64>;

    /// All unexpired sessions for a user.
    async fn active_sessions(&self, user_id: &str) -> Result<Vec<Session>>;
}
