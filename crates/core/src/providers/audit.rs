use crate::error::Result;
use crate::events::EventKind;
use crate::types::AuditEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Supported audit export formats. Only JSON is defined; requesting any
/// other format is an error, not a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
}

impl FromStr for ExportFormat {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            other => Err(crate::error::Error::validation(format!(
                "Unsupported export format: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "json"),
        }
    }
}

/// Filter for querying stored audit events. Absent fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub kinds: Option<Vec<EventKind>>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub resource: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum events returned; defaults to 100
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Filter preset for security-relevant events (failures, violations).
    pub fn security_events() -> Self {
        Self::new().kinds([
            EventKind::AuthFailure,
            EventKind::AuthzDeny,
            EventKind::SessionExpire,
            EventKind::SessionDestroy,
            EventKind::SecurityViolation,
            EventKind::SecurityAnomaly,
            EventKind::RateLimitExceeded,
        ])
    }
}

/// Severity label for a stored event.
///
/// Failure-shaped kinds are warnings; destructive administrative kinds are
/// medium; everything else is low unless the result value escalates it.
pub fn infer_severity(kind: EventKind, result: Option<&str>) -> &'static str {
    match kind {
        EventKind::AuthFailure
        | EventKind::AuthzDeny
        | EventKind::SecurityViolation
        | EventKind::SecurityAnomaly
        | EventKind::RateLimitExceeded => "warning",
        EventKind::UserDelete | EventKind::SessionDestroy => "medium",
        _ => match result {
            Some("failure") | Some("error") | Some("denied") | Some("deny") => "warning",
            _ => "low",
        },
    }
}

/// Durable storage for audit events.
///
/// Implementations must be internally synchronized: events arriving from a
/// journal are stored in emission order, and any secondary indexes are
/// updated in the same critical section as the primary record.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Store one event. Sanitization of sensitive metadata happens here,
    /// before the event becomes durable.
    async fn store(&self, event: AuditEvent) -> Result<()>;

    /// Query stored events matching all present filters, newest first,
    /// paginated by `limit`/`offset`.
    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEvent>>;

    /// Remove events older than the cutoff. Returns the deletion count.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Export stored events in the given format.
    async fn export(&self, format: ExportFormat) -> Result<String>;

    /// Number of currently stored events.
    async fn count(&self) -> Result<u64>;
}
