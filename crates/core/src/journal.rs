use crate::error::Result;
use crate::events::EventKind;
use crate::providers::audit::{infer_severity, AuditSink};
use crate::types::{reject_sensitive_keys, AuditEvent, Decision};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Context attached to an emitted audit event.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub result: Option<Decision>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
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

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn result(mut self, result: Decision) -> Self {
        self.result = Some(result);
        self
    }

    pub fn ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Per-call recorder of audit events.
///
/// A journal is created for a single security operation (by the caller or
/// by the enforcement harness), accumulates events in emission order, and
/// forwards each one to the backing sink. Appending is monotonic; entries
/// are never removed. The harness reads [`AuditJournal::last_position`]
/// before a wrapped call and [`AuditJournal::events_after`] afterwards to
/// obtain exactly the events that call emitted.
pub struct AuditJournal {
    sequence_id: Uuid,
    entries: Mutex<Vec<EventKind>>,
    sink: Option<Arc<dyn AuditSink>>,
}

impl AuditJournal {
    /// Journal that forwards emitted events to the given sink.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sequence_id: Uuid::new_v4(),
            entries: Mutex::new(Vec::new()),
            sink: Some(sink),
        }
    }

    /// Validation-only journal with no backing sink. Used by the harness
    /// when the caller did not supply one.
    pub fn detached() -> Self {
        Self {
            sequence_id: Uuid::new_v4(),
            entries: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    /// Stable identifier correlating all events of this call.
    pub fn sequence_id(&self) -> Uuid {
        self.sequence_id
    }

    /// Current watermark: the number of events recorded so far.
    pub fn last_position(&self) -> usize {
        self.entries.lock().expect("journal lock poisoned").len()
    }

    /// Ordered slice of event kinds recorded after the given watermark.
    pub fn events_after(&self, position: usize) -> Vec<EventKind> {
        let entries = self.entries.lock().expect("journal lock poisoned");
        entries.get(position..).unwrap_or(&[]).to_vec()
    }

    /// Record an event and forward it to the sink.
    ///
    /// The sequence position is strictly increasing within the journal and
    /// events reach the sink in emission order. Context metadata must not
    /// carry sensitive field names.
    pub async fn record(&self, kind: EventKind, context: EventContext) -> Result<AuditEvent> {
        reject_sensitive_keys(&context.metadata)?;

        let position = {
            let mut entries = self.entries.lock().expect("journal lock poisoned");
            entries.push(kind);
            entries.len()
        };

        let mut metadata = context.metadata;
        metadata.insert(
            "sequence_id".to_string(),
            serde_json::json!(self.sequence_id.to_string()),
        );
        metadata.insert("sequence_position".to_string(), serde_json::json!(position));

        let result_label = context.result.map(|r| r.to_string());
        let event = AuditEvent {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            user_id: context.user_id,
            session_id: context.session_id,
            resource: context.resource,
            action: context.action,
            result: context.result,
            metadata,
            ip_address: context.ip_address,
            user_agent: context.user_agent,
            severity: infer_severity(kind, result_label.as_deref()).to_string(),
        };

        if let Some(sink) = &self.sink {
            sink.store(event.clone()).await?;
        }

        Ok(event)
    }

    /// Shorthand for recording an event with empty context.
    pub async fn emit(&self, kind: EventKind) -> Result<AuditEvent> {
        self.record(kind, EventContext::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_positions_strictly_increase() {
        let journal = AuditJournal::detached();
        assert_eq!(journal.last_position(), 0);

        let first = journal.emit(EventKind::AuthAttempt).await.unwrap();
        let second = journal.emit(EventKind::AuthSuccess).await.unwrap();

        assert_eq!(journal.last_position(), 2);
        assert_eq!(
            first.metadata.get("sequence_position"),
            Some(&serde_json::json!(1))
        );
        assert_eq!(
            second.metadata.get("sequence_position"),
            Some(&serde_json::json!(2))
        );
    }

    #[tokio::test]
    async fn test_events_after_watermark() {
        let journal = AuditJournal::detached();
        journal.emit(EventKind::AuthAttempt).await.unwrap();
        let watermark = journal.last_position();
        journal.emit(EventKind::CredentialVerify).await.unwrap();
        journal.emit(EventKind::AuthSuccess).await.unwrap();

        assert_eq!(
            journal.events_after(watermark),
            vec![EventKind::CredentialVerify, EventKind::AuthSuccess]
        );
        assert!(journal.events_after(99).is_empty());
    }

    #[tokio::test]
    async fn test_sequence_id_is_stable() {
        let journal = AuditJournal::detached();
        let a = journal.emit(EventKind::SessionCreate).await.unwrap();
        let b = journal.emit(EventKind::SessionDestroy).await.unwrap();
        assert_eq!(
            a.metadata.get("sequence_id"),
            b.metadata.get("sequence_id")
        );
    }

    #[tokio::test]
    async fn test_sensitive_metadata_rejected() {
        let journal = AuditJournal::detached();
        let context = EventContext::new().meta("password_hint", serde_json::json!("blue"));
        let err = journal.record(EventKind::AuthAttempt, context).await;
        assert!(err.is_err());
        // Nothing was appended
        assert_eq!(journal.last_position(), 0);
    }
}
