use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use warden_core::error::Result;
use warden_core::providers::audit::{infer_severity, AuditQuery, AuditSink, ExportFormat};
use warden_core::types::{is_sensitive_key, AuditEvent};

/// Configuration for the in-memory audit sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditSinkConfig {
    pub retention_days: i64,
    /// Hard cap; the oldest events beyond it are evicted
    pub max_events: usize,
    /// When false, sensitive metadata values are redacted before storage
    pub include_sensitive_data: bool,
    pub cleanup_interval_secs: u64,
}

impl Default for AuditSinkConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            max_events: 100_000,
            include_sensitive_data: false,
            cleanup_interval_secs: 300,
        }
    }
}

const DEFAULT_QUERY_LIMIT: usize = 100;
const TRUNCATE_METADATA_AT: usize = 100;

/// In-memory audit sink with secondary indexes by user, event kind and
/// hour bucket.
///
/// The indexes are advisory: a query falls back to a full scan whenever an
/// index has no entry for its key, so a missing index entry can hide
/// nothing. Index updates happen in the same critical section as the
/// primary record.
pub struct MemoryAuditSink {
    events: DashMap<String, AuditEvent>,
    user_index: DashMap<String, Vec<String>>,
    kind_index: DashMap<String, Vec<String>>,
    /// Keyed by whole hours since the epoch
    time_index: DashMap<i64, Vec<String>>,
    /// Serializes compound writes across the primary map and the indexes
    write_guard: Mutex<()>,
    config: AuditSinkConfig,
}

impl MemoryAuditSink {
    pub fn new(config: AuditSinkConfig) -> Self {
        Self {
            events: DashMap::new(),
            user_index: DashMap::new(),
            kind_index: DashMap::new(),
            time_index: DashMap::new(),
            write_guard: Mutex::new(()),
            config,
        }
    }

    pub fn from_config(value: &serde_json::Value) -> Result<Self> {
        let config: AuditSinkConfig = serde_json::from_value(value.clone())?;
        Ok(Self::new(config))
    }

    fn hour_bucket(timestamp: DateTime<Utc>) -> i64 {
        timestamp.timestamp().div_euclid(3600)
    }

    fn sanitize(&self, event: &mut AuditEvent) {
        if self.config.include_sensitive_data {
            return;
        }
        for (key, value) in event.metadata.iter_mut() {
            if is_sensitive_key(key) {
                *value = serde_json::json!("[REDACTED]");
            } else if let Some(text) = value.as_str() {
                if text.chars().count() > TRUNCATE_METADATA_AT {
                    let truncated: String = text.chars().take(TRUNCATE_METADATA_AT).collect();
                    *value = serde_json::json!(format!("{}…", truncated));
                }
            }
        }
    }

    /// Evict the oldest events beyond the cap. Caller holds the write
    /// guard.
    fn enforce_cap(&self) {
        let excess = self.events.len().saturating_sub(self.config.max_events);
        if excess == 0 {
            return;
        }
        let mut all: Vec<(DateTime<Utc>, String)> = self
            .events
            .iter()
            .map(|entry| (entry.timestamp, entry.key().clone()))
            .collect();
        all.sort_by_key(|(timestamp, _)| *timestamp);
        for (_, id) in all.into_iter().take(excess) {
            self.drop_event(&id);
        }
        warn!(evicted = excess, "Audit event cap reached; oldest events evicted");
    }

    fn drop_event(&self, event_id: &str) -> bool {
        let Some((_, event)) = self.events.remove(event_id) else {
            return false;
        };
        if let Some(user_id) = &event.user_id {
            if let Some(mut ids) = self.user_index.get_mut(user_id) {
                ids.retain(|id| id != event_id);
            }
        }
        if let Some(mut ids) = self.kind_index.get_mut(event.kind.as_str()) {
            ids.retain(|id| id != event_id);
        }
        if let Some(mut ids) = self.time_index.get_mut(&Self::hour_bucket(event.timestamp)) {
            ids.retain(|id| id != event_id);
        }
        true
    }

    /// Candidate event ids for a query, using the most selective index
    /// available; `None` means a full scan is required.
    fn candidate_ids(&self, query: &AuditQuery) -> Option<Vec<String>> {
        if let Some(user_id) = &query.user_id {
            return self.user_index.get(user_id).map(|ids| ids.clone());
        }
        if let Some(kinds) = &query.kinds {
            if kinds.len() == 1 {
                return self.kind_index.get(kinds[0].as_str()).map(|ids| ids.clone());
            }
        }
        if query.start_time.is_some() || query.end_time.is_some() {
            let start = Self::hour_bucket(query.start_time.unwrap_or(DateTime::UNIX_EPOCH));
            let end = Self::hour_bucket(query.end_time.unwrap_or_else(Utc::now));
            if end.saturating_sub(start) <= 24 * 366 {
                let mut ids = Vec::new();
                for bucket in start..=end {
                    if let Some(bucket_ids) = self.time_index.get(&bucket) {
                        ids.extend(bucket_ids.iter().cloned());
                    }
                }
                return Some(ids);
            }
        }
        None
    }

    fn matches(event: &AuditEvent, query: &AuditQuery) -> bool {
        if let Some(kinds) = &query.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(user_id) = &query.user_id {
            if event.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(session_id) = &query.session_id {
            if event.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        if let Some(resource) = &query.resource {
            if event.resource.as_deref() != Some(resource.as_str()) {
                return false;
            }
        }
        if let Some(start) = query.start_time {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = query.end_time {
            if event.timestamp > end {
                return false;
            }
        }
        true
    }

    /// Provider counters for diagnostics.
    pub fn statistics(&self) -> HashMap<String, serde_json::Value> {
        let mut by_category: HashMap<&'static str, usize> = HashMap::new();
        for entry in self.events.iter() {
            *by_category.entry(entry.kind.category()).or_default() += 1;
        }
        let mut stats = HashMap::new();
        stats.insert("total_events".to_string(), serde_json::json!(self.events.len()));
        stats.insert(
            "retention_days".to_string(),
            serde_json::json!(self.config.retention_days),
        );
        stats.insert("by_category".to_string(), serde_json::json!(by_category));
        stats
    }

    /// Background retention sweep at the configured cadence.
    pub fn spawn_retention(self: &Arc<Self>) -> JoinHandle<()> {
        let sink = Arc::clone(self);
        let period = std::time::Duration::from_secs(sink.config.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - Duration::days(sink.config.retention_days);
                match sink.purge_older_than(cutoff).await {
                    Ok(0) => {}
                    Ok(purged) => info!(purged_events = purged, "Audit retention sweep completed"),
                    Err(e) => warn!(error = %e, "Audit retention sweep failed"),
                }
            }
        })
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn store(&self, mut event: AuditEvent) -> Result<()> {
        self.sanitize(&mut event);
        if event.severity.is_empty() {
            let result = event.result.map(|r| r.to_string());
            event.severity = infer_severity(event.kind, result.as_deref()).to_string();
        }

        let _guard = self.write_guard.lock().expect("audit write guard poisoned");
        if let Some(user_id) = &event.user_id {
            self.user_index
                .entry(user_id.clone())
                .or_default()
                .push(event.id.clone());
        }
        self.kind_index
            .entry(event.kind.as_str().to_string())
            .or_default()
            .push(event.id.clone());
        self.time_index
            .entry(Self::hour_bucket(event.timestamp))
            .or_default()
            .push(event.id.clone());
        self.events.insert(event.id.clone(), event);

        self.enforce_cap();
        Ok(())
    }

    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEvent>> {
        let mut matched: Vec<AuditEvent> = match self.candidate_ids(&query) {
            Some(ids) => ids
                .iter()
                // Dangling index entries self-heal by being skipped
                .filter_map(|id| self.events.get(id).map(|event| event.clone()))
                .filter(|event| Self::matches(event, &query))
                .collect(),
            None => self
                .events
                .iter()
                .filter(|event| Self::matches(event, &query))
                .map(|event| event.clone())
                .collect(),
        };

        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let _guard = self.write_guard.lock().expect("audit write guard poisoned");
        let stale: Vec<String> = self
            .events
            .iter()
            .filter(|event| event.timestamp < cutoff)
            .map(|event| event.key().clone())
            .collect();
        let mut purged = 0;
        for id in stale {
            if self.drop_event(&id) {
                purged += 1;
            }
        }

        // Drop index entries whose buckets emptied out
        self.user_index.retain(|_, ids| !ids.is_empty());
        self.kind_index.retain(|_, ids| !ids.is_empty());
        self.time_index.retain(|_, ids| !ids.is_empty());
        Ok(purged)
    }

    async fn export(&self, format: ExportFormat) -> Result<String> {
        let ExportFormat::Json = format;
        let events = self
            .query(AuditQuery::new().limit(self.config.max_events.max(1)))
            .await?;

        let records: Vec<serde_json::Value> = events
            .iter()
            .map(|event| {
                serde_json::json!({
                    "event_id": event.id,
                    "event_type": event.kind.as_str(),
                    "timestamp": event.timestamp.to_rfc3339(),
                    "user_id": event.user_id,
                    "session_id": event.session_id,
                    "resource": event.resource,
                    "action": event.action,
                    "result": event.result,
                    "metadata": event.metadata,
                    "ip_address": event.ip_address,
                    "user_agent": event.user_agent,
                })
            })
            .collect();
        Ok(serde_json::to_string_pretty(&records)?)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.events.len() as u64)
    }
}
