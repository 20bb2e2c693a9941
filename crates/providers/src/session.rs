use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_core::enforcement::enforce;
use warden_core::error::Result;
use warden_core::events::EventKind;
use warden_core::journal::{AuditJournal, EventContext};
use warden_core::providers::session::{ClientInfo, SessionStore, CONTRACT};
use warden_core::types::{Session, SessionMetadata};
use warden_core::util::{generate_secure_id, with_minimum_duration};

/// Configuration for the in-memory session store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionStoreConfig {
    pub default_session_ttl_secs: i64,
    pub max_session_ttl_secs: i64,
    pub max_concurrent_sessions: usize,
    /// Refreshes closer together than this leave the session unchanged
    pub session_refresh_threshold_secs: i64,
    pub require_ip_validation: bool,
    pub require_user_agent_validation: bool,
    /// Extend expiry on every successful validation
    pub extend_on_access: bool,
    /// Minimum wall-clock time for validation, hiding internal branching
    pub min_validation_time_ms: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            default_session_ttl_secs: 86_400,
            max_session_ttl_secs: 604_800,
            max_concurrent_sessions: 10,
            session_refresh_threshold_secs: 3600,
            require_ip_validation: false,
            require_user_agent_validation: false,
            extend_on_access: false,
            min_validation_time_ms: 500,
            cleanup_interval_secs: 300,
        }
    }
}

/// In-memory session store with device-fingerprint binding, concurrent
/// session limits and timing-protected validation.
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
    user_sessions: DashMap<String, BTreeSet<String>>,
    /// Serializes mutation per user so limit enforcement and creation are
    /// atomic; operations on distinct users proceed in parallel.
    user_locks: DashMap<String, Arc<Mutex<()>>>,
    config: SessionStoreConfig,
}

impl MemorySessionStore {
    pub fn new(config: SessionStoreConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            user_sessions: DashMap::new(),
            user_locks: DashMap::new(),
            config,
        }
    }

    pub fn from_config(value: &serde_json::Value) -> Result<Self> {
        let config: SessionStoreConfig = serde_json::from_value(value.clone())?;
        Ok(Self::new(config))
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn clamp_ttl(&self, requested: Option<Duration>) -> Duration {
        let requested =
            requested.unwrap_or_else(|| Duration::seconds(self.config.default_session_ttl_secs));
        let max = Duration::seconds(self.config.max_session_ttl_secs);
        if requested > max {
            max
        } else {
            requested
        }
    }

    fn remove_session(&self, session_id: &str) -> Option<Session> {
        let (_, session) = self.sessions.remove(session_id)?;
        if let Some(mut ids) = self.user_sessions.get_mut(&session.user_id) {
            ids.remove(session_id);
            let empty = ids.is_empty();
            drop(ids);
            if empty {
                self.user_sessions.remove(&session.user_id);
            }
        }
        Some(session)
    }

    /// Destroy the oldest sessions of a user until one slot is free.
    /// Caller holds the user lock.
    fn evict_for_limit(&self, user_id: &str) {
        let ids: Vec<String> = self
            .user_sessions
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let mut live: Vec<(DateTime<Utc>, String)> = ids
            .iter()
            .filter_map(|id| {
                self.sessions
                    .get(id)
                    .map(|session| (session.created_at, id.clone()))
            })
            .collect();

        if live.len() < self.config.max_concurrent_sessions {
            return;
        }

        live.sort_by_key(|(created_at, _)| *created_at);
        let excess = live.len() + 1 - self.config.max_concurrent_sessions;
        for (_, id) in live.into_iter().take(excess) {
            warn!(user_id = %user_id, session_id = %id, "Evicting oldest session at concurrency limit");
            self.remove_session(&id);
        }
    }

    /// Provider counters for diagnostics.
    pub fn statistics(&self) -> HashMap<String, serde_json::Value> {
        let mut stats = HashMap::new();
        stats.insert(
            "total_sessions".to_string(),
            serde_json::json!(self.sessions.len()),
        );
        stats.insert(
            "users_with_sessions".to_string(),
            serde_json::json!(self.user_sessions.len()),
        );
        stats.insert(
            "max_concurrent_sessions".to_string(),
            serde_json::json!(self.config.max_concurrent_sessions),
        );
        stats
    }

    /// Background sweep of expired sessions at the configured cadence.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = std::time::Duration::from_secs(store.config.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match store.cleanup_expired_sessions().await {
                    Ok(0) => {}
                    Ok(removed) => {
                        info!(removed_sessions = removed, "Session cleanup cycle completed")
                    }
                    Err(e) => warn!(error = %e, "Session cleanup cycle failed"),
                }
            }
        })
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(
        &self,
        user_id: &str,
        fingerprint: &str,
        client: ClientInfo,
        duration: Option<Duration>,
        journal: &AuditJournal,
    ) -> Result<Session> {
        enforce::<Self, _, _>(&CONTRACT, "create_session", journal, async {
            let lock = self.user_lock(user_id);
            let _guard = lock.lock().await;

            self.evict_for_limit(user_id);

            let ttl = self.clamp_ttl(duration);
            let now = Utc::now();
            let session = Session {
                // 256 bits of entropy, well past the 128-bit floor
                id: generate_secure_id(32),
                user_id: user_id.to_string(),
                created_at: now,
                expires_at: now + ttl,
                last_accessed: now,
                device_fingerprint: fingerprint.to_string(),
                metadata: SessionMetadata {
                    ip_address: client.ip_address,
                    user_agent: client.user_agent,
                    access_count: 1,
                    last_refresh: Some(now),
                    extra: HashMap::new(),
                },
            };

            self.sessions.insert(session.id.clone(), session.clone());
            self.user_sessions
                .entry(user_id.to_string())
                .or_default()
                .insert(session.id.clone());

            journal
                .record(
                    EventKind::SessionCreate,
                    EventContext::new().user(user_id).session(&session.id),
                )
                .await?;
            debug!(user_id = %user_id, session_id = %session.id, "Session created");
            Ok(session)
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return Ok(None);
        };
        if session.is_expired() {
            self.remove_session(session_id);
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn validate_session(
        &self,
        session_id: &str,
        fingerprint: &str,
        client: ClientInfo,
        journal: &AuditJournal,
    ) -> Result<Option<Session>> {
        let budget = std::time::Duration::from_millis(self.config.min_validation_time_ms);
        enforce::<Self, _, _>(&CONTRACT, "validate_session", journal, async {
            with_minimum_duration(budget, async {
                let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) else {
                    journal
                        .record(
                            EventKind::SessionInvalid,
                            EventContext::new()
                                .session(session_id)
                                .meta("reason", serde_json::json!("not_found")),
                        )
                        .await?;
                    return Ok(None);
                };

                if session.is_expired() {
                    self.remove_session(session_id);
                    journal
                        .record(
                            EventKind::SessionExpire,
                            EventContext::new()
                                .user(&session.user_id)
                                .session(session_id),
                        )
                        .await?;
                    return Ok(None);
                }

                // Exact fingerprint equality; a mismatch is treated as a
                // hijack attempt and destroys the session.
                if session.device_fingerprint != fingerprint {
                    self.remove_session(session_id);
                    journal
                        .record(
                            EventKind::SecurityViolation,
                            EventContext::new()
                                .user(&session.user_id)
                                .session(session_id)
                                .meta("reason", serde_json::json!("fingerprint_mismatch")),
                        )
                        .await?;
                    warn!(session_id = %session_id, "Session fingerprint mismatch; session destroyed");
                    return Ok(None);
                }

                if self.config.require_ip_validation {
                    if let (Some(stored), Some(supplied)) =
                        (&session.metadata.ip_address, &client.ip_address)
                    {
                        if stored != supplied {
                            self.remove_session(session_id);
                            journal
                                .record(
                                    EventKind::SecurityViolation,
                                    EventContext::new()
                                        .user(&session.user_id)
                                        .session(session_id)
                                        .meta("reason", serde_json::json!("ip_mismatch")),
                                )
                                .await?;
                            return Ok(None);
                        }
                    }
                }

                if self.config.require_user_agent_validation {
                    if let (Some(stored), Some(supplied)) =
                        (&session.metadata.user_agent, &client.user_agent)
                    {
                        if stored != supplied {
                            self.remove_session(session_id);
                            journal
                                .record(
                                    EventKind::SecurityViolation,
                                    EventContext::new()
                                        .user(&session.user_id)
                                        .session(session_id)
                                        .meta("reason", serde_json::json!("user_agent_mismatch")),
                                )
                                .await?;
                            return Ok(None);
                        }
                    }
                }

                let updated = {
                    let mut entry = match self.sessions.get_mut(session_id) {
                        Some(entry) => entry,
                        // Raced with destruction; report as gone
                        None => {
                            journal
                                .record(
                                    EventKind::SessionInvalid,
                                    EventContext::new()
                                        .session(session_id)
                                        .meta("reason", serde_json::json!("not_found")),
                                )
                                .await?;
                            return Ok(None);
                        }
                    };
                    let now = Utc::now();
                    entry.last_accessed = now;
                    entry.metadata.access_count += 1;
                    if self.config.extend_on_access {
                        entry.expires_at =
                            now + Duration::seconds(self.config.default_session_ttl_secs);
                    }
                    entry.clone()
                };

                journal
                    .record(
                        EventKind::SessionAccess,
                        EventContext::new()
                            .user(&updated.user_id)
                            .session(session_id),
                    )
                    .await?;
                Ok(Some(updated))
            })
            .await
        })
        .await
    }

    async fn refresh_session(
        &self,
        session_id: &str,
        journal: &AuditJournal,
    ) -> Result<Option<Session>> {
        enforce::<Self, _, _>(&CONTRACT, "refresh_session", journal, async {
            let Some(session) = self.get_session(session_id).await? else {
                journal
                    .record(
                        EventKind::SessionRefresh,
                        EventContext::new()
                            .session(session_id)
                            .meta("extended", serde_json::json!(false)),
                    )
                    .await?;
                return Ok(None);
            };

            let now = Utc::now();
            let last_refresh = session.metadata.last_refresh.unwrap_or(session.created_at);
            let threshold = Duration::seconds(self.config.session_refresh_threshold_secs);

            // Refreshing again inside the threshold is a no-op, which keeps
            // hot refresh loops from extending sessions indefinitely.
            if now - last_refresh < threshold {
                journal
                    .record(
                        EventKind::SessionRefresh,
                        EventContext::new()
                            .user(&session.user_id)
                            .session(session_id)
                            .meta("extended", serde_json::json!(false)),
                    )
                    .await?;
                return Ok(Some(session));
            }

            let updated = {
                let Some(mut entry) = self.sessions.get_mut(session_id) else {
                    return Ok(None);
                };
                entry.expires_at = now + Duration::seconds(self.config.default_session_ttl_secs);
                entry.metadata.last_refresh = Some(now);
                entry.clone()
            };

            journal
                .record(
                    EventKind::SessionRefresh,
                    EventContext::new()
                        .user(&updated.user_id)
                        .session(session_id)
                        .meta("extended", serde_json::json!(true)),
                )
                .await?;
            Ok(Some(updated))
        })
        .await
    }

    async fn destroy_session(&self, session_id: &str, journal: &AuditJournal) -> Result<bool> {
        enforce::<Self, _, _>(&CONTRACT, "destroy_session", journal, async {
            let removed = self.remove_session(session_id);
            journal
                .record(
                    EventKind::SessionDestroy,
                    EventContext::new()
                        .session(session_id)
                        .meta("found", serde_json::json!(removed.is_some())),
                )
                .await?;
            Ok(removed.is_some())
        })
        .await
    }

    async fn destroy_user_sessions(&self, user_id: &str) -> Result<u64> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let ids: Vec<String> = self
            .user_sessions
            .remove(user_id)
            .map(|(_, ids)| ids.into_iter().collect())
            .unwrap_or_default();
        let mut destroyed = 0;
        for id in ids {
            if self.sessions.remove(&id).is_some() {
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }

    async fn cleanup_expired_sessions(&self) -> Result<u64> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for id in expired {
            if self.remove_session(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn active_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let ids: Vec<String> = self
            .user_sessions
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let mut sessions = Vec::new();
        for id in ids {
            match self.sessions.get(&id).map(|s| s.clone()) {
                Some(session) if !session.is_expired() => sessions.push(session),
                Some(_) => {
                    self.remove_session(&id);
                }
                None => {}
            }
        }
        sessions.sort_by_key(|session| session.created_at);
        Ok(sessions)
    }
}
