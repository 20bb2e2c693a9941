use crate::store::TtlMap;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Argon2, Params, Version,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;
use warden_core::enforcement::enforce;
use warden_core::error::{Error, Result};
use warden_core::events::EventKind;
use warden_core::journal::{AuditJournal, EventContext};
use warden_core::providers::credential::{
    CredentialMaterial, CredentialStore, PresentedCredential, CONTRACT,
};
use warden_core::types::{Credential, CredentialKind, CredentialMetadata};
use warden_core::util::{generate_secure_id, secure_compare, with_minimum_duration};

/// Configuration for the in-memory credential store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialStoreConfig {
    /// Argon2 iterations
    pub argon2_time_cost: u32,
    /// Argon2 memory usage in KiB
    pub argon2_memory_cost: u32,
    /// Argon2 lanes
    pub argon2_parallelism: u32,
    /// Hash length in bytes
    pub argon2_hash_len: usize,
    pub min_password_length: usize,
    /// Require lowercase, uppercase, digit and symbol
    pub require_complexity: bool,
    pub max_failed_attempts: u32,
    pub lockout_duration_secs: i64,
    /// Opaque token entropy in bytes
    pub token_length: usize,
    pub default_token_ttl_secs: i64,
    /// Minimum wall-clock time for verification, hiding internal branching
    pub min_verify_time_ms: u64,
}

impl Default for CredentialStoreConfig {
    fn default() -> Self {
        Self {
            argon2_time_cost: 3,
            argon2_memory_cost: 65536,
            argon2_parallelism: 1,
            argon2_hash_len: 32,
            min_password_length: 8,
            require_complexity: false,
            max_failed_attempts: 5,
            lockout_duration_secs: 900,
            token_length: 32,
            default_token_ttl_secs: 3600,
            min_verify_time_ms: 250,
        }
    }
}

/// In-memory credential store with Argon2id password hashing, a
/// per-account lockout state machine and opaque token credentials.
pub struct MemoryCredentialStore {
    argon2: Argon2<'static>,
    /// Password credentials keyed by user id
    passwords: DashMap<String, Credential>,
    /// Opaque token and API key credentials keyed by the token value
    tokens: TtlMap<Credential>,
    config: CredentialStoreConfig,
}

impl MemoryCredentialStore {
    pub fn new(config: CredentialStoreConfig) -> Result<Self> {
        let params = Params::new(
            config.argon2_memory_cost,
            config.argon2_time_cost,
            config.argon2_parallelism,
            Some(config.argon2_hash_len),
        )
        .map_err(|e| Error::provider_init(format!("Invalid Argon2 parameters: {}", e)))?;

        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

        Ok(Self {
            argon2,
            passwords: DashMap::new(),
            tokens: TtlMap::new(),
            config,
        })
    }

    pub fn from_config(value: &serde_json::Value) -> Result<Self> {
        let config: CredentialStoreConfig = serde_json::from_value(value.clone())?;
        Self::new(config)
    }

    fn enforce_password_policy(&self, password: &str) -> Result<()> {
        if password.chars().count() < self.config.min_password_length {
            return Err(Error::validation(format!(
                "Password must be at least {} characters",
                self.config.min_password_length
            )));
        }
        if self.config.require_complexity {
            let has_lower = password.chars().any(|c| c.is_lowercase());
            let has_upper = password.chars().any(|c| c.is_uppercase());
            let has_digit = password.chars().any(|c| c.is_ascii_digit());
            let has_symbol = password.chars().any(|c| !c.is_alphanumeric());
            if !(has_lower && has_upper && has_digit && has_symbol) {
                return Err(Error::validation(
                    "Password must contain lowercase, uppercase, digit and symbol characters",
                ));
            }
        }
        Ok(())
    }

    fn hash_password(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::internal(format!("Failed to hash password: {}", e)))?;
        Ok(hash.to_string())
    }

    fn verify_hash(&self, password: &str, stored_hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(stored_hash)
            .map_err(|e| Error::internal(format!("Invalid stored hash format: {}", e)))?;
        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::internal(format!("Password verification error: {}", e))),
        }
    }

    /// Verify a password and drive the lockout state machine. Returns the
    /// outcome label recorded in the audit event.
    fn verify_password_locked(&self, user_id: &str, password: &str) -> Result<(bool, &'static str)> {
        let Some(mut entry) = self.passwords.get_mut(user_id) else {
            return Ok((false, "unknown"));
        };
        let credential = entry.value_mut();

        if !credential.is_active {
            return Ok((false, "inactive"));
        }
        // A locked account short-circuits without touching the counter. A
        // lapsed lock implicitly unlocks and restarts the counter.
        if let Some(locked_until) = credential.metadata.locked_until {
            if Utc::now() < locked_until {
                return Ok((false, "locked"));
            }
            credential.metadata.locked_until = None;
            credential.metadata.failed_attempts = 0;
        }

        if self.verify_hash(password, &credential.data)? {
            credential.metadata.failed_attempts = 0;
            credential.metadata.locked_until = None;
            credential.metadata.last_used = Some(Utc::now());
            Ok((true, "success"))
        } else {
            credential.metadata.failed_attempts += 1;
            if credential.metadata.failed_attempts >= self.config.max_failed_attempts {
                credential.metadata.locked_until =
                    Some(Utc::now() + Duration::seconds(self.config.lockout_duration_secs));
                warn!(
                    user_id = %user_id,
                    failed_attempts = credential.metadata.failed_attempts,
                    "Account locked after repeated verification failures"
                );
            }
            Ok((false, "failure"))
        }
    }

    fn verify_token(&self, token: &str, expected_purpose: Option<&str>) -> (bool, &'static str) {
        let Some(credential) = self.tokens.get(token) else {
            return (false, "unknown");
        };
        if !credential.is_active {
            return (false, "inactive");
        }
        if credential.is_expired() {
            self.tokens.remove(token);
            return (false, "expired");
        }
        if !secure_compare(&credential.data, token) {
            return (false, "failure");
        }
        if let Some(expected) = expected_purpose {
            if credential.metadata.purpose.as_deref() != Some(expected) {
                return (false, "purpose_mismatch");
            }
        }
        self.tokens
            .update(token, |c| c.metadata.last_used = Some(Utc::now()));
        (true, "success")
    }

    fn mint_token_credential(
        &self,
        user_id: &str,
        kind: CredentialKind,
        purpose: Option<String>,
        ttl: Option<Duration>,
    ) -> Credential {
        let token = generate_secure_id(self.config.token_length);
        let ttl = ttl.unwrap_or_else(|| Duration::seconds(self.config.default_token_ttl_secs));
        let now = Utc::now();
        let credential = Credential {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            data: token.clone(),
            metadata: CredentialMetadata {
                created_at: Some(now),
                expires_at: Some(now + ttl),
                purpose,
                ..Default::default()
            },
            is_active: true,
        };
        self.tokens.insert(token, credential.clone(), Some(ttl));
        credential
    }

    /// Whether the user's password credential is currently locked out.
    pub fn is_locked(&self, user_id: &str) -> bool {
        self.passwords
            .get(user_id)
            .map(|credential| credential.is_locked())
            .unwrap_or(false)
    }

    /// Deactivate a credential without deleting it. An inactive credential
    /// can never verify.
    pub fn deactivate(&self, user_id: &str, kind: CredentialKind) -> bool {
        match kind {
            CredentialKind::Password => self
                .passwords
                .get_mut(user_id)
                .map(|mut c| {
                    c.is_active = false;
                    true
                })
                .unwrap_or(false),
            CredentialKind::Token | CredentialKind::ApiKey => {
                let mut changed = false;
                for (token, credential) in self.tokens.entries() {
                    if credential.user_id == user_id && credential.kind == kind {
                        changed |= self.tokens.update(&token, |c| c.is_active = false);
                    }
                }
                changed
            }
        }
    }

    /// Revoke one opaque token by value.
    pub fn revoke_token(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    /// Provider counters for diagnostics.
    pub fn statistics(&self) -> HashMap<String, serde_json::Value> {
        let mut stats = HashMap::new();
        stats.insert(
            "password_credentials".to_string(),
            serde_json::json!(self.passwords.len()),
        );
        stats.insert(
            "token_credentials".to_string(),
            serde_json::json!(self.tokens.len()),
        );
        stats.insert(
            "argon2".to_string(),
            serde_json::json!({
                "time_cost": self.config.argon2_time_cost,
                "memory_cost": self.config.argon2_memory_cost,
                "parallelism": self.config.argon2_parallelism,
            }),
        );
        stats
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn create_credentials(
        &self,
        user_id: &str,
        material: CredentialMaterial,
        journal: &AuditJournal,
    ) -> Result<Credential> {
        enforce::<Self, _, _>(&CONTRACT, "create_credentials", journal, async {
            let kind = material.kind();
            let credential = match material {
                CredentialMaterial::Password { password } => {
                    self.enforce_password_policy(&password)?;
                    if self.passwords.contains_key(user_id) {
                        return Err(Error::conflict(format!(
                            "User '{}' already has password credentials",
                            user_id
                        )));
                    }
                    let credential = Credential {
                        id: Uuid::new_v4().to_string(),
                        user_id: user_id.to_string(),
                        kind: CredentialKind::Password,
                        data: self.hash_password(&password)?,
                        metadata: CredentialMetadata {
                            created_at: Some(Utc::now()),
                            ..Default::default()
                        },
                        is_active: true,
                    };
                    self.passwords
                        .insert(user_id.to_string(), credential.clone());
                    credential
                }
                CredentialMaterial::Token { purpose, ttl } => {
                    self.mint_token_credential(user_id, CredentialKind::Token, Some(purpose), ttl)
                }
                CredentialMaterial::ApiKey { label, ttl } => {
                    self.mint_token_credential(user_id, CredentialKind::ApiKey, Some(label), ttl)
                }
            };

            journal
                .record(
                    EventKind::CredentialCreate,
                    EventContext::new()
                        .user(user_id)
                        .meta("kind", serde_json::json!(kind.to_string())),
                )
                .await?;
            debug!(user_id = %user_id, kind = %kind, "Credentials created");
            Ok(credential)
        })
        .await
    }

    async fn verify_credentials(
        &self,
        user_id: &str,
        presented: PresentedCredential,
        journal: &AuditJournal,
    ) -> Result<bool> {
        let budget = std::time::Duration::from_millis(self.config.min_verify_time_ms);
        enforce::<Self, _, _>(&CONTRACT, "verify_credentials", journal, async {
            with_minimum_duration(budget, async {
                let (verified, outcome) = match &presented {
                    PresentedCredential::Password { password } => {
                        self.verify_password_locked(user_id, password)?
                    }
                    PresentedCredential::Token { token, purpose } => {
                        self.verify_token(token, Some(purpose))
                    }
                    PresentedCredential::ApiKey { key } => self.verify_token(key, None),
                };

                journal
                    .record(
                        EventKind::CredentialVerify,
                        EventContext::new()
                            .user(user_id)
                            .meta("outcome", serde_json::json!(outcome)),
                    )
                    .await?;
                Ok(verified)
            })
            .await
        })
        .await
    }

    async fn update_credentials(
        &self,
        user_id: &str,
        material: CredentialMaterial,
        journal: &AuditJournal,
    ) -> Result<Credential> {
        enforce::<Self, _, _>(&CONTRACT, "update_credentials", journal, async {
            let CredentialMaterial::Password { password } = material else {
                return Err(Error::validation(
                    "Only password credentials can be updated in place; recreate token credentials instead",
                ));
            };
            self.enforce_password_policy(&password)?;

            let new_hash = self.hash_password(&password)?;
            let updated = {
                let Some(mut entry) = self.passwords.get_mut(user_id) else {
                    return Err(Error::not_found(format!(
                        "No password credentials for user '{}'",
                        user_id
                    )));
                };
                let credential = entry.value_mut();
                credential.data = new_hash;
                // Replacing the password clears the lockout state.
                credential.metadata.failed_attempts = 0;
                credential.metadata.locked_until = None;
                credential.metadata.last_updated = Some(Utc::now());
                credential.clone()
            };

            journal
                .record(
                    EventKind::CredentialUpdate,
                    EventContext::new().user(user_id),
                )
                .await?;
            Ok(updated)
        })
        .await
    }

    async fn delete_credentials(
        &self,
        user_id: &str,
        kind: CredentialKind,
        journal: &AuditJournal,
    ) -> Result<bool> {
        enforce::<Self, _, _>(&CONTRACT, "delete_credentials", journal, async {
            let removed = match kind {
                CredentialKind::Password => self.passwords.remove(user_id).is_some(),
                CredentialKind::Token | CredentialKind::ApiKey => {
                    let mut removed = 0;
                    for (token, credential) in self.tokens.entries() {
                        if credential.user_id == user_id && credential.kind == kind {
                            if self.tokens.remove(&token).is_some() {
                                removed += 1;
                            }
                        }
                    }
                    removed > 0
                }
            };

            journal
                .record(
                    EventKind::CredentialDelete,
                    EventContext::new()
                        .user(user_id)
                        .meta("kind", serde_json::json!(kind.to_string())),
                )
                .await?;
            Ok(removed)
        })
        .await
    }

    async fn credential_kinds(&self, user_id: &str) -> Result<BTreeSet<CredentialKind>> {
        let mut kinds = BTreeSet::new();
        if self.passwords.contains_key(user_id) {
            kinds.insert(CredentialKind::Password);
        }
        for (_, credential) in self.tokens.entries() {
            if credential.user_id == user_id {
                kinds.insert(credential.kind);
            }
        }
        Ok(kinds)
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        Ok(self.tokens.sweep_expired())
    }
}
