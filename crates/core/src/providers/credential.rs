use crate::enforcement::ContractMap;
use crate::error::Result;
use crate::events::EventKind;
use crate::journal::AuditJournal;
use crate::pipeline::Pipeline;
use crate::types::{Credential, CredentialKind};
use async_trait::async_trait;
use chrono::Duration;
use once_cell::sync::Lazy;
use std::collections::BTreeSet;

/// Material supplied when creating or replacing a credential.
#[derive(Debug, Clone)]
pub enum CredentialMaterial {
    Password { password: String },
    Token { purpose: String, ttl: Option<Duration> },
    ApiKey { label: String, ttl: Option<Duration> },
}

impl CredentialMaterial {
    pub fn kind(&self) -> CredentialKind {
        match self {
            CredentialMaterial::Password { .. } => CredentialKind::Password,
            CredentialMaterial::Token { .. } => CredentialKind::Token,
            CredentialMaterial::ApiKey { .. } => CredentialKind::ApiKey,
        }
    }
}

/// Material presented for verification.
#[derive(Debug, Clone)]
pub enum PresentedCredential {
    Password { password: String },
    Token { token: String, purpose: String },
    ApiKey { key: String },
}

/// Pipelines each audited operation must satisfy.
pub static CONTRACT: Lazy<ContractMap> = Lazy::new(|| {
    let mut table = ContractMap::new();
    table.insert(
        "create_credentials",
        Pipeline::event(EventKind::CredentialCreate),
    );
    table.insert(
        "verify_credentials",
        Pipeline::event(EventKind::CredentialVerify),
    );
    table.insert(
        "update_credentials",
        Pipeline::event(EventKind::CredentialUpdate),
    );
    table.insert(
        "delete_credentials",
        Pipeline::event(EventKind::CredentialDelete),
    );
    table
});

/// Storage and verification of user credentials.
///
/// Implementations must never surface stored secrets: password material
/// exists only as an Argon2 hash, verification failures are ordinary
/// `Ok(false)` results, and an inactive credential can never verify.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Create credentials for a user.
    ///
    /// Must record `credential.create`.
    async fn create_credentials(
        &self,
        user_id: &str,
        material: CredentialMaterial,
        journal: &AuditJournal,
    ) -> Result<Credential>;

    /// Verify presented material against stored credentials.
    ///
    /// Returns `Ok(false)` for a mismatch, a missing credential or a locked
    /// account; only operational faults are errors. Must record
    /// `credential.verify`.
    async fn verify_credentials(
        &self,
        user_id: &str,
        presented: PresentedCredential,
        journal: &AuditJournal,
    ) -> Result<bool>;

    /// Replace stored credentials, resetting any lockout state.
    ///
    /// Must record `credential.update`.
    async fn update_credentials(
        &self,
        user_id: &str,
        material: CredentialMaterial,
        journal: &AuditJournal,
    ) -> Result<Credential>;

    /// Delete credentials of the given kind. Returns whether anything was
    /// removed.
    ///
    /// Must record `credential.delete`.
    async fn delete_credentials(
        &self,
        user_id: &str,
        kind: CredentialKind,
        journal: &AuditJournal,
    ) -> Result<bool>;

    /// Credential kinds currently stored for a user.
    async fn credential_kinds(&self, user_id: &str) -> Result<BTreeSet<CredentialKind>>;

    /// Whether the presented credential is known to be compromised.
    ///
    /// The default implementation reports `false`. Implementations backed
    /// by a breach checker must never transmit plaintext material across a
    /// boundary.
    async fn is_credential_compromised(&self, _presented: &PresentedCredential) -> Result<bool> {
        Ok(false)
    }

    /// Remove expired credentials. Returns the removal count.
    async fn cleanup_expired(&self) -> Result<u64>;
}
