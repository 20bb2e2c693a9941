use crate::error::{Error, ErrorCode, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Field-name markers that flag sensitive material. Any metadata or payload
/// key containing one of these (case-insensitive) is rejected at
/// construction or redacted before storage.
pub const SENSITIVE_FIELD_MARKERS: [&str; 7] = [
    "password",
    "secret",
    "key",
    "credential",
    "hash",
    "salt",
    "private",
];

/// Whether a metadata/payload key names sensitive material.
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_FIELD_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Reject maps that carry sensitive field names. The offending field name is
/// reported; its value never is.
pub fn reject_sensitive_keys(map: &HashMap<String, serde_json::Value>) -> Result<()> {
    for key in map.keys() {
        if is_sensitive_key(key) {
            return Err(Error::new(
                ErrorCode::SensitiveDataRejected,
                format!("Field '{}' must not carry sensitive material", key),
            ));
        }
    }
    Ok(())
}

/// Outcome of an authorization-relevant operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Abstain,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => write!(f, "allow"),
            Decision::Deny => write!(f, "deny"),
            Decision::Abstain => write!(f, "abstain"),
        }
    }
}

/// A user in the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Stable identifier
    pub id: String,
    /// Unique username; looked up case-insensitively
    pub username: String,
    pub email: Option<String>,
    pub is_active: bool,
    pub is_verified: bool,
    /// Names of roles assigned to this user
    pub roles: BTreeSet<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let username = username.into();
        if id.trim().is_empty() {
            return Err(Error::validation("User ID cannot be empty"));
        }
        if username.trim().is_empty() {
            return Err(Error::validation("Username cannot be empty"));
        }
        let now = Utc::now();
        Ok(Self {
            id,
            username,
            email: None,
            is_active: true,
            is_verified: false,
            roles: BTreeSet::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            last_login: None,
        })
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A named role carrying a set of permission strings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub description: String,
    /// Permission strings in `resource:action` form
    pub permissions: BTreeSet<String>,
    /// Names of roles whose permissions this role also grants
    pub inherits: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation("Role name cannot be empty"));
        }
        Ok(Self {
            name,
            description: String::new(),
            permissions: BTreeSet::new(),
            inherits: Vec::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = String>) -> Self {
        self.permissions = permissions.into_iter().collect();
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// A permission in `resource:action` form. The wildcard `*` is allowed in
/// either segment, or as `*:*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub name: String,
    pub description: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub conditions: HashMap<String, serde_json::Value>,
}

impl Permission {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation("Permission name cannot be empty"));
        }
        let (resource, action) = match name.split_once(':') {
            Some((r, a)) => (Some(r.to_string()), Some(a.to_string())),
            None => (None, None),
        };
        Ok(Self {
            name,
            description: None,
            resource,
            action,
            conditions: HashMap::new(),
        })
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Kinds of credentials supported by the framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Password,
    Token,
    ApiKey,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Password => write!(f, "password"),
            CredentialKind::Token => write!(f, "token"),
            CredentialKind::ApiKey => write!(f, "api_key"),
        }
    }
}

/// Lifecycle metadata tracked alongside each credential
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialMetadata {
    pub created_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Token purpose for opaque token credentials
    pub purpose: Option<String>,
}

/// A stored credential. The data blob's format depends on the kind: an
/// Argon2 encoded hash for passwords, random URL-safe token text otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub user_id: String,
    pub kind: CredentialKind,
    /// Opaque blob; never logged, never exported
    pub data: String,
    pub metadata: CredentialMetadata,
    pub is_active: bool,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        match self.metadata.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }

    pub fn is_locked(&self) -> bool {
        match self.metadata.locked_until {
            Some(locked_until) => Utc::now() < locked_until,
            None => false,
        }
    }
}

/// Request-context metadata attached to a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub access_count: u64,
    pub last_refresh: Option<DateTime<Utc>>,
    pub extra: HashMap<String, serde_json::Value>,
}

/// An opaque user session bound to a device fingerprint at creation.
///
/// The fingerprint is immutable for the session's lifetime; validation
/// requires exact equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Cryptographically random identifier (at least 128 bits of entropy)
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Opaque client-context string bound at creation
    pub device_fingerprint: String,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Token categories issued by the token service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    ApiKey,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
            TokenType::ApiKey => "api_key",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "access" => Ok(TokenType::Access),
            "refresh" => Ok(TokenType::Refresh),
            "api_key" => Ok(TokenType::ApiKey),
            other => Err(Error::validation(format!("Unknown token type: {}", other))),
        }
    }
}

/// A signed token issued by the token service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// The `jti` claim
    pub token_id: String,
    /// The encoded compact JWS string
    pub token_value: String,
    pub token_type: TokenType,
    pub user_id: Option<String>,
    /// Caller claims, excluding reserved ones
    pub payload: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Result of a rate limit check or consumption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    /// Seconds to wait before retrying; set only when denied
    pub retry_after: Option<u64>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One rule of an ordered policy list. Present filters must all match for
/// the rule to apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRule {
    /// "allow" or "deny"
    pub effect: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<HashMap<String, serde_json::Value>>,
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    /// Index of the matching rule, or "default"
    pub policy_id: String,
    pub applied_policies: Vec<PolicyRule>,
}

/// Subject context handed to the policy engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubjectContext {
    pub user_id: Option<String>,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    /// Arbitrary attributes matched by `custom` rule filters
    pub attributes: HashMap<String, serde_json::Value>,
}

impl SubjectContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }
}

/// A typed, timestamped, immutable record of a security-relevant action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique identifier for this event
    pub id: String,
    #[serde(rename = "event_type")]
    pub kind: crate::events::EventKind,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub result: Option<Decision>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Severity label assigned at storage time
    pub severity: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_sensitive_key_detection() {
        assert!(is_sensitive_key("password"));
        assert!(is_sensitive_key("Password"));
        assert!(is_sensitive_key("api_key"));
        assert!(is_sensitive_key("password_hash"));
        assert!(is_sensitive_key("PRIVATE_note"));
        assert!(is_sensitive_key("client_secret"));
        assert!(!is_sensitive_key("username"));
        assert!(!is_sensitive_key("ip_address"));
    }

    #[test]
    fn test_reject_sensitive_keys() {
        let mut map = HashMap::new();
        map.insert("theme".to_string(), serde_json::json!("dark"));
        assert!(reject_sensitive_keys(&map).is_ok());

        map.insert("session_key".to_string(), serde_json::json!("abc"));
        let err = reject_sensitive_keys(&map).unwrap_err();
        assert_eq!(err.code, ErrorCode::SensitiveDataRejected);
        // The field name is reported, never its value
        assert!(err.message.contains("session_key"));
        assert!(!err.message.contains("abc"));
    }

    #[test]
    fn test_user_validation() {
        assert!(User::new("", "alice").is_err());
        assert!(User::new("u1", "  ").is_err());
        let user = User::new("u1", "alice").unwrap().with_email("alice@x");
        assert_eq!(user.email.as_deref(), Some("alice@x"));
        assert!(user.is_active);
        assert!(!user.is_verified);
    }

    #[test]
    fn test_permission_splits_resource_action() {
        let perm = Permission::new("user:read").unwrap();
        assert_eq!(perm.resource.as_deref(), Some("user"));
        assert_eq!(perm.action.as_deref(), Some("read"));
        assert_eq!(perm.to_string(), "user:read");
    }

    #[test]
    fn test_credential_lock_and_expiry() {
        let mut credential = Credential {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            kind: CredentialKind::Password,
            data: "$argon2id$...".to_string(),
            metadata: CredentialMetadata::default(),
            is_active: true,
        };
        assert!(!credential.is_locked());
        assert!(!credential.is_expired());

        credential.metadata.locked_until = Some(Utc::now() + Duration::minutes(15));
        assert!(credential.is_locked());

        credential.metadata.locked_until = Some(Utc::now() - Duration::minutes(1));
        assert!(!credential.is_locked());

        credential.metadata.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(credential.is_expired());
    }

    #[test]
    fn test_session_expiry_boundary() {
        let now = Utc::now();
        let session = Session {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            created_at: now,
            expires_at: now - Duration::seconds(1),
            last_accessed: now,
            device_fingerprint: "fp".to_string(),
            metadata: SessionMetadata::default(),
        };
        assert!(session.is_expired());
    }

    #[test]
    fn test_token_type_round_trip() {
        for token_type in [TokenType::Access, TokenType::Refresh, TokenType::ApiKey] {
            let parsed: TokenType = token_type.as_str().parse().unwrap();
            assert_eq!(parsed, token_type);
        }
        assert!("bearer".parse::<TokenType>().is_err());
    }
}
