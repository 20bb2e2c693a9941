use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Standardized error codes for the authentication framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication
    AuthenticationFailed,
    InvalidCredentials,
    SessionExpired,
    AccountLocked,

    // Authorization
    AuthorizationFailed,
    PermissionDenied,

    // Tokens
    TokenInvalid,
    TokenExpired,

    // Audit integrity
    AuditRequirement,

    // Validation
    ValidationFailed,
    SensitiveDataRejected,

    // Configuration
    ConfigurationError,

    // Providers
    ProviderNotFound,
    ProviderInitFailed,
    ProviderError,

    // Rate limiting
    RateLimitExceeded,

    // Resources
    ResourceNotFound,
    ResourceAlreadyExists,

    // Internal
    SerializationError,
    InternalError,
}

impl ErrorCode {
    /// Error category for classification and log routing
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationFailed
            | ErrorCode::InvalidCredentials
            | ErrorCode::SessionExpired
            | ErrorCode::AccountLocked => "authentication",

            ErrorCode::AuthorizationFailed | ErrorCode::PermissionDenied => "authorization",

            ErrorCode::TokenInvalid | ErrorCode::TokenExpired => "token",

            ErrorCode::AuditRequirement => "audit",

            ErrorCode::ValidationFailed | ErrorCode::SensitiveDataRejected => "validation",

            ErrorCode::ConfigurationError => "configuration",

            ErrorCode::ProviderNotFound
            | ErrorCode::ProviderInitFailed
            | ErrorCode::ProviderError => "provider",

            ErrorCode::RateLimitExceeded => "rate_limit",

            ErrorCode::ResourceNotFound | ErrorCode::ResourceAlreadyExists => "resource",

            ErrorCode::SerializationError | ErrorCode::InternalError => "system",
        }
    }

    /// Whether this code should be logged at error level
    pub fn should_log_as_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::AuditRequirement
                | ErrorCode::ConfigurationError
                | ErrorCode::ProviderInitFailed
                | ErrorCode::InternalError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Main error type for the authentication framework.
///
/// Carries a standardized code, a human-readable message and an optional
/// details map. Neither the message nor the details may contain sensitive
/// material; callers surface a generic failure to external actors and the
/// specific code to logs and the audit trail.
#[derive(Debug, ThisError, Clone, Serialize)]
pub struct Error {
    /// Standardized error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Structured details for diagnostics (never sensitive values)
    pub details: HashMap<String, serde_json::Value>,
    /// Error severity
    pub severity: ErrorSeverity,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: HashMap::new(),
            severity: Self::default_severity_for_code(code),
        }
    }

    /// Attach a detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn category(&self) -> &'static str {
        self.code.category()
    }

    /// Generic message safe to surface to external actors
    pub fn external_message(&self) -> &'static str {
        match self.code.category() {
            "authentication" | "token" => "Authentication failed",
            "authorization" => "Access denied",
            "validation" => "Input validation failed",
            "rate_limit" => "Rate limit exceeded, please try again later",
            _ => "An internal error occurred",
        }
    }

    fn default_severity_for_code(code: ErrorCode) -> ErrorSeverity {
        match code {
            ErrorCode::ValidationFailed
            | ErrorCode::ResourceNotFound
            | ErrorCode::SessionExpired => ErrorSeverity::Low,

            ErrorCode::AuthenticationFailed
            | ErrorCode::InvalidCredentials
            | ErrorCode::AccountLocked
            | ErrorCode::PermissionDenied
            | ErrorCode::TokenInvalid
            | ErrorCode::TokenExpired
            | ErrorCode::RateLimitExceeded
            | ErrorCode::ResourceAlreadyExists
            | ErrorCode::SensitiveDataRejected => ErrorSeverity::Medium,

            ErrorCode::AuthorizationFailed
            | ErrorCode::AuditRequirement
            | ErrorCode::ProviderError
            | ErrorCode::ProviderNotFound => ErrorSeverity::High,

            ErrorCode::ConfigurationError
            | ErrorCode::ProviderInitFailed
            | ErrorCode::SerializationError
            | ErrorCode::InternalError => ErrorSeverity::Critical,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// Convenience constructors for common errors
impl Error {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthenticationFailed, message)
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidCredentials, message)
    }

    pub fn session_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SessionExpired, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthorizationFailed, message)
    }

    /// Permission denial carrying the permission (and optionally the
    /// resource) in the details map. No subject data is included.
    pub fn permission_denied(permission: &str, resource: Option<&str>) -> Self {
        let message = match resource {
            Some(r) => format!("Permission denied: '{}' for resource '{}'", permission, r),
            None => format!("Permission denied: '{}'", permission),
        };
        let mut err = Self::new(ErrorCode::PermissionDenied, message)
            .with_detail("permission", serde_json::json!(permission));
        if let Some(r) = resource {
            err = err.with_detail("resource", serde_json::json!(r));
        }
        err
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProviderError, message)
    }

    pub fn provider_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::ProviderNotFound,
            format!("Provider '{}' is not registered", name),
        )
        .with_detail("provider", serde_json::json!(name))
    }

    pub fn provider_init(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProviderInitFailed, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimitExceeded, message)
    }

    pub fn token_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TokenInvalid, message)
    }

    pub fn token_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TokenExpired, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceNotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceAlreadyExists, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::SerializationError, err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::new(ErrorCode::ConfigurationError, err.to_string())
    }
}
