use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed vocabulary of audit event kinds.
///
/// The wire form is the dotted string (`auth.attempt`, `session.create`, …).
/// New kinds are added by extending this enum only; providers must not
/// invent ad-hoc event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventKind {
    // Authentication
    AuthAttempt,
    AuthSuccess,
    AuthFailure,
    AuthLogout,

    // Authorization
    AuthzCheck,
    AuthzGrant,
    AuthzDeny,

    // Sessions
    SessionCreate,
    SessionRefresh,
    SessionExpire,
    SessionDestroy,
    SessionAccess,
    SessionInvalid,

    // Users
    UserCreate,
    UserUpdate,
    UserDelete,
    UserLock,
    UserUnlock,

    // Credentials
    CredentialCreate,
    CredentialUpdate,
    CredentialDelete,
    CredentialVerify,

    // Security
    SecurityViolation,
    SecurityAnomaly,
    RateLimitExceeded,
    PermissionCheck,
    AccessGranted,
    AccessDenied,
}

impl EventKind {
    /// All members of the vocabulary, in declaration order.
    pub const ALL: [EventKind; 28] = [
        EventKind::AuthAttempt,
        EventKind::AuthSuccess,
        EventKind::AuthFailure,
        EventKind::AuthLogout,
        EventKind::AuthzCheck,
        EventKind::AuthzGrant,
        EventKind::AuthzDeny,
        EventKind::SessionCreate,
        EventKind::SessionRefresh,
        EventKind::SessionExpire,
        EventKind::SessionDestroy,
        EventKind::SessionAccess,
        EventKind::SessionInvalid,
        EventKind::UserCreate,
        EventKind::UserUpdate,
        EventKind::UserDelete,
        EventKind::UserLock,
        EventKind::UserUnlock,
        EventKind::CredentialCreate,
        EventKind::CredentialUpdate,
        EventKind::CredentialDelete,
        EventKind::CredentialVerify,
        EventKind::SecurityViolation,
        EventKind::SecurityAnomaly,
        EventKind::RateLimitExceeded,
        EventKind::PermissionCheck,
        EventKind::AccessGranted,
        EventKind::AccessDenied,
    ];

    /// The dotted wire identifier for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AuthAttempt => "auth.attempt",
            EventKind::AuthSuccess => "auth.success",
            EventKind::AuthFailure => "auth.failure",
            EventKind::AuthLogout => "auth.logout",
            EventKind::AuthzCheck => "authz.check",
            EventKind::AuthzGrant => "authz.grant",
            EventKind::AuthzDeny => "authz.deny",
            EventKind::SessionCreate => "session.create",
            EventKind::SessionRefresh => "session.refresh",
            EventKind::SessionExpire => "session.expire",
            EventKind::SessionDestroy => "session.destroy",
            EventKind::SessionAccess => "session.access",
            EventKind::SessionInvalid => "session.invalid",
            EventKind::UserCreate => "user.create",
            EventKind::UserUpdate => "user.update",
            EventKind::UserDelete => "user.delete",
            EventKind::UserLock => "user.lock",
            EventKind::UserUnlock => "user.unlock",
            EventKind::CredentialCreate => "credential.create",
            EventKind::CredentialUpdate => "credential.update",
            EventKind::CredentialDelete => "credential.delete",
            EventKind::CredentialVerify => "credential.verify",
            EventKind::SecurityViolation => "security.violation",
            EventKind::SecurityAnomaly => "security.anomaly",
            EventKind::RateLimitExceeded => "rate_limit.exceeded",
            EventKind::PermissionCheck => "permission.check",
            EventKind::AccessGranted => "access.granted",
            EventKind::AccessDenied => "access.denied",
        }
    }

    /// Conceptual category for grouping and reporting
    pub fn category(&self) -> &'static str {
        match self {
            EventKind::AuthAttempt
            | EventKind::AuthSuccess
            | EventKind::AuthFailure
            | EventKind::AuthLogout => "authentication",

            EventKind::AuthzCheck | EventKind::AuthzGrant | EventKind::AuthzDeny => {
                "authorization"
            }

            EventKind::SessionCreate
            | EventKind::SessionRefresh
            | EventKind::SessionExpire
            | EventKind::SessionDestroy
            | EventKind::SessionAccess
            | EventKind::SessionInvalid => "session",

            EventKind::UserCreate
            | EventKind::UserUpdate
            | EventKind::UserDelete
            | EventKind::UserLock
            | EventKind::UserUnlock => "user",

            EventKind::CredentialCreate
            | EventKind::CredentialUpdate
            | EventKind::CredentialDelete
            | EventKind::CredentialVerify => "credential",

            EventKind::SecurityViolation
            | EventKind::SecurityAnomaly
            | EventKind::RateLimitExceeded
            | EventKind::PermissionCheck
            | EventKind::AccessGranted
            | EventKind::AccessDenied => "security",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown audit event kind: {}", s))
    }
}

impl TryFrom<String> for EventKind {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_form_round_trip() {
        for kind in EventKind::ALL {
            let parsed: EventKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!("auth.bogus".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_serde_uses_dotted_string() {
        let json = serde_json::to_string(&EventKind::SessionCreate).unwrap();
        assert_eq!(json, "\"session.create\"");
        let back: EventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventKind::SessionCreate);
    }

    #[test]
    fn test_categories() {
        assert_eq!(EventKind::AuthAttempt.category(), "authentication");
        assert_eq!(EventKind::AuthzDeny.category(), "authorization");
        assert_eq!(EventKind::SessionExpire.category(), "session");
        assert_eq!(EventKind::CredentialVerify.category(), "credential");
        assert_eq!(EventKind::RateLimitExceeded.category(), "security");
    }
}
