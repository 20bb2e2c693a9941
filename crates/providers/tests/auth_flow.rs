//! End-to-end flows through a bootstrapped gateway: authentication,
//! authorization, lockout, hijack detection, cascading deletion and audit
//! export.

use std::collections::HashMap;
use warden_core::config::AuthConfig;
use warden_core::events::EventKind;
use warden_core::journal::AuditJournal;
use warden_core::pipeline::Pipeline;
use warden_core::providers::audit::{AuditQuery, ExportFormat};
use warden_core::providers::credential::CredentialMaterial;
use warden_core::providers::session::ClientInfo;
use warden_core::providers::user::NewUser;
use warden_core::registry::ProviderRegistry;
use warden_core::types::{CredentialKind, PolicyRule, User};
use warden_core::{AuthGateway, ErrorCode};
use warden_providers::{bootstrap, register_builtins};

fn test_config() -> serde_json::Value {
    serde_json::json!({
        "enabled": true,
        "providers": {
            "credential": {
                "provider": "memory",
                "config": {
                    "argon2_time_cost": 1,
                    "argon2_memory_cost": 8,
                    "max_failed_attempts": 3,
                    "min_verify_time_ms": 0
                }
            },
            "session": {
                "provider": "memory",
                "config": {"min_validation_time_ms": 0}
            },
            "user": {"provider": "memory"},
            "audit": {"provider": "memory"},
            "policy": {
                "provider": "memory",
                "config": {
                    "default_decision": "deny",
                    "policies": [
                        {
                            "effect": "allow",
                            "roles": ["editor"],
                            "resources": ["/docs/*"],
                            "description": "editors may touch documents"
                        }
                    ]
                }
            },
            "token": {
                "provider": "jwt",
                "config": {
                    "secret_key": "integration-test-secret-key-0123456789",
                    "min_validation_time_ms": 0
                }
            },
            "rate_limiter": {
                "provider": "memory",
                "config": {"default_limits": {"login": "3/min"}}
            }
        }
    })
}

async fn gateway() -> AuthGateway {
    let mut registry = ProviderRegistry::new();
    register_builtins(&mut registry);
    let config = AuthConfig::from_value(test_config()).unwrap();
    bootstrap(&config, &registry).await.unwrap()
}

async fn seed_user(gateway: &AuthGateway, username: &str, password: &str) -> User {
    let journal = gateway.journal();
    let user = gateway
        .user_directory()
        .create_user(NewUser::named(username).email(format!("{}@example.com", username)), &journal)
        .await
        .unwrap();
    gateway
        .credential_store()
        .create_credentials(
            &user.id,
            CredentialMaterial::Password {
                password: password.to_string(),
            },
            &journal,
        )
        .await
        .unwrap();
    user
}

#[tokio::test]
async fn test_successful_authentication_pipeline() {
    let gateway = gateway().await;
    let user = seed_user(&gateway, "alice", "P@ssword01").await;

    let journal = gateway.journal();
    let session = gateway
        .authenticate("alice", "P@ssword01", "fp-A", ClientInfo::new(), &journal)
        .await
        .unwrap();

    assert_eq!(session.user_id, user.id);
    assert_eq!(
        journal.events_after(0),
        vec![
            EventKind::AuthAttempt,
            EventKind::CredentialVerify,
            EventKind::AuthSuccess,
            EventKind::SessionCreate,
        ]
    );

    // The canonical authentication pipeline is satisfied by the trail
    let requirement = Pipeline::event(EventKind::AuthAttempt).then(
        Pipeline::event(EventKind::AuthSuccess).or(Pipeline::event(EventKind::AuthFailure)),
    );
    assert!(requirement.validate(&journal.events_after(0)).is_ok());

    // Every event reached the sink
    assert!(gateway.audit_sink().count().await.unwrap() >= 4);
}

#[tokio::test]
async fn test_failed_authentication_is_uniform_and_audited() {
    let gateway = gateway().await;
    seed_user(&gateway, "alice", "P@ssword01").await;

    // Wrong password and unknown user produce the same error kind and the
    // same event shape
    let journal = gateway.journal();
    let err = gateway
        .authenticate("alice", "wrong", "fp-A", ClientInfo::new(), &journal)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidCredentials);
    assert_eq!(
        journal.events_after(0),
        vec![
            EventKind::AuthAttempt,
            EventKind::CredentialVerify,
            EventKind::AuthFailure,
        ]
    );

    let journal = gateway.journal();
    let err = gateway
        .authenticate("nobody", "whatever", "fp-A", ClientInfo::new(), &journal)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidCredentials);
    assert_eq!(
        journal.events_after(0),
        vec![
            EventKind::AuthAttempt,
            EventKind::CredentialVerify,
            EventKind::AuthFailure,
        ]
    );
}

#[tokio::test]
async fn test_login_rate_limit_exceeded() {
    let gateway = gateway().await;
    seed_user(&gateway, "alice", "P@ssword01").await;

    for _ in 0..3 {
        let journal = gateway.journal();
        let _ = gateway
            .authenticate("alice", "wrong", "fp-A", ClientInfo::new(), &journal)
            .await;
    }

    let journal = gateway.journal();
    let err = gateway
        .authenticate("alice", "P@ssword01", "fp-A", ClientInfo::new(), &journal)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimitExceeded);
    assert_eq!(
        journal.events_after(0),
        vec![EventKind::AuthAttempt, EventKind::RateLimitExceeded]
    );
}

#[tokio::test]
async fn test_lockout_after_repeated_failures() {
    let gateway = gateway().await;
    let user = seed_user(&gateway, "alice", "P@ssword01").await;

    // Burn failures directly against the credential store so the login
    // rate limit stays out of the picture
    let store = gateway.credential_store();
    for _ in 0..3 {
        let journal = gateway.journal();
        let verified = store
            .verify_credentials(
                &user.id,
                warden_core::providers::credential::PresentedCredential::Password {
                    password: "wrong".to_string(),
                },
                &journal,
            )
            .await
            .unwrap();
        assert!(!verified);
    }

    // The correct password is refused while locked and the audit event
    // carries outcome=locked
    let journal = gateway.journal();
    let verified = store
        .verify_credentials(
            &user.id,
            warden_core::providers::credential::PresentedCredential::Password {
                password: "P@ssword01".to_string(),
            },
            &journal,
        )
        .await
        .unwrap();
    assert!(!verified);

    let events = gateway
        .audit_sink()
        .query(AuditQuery::new().kinds([EventKind::CredentialVerify]).limit(1))
        .await
        .unwrap();
    assert_eq!(
        events[0].metadata.get("outcome"),
        Some(&serde_json::json!("locked"))
    );
}

#[tokio::test]
async fn test_session_hijack_detection() {
    let gateway = gateway().await;
    seed_user(&gateway, "alice", "P@ssword01").await;

    let journal = gateway.journal();
    let session = gateway
        .authenticate("alice", "P@ssword01", "fp-A", ClientInfo::new(), &journal)
        .await
        .unwrap();

    // Presenting a different fingerprint destroys the session
    let journal = gateway.journal();
    let validated = gateway
        .session_store()
        .validate_session(&session.id, "fp-B", ClientInfo::new(), &journal)
        .await
        .unwrap();
    assert!(validated.is_none());
    assert_eq!(journal.events_after(0), vec![EventKind::SecurityViolation]);
    assert!(gateway
        .session_store()
        .get_session(&session.id)
        .await
        .unwrap()
        .is_none());

    let violations = gateway
        .audit_sink()
        .query(AuditQuery::new().kinds([EventKind::SecurityViolation]))
        .await
        .unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, "warning");
}

#[tokio::test]
async fn test_authorization_flow() {
    let gateway = gateway().await;
    let user = seed_user(&gateway, "alice", "P@ssword01").await;
    gateway
        .user_directory()
        .assign_role(&user.id, "editor")
        .await
        .unwrap();

    let journal = gateway.journal();
    let session = gateway
        .authenticate("alice", "P@ssword01", "fp-A", ClientInfo::new(), &journal)
        .await
        .unwrap();

    // Editors may touch documents
    let journal = gateway.journal();
    let decision = gateway
        .authorize(&session.id, "fp-A", "/docs/readme", "GET", ClientInfo::new(), &journal)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.policy_id, "0");
    assert_eq!(
        journal.events_after(0),
        vec![
            EventKind::AuthzCheck,
            EventKind::SessionAccess,
            EventKind::AuthzGrant,
        ]
    );

    // Anything else falls through to the default deny
    let journal = gateway.journal();
    let decision = gateway
        .authorize(&session.id, "fp-A", "/admin", "GET", ClientInfo::new(), &journal)
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.policy_id, "default");

    // An invalid session denies without consulting policy
    let journal = gateway.journal();
    let decision = gateway
        .authorize("missing", "fp-A", "/docs/readme", "GET", ClientInfo::new(), &journal)
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.policy_id, "session");
}

#[tokio::test]
async fn test_logout_destroys_session() {
    let gateway = gateway().await;
    seed_user(&gateway, "alice", "P@ssword01").await;

    let journal = gateway.journal();
    let session = gateway
        .authenticate("alice", "P@ssword01", "fp-A", ClientInfo::new(), &journal)
        .await
        .unwrap();

    let journal = gateway.journal();
    assert!(gateway.logout(&session.id, &journal).await.unwrap());
    assert_eq!(
        journal.events_after(0),
        vec![EventKind::SessionDestroy, EventKind::AuthLogout]
    );
    // Logging out again is a no-op, not an error
    let journal = gateway.journal();
    assert!(!gateway.logout(&session.id, &journal).await.unwrap());
}

#[tokio::test]
async fn test_delete_user_cascades_to_sessions_and_credentials() {
    let gateway = gateway().await;
    let user = seed_user(&gateway, "alice", "P@ssword01").await;

    let journal = gateway.journal();
    let session = gateway
        .authenticate("alice", "P@ssword01", "fp-A", ClientInfo::new(), &journal)
        .await
        .unwrap();

    let journal = gateway.journal();
    gateway
        .user_directory()
        .delete_user(&user.id, &journal)
        .await
        .unwrap();

    assert!(gateway
        .user_directory()
        .get_user_by_id(&user.id)
        .await
        .unwrap()
        .is_none());
    assert!(gateway
        .session_store()
        .get_session(&session.id)
        .await
        .unwrap()
        .is_none());
    assert!(gateway
        .credential_store()
        .credential_kinds(&user.id)
        .await
        .unwrap()
        .is_empty());
    // The deleted user can no longer authenticate
    let journal = gateway.journal();
    assert!(gateway
        .authenticate("alice", "P@ssword01", "fp-A", ClientInfo::new(), &journal)
        .await
        .is_err());
}

#[tokio::test]
async fn test_token_issuance_for_session_holder() {
    let gateway = gateway().await;
    let user = seed_user(&gateway, "alice", "P@ssword01").await;

    let tokens = gateway.token_service().unwrap();
    let payload = HashMap::from([("user_id".to_string(), serde_json::json!(user.id))]);
    let access = tokens
        .generate_token(payload, warden_core::TokenType::Access, None)
        .await
        .unwrap();

    let validated = tokens.validate_token(&access.token_value).await.unwrap();
    assert_eq!(validated.user_id.as_deref(), Some(user.id.as_str()));
}

#[tokio::test]
async fn test_audit_export_matches_store_count() {
    let gateway = gateway().await;
    seed_user(&gateway, "alice", "P@ssword01").await;
    let journal = gateway.journal();
    let _ = gateway
        .authenticate("alice", "P@ssword01", "fp-A", ClientInfo::new(), &journal)
        .await
        .unwrap();

    let sink = gateway.audit_sink();
    let exported = sink.export(ExportFormat::Json).await.unwrap();
    let parsed: Vec<serde_json::Value> = serde_json::from_str(&exported).unwrap();
    assert_eq!(parsed.len() as u64, sink.count().await.unwrap());

    // No sensitive material anywhere in the export
    assert!(!exported.contains("P@ssword01"));
}

#[tokio::test]
async fn test_bootstrap_seeds_test_users() {
    let mut registry = ProviderRegistry::new();
    register_builtins(&mut registry);
    let mut config_value = test_config();
    config_value["development"] = serde_json::json!({
        "test_users": [
            {"username": "dev", "password": "DevP@ssw0rd1", "roles": ["editor"]}
        ]
    });
    let config = AuthConfig::from_value(config_value).unwrap();
    let gateway = bootstrap(&config, &registry).await.unwrap();

    let journal = gateway.journal();
    let session = gateway
        .authenticate("dev", "DevP@ssw0rd1", "fp-dev", ClientInfo::new(), &journal)
        .await
        .unwrap();
    let user = gateway
        .user_directory()
        .get_user_by_id(&session.user_id)
        .await
        .unwrap()
        .unwrap();
    assert!(user.roles.contains("editor"));
}

#[tokio::test]
async fn test_credential_delete_requires_audit_trail() {
    // A journal threaded through a provider method records exactly the
    // declared events; the detached journal used here proves enforcement
    // operates on the slice of this call only.
    let gateway = gateway().await;
    let user = seed_user(&gateway, "alice", "P@ssword01").await;

    let journal = AuditJournal::detached();
    let removed = gateway
        .credential_store()
        .delete_credentials(&user.id, CredentialKind::Password, &journal)
        .await
        .unwrap();
    assert!(removed);
    assert_eq!(journal.events_after(0), vec![EventKind::CredentialDelete]);
}

#[tokio::test]
async fn test_policy_rule_appended_at_runtime() {
    let gateway = gateway().await;
    let user = seed_user(&gateway, "alice", "P@ssword01").await;
    gateway
        .user_directory()
        .assign_role(&user.id, "auditor")
        .await
        .unwrap();

    let journal = gateway.journal();
    let session = gateway
        .authenticate("alice", "P@ssword01", "fp-A", ClientInfo::new(), &journal)
        .await
        .unwrap();

    // Denied before the rule exists
    let journal = gateway.journal();
    let decision = gateway
        .authorize(&session.id, "fp-A", "/reports/q3", "GET", ClientInfo::new(), &journal)
        .await
        .unwrap();
    assert!(!decision.allowed);

    // Policy additions take effect immediately
    let _ = registry_policy_append(&gateway).await;
    let journal = gateway.journal();
    let decision = gateway
        .authorize(&session.id, "fp-A", "/reports/q3", "GET", ClientInfo::new(), &journal)
        .await
        .unwrap();
    assert!(decision.allowed);
}

async fn registry_policy_append(gateway: &AuthGateway) -> String {
    gateway
        .policy_engine()
        .register_policy(PolicyRule {
            effect: "allow".to_string(),
            roles: Some(vec!["auditor".to_string()]),
            resources: Some(vec!["/reports/*".to_string()]),
            description: Some("auditors may read reports".to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
}
