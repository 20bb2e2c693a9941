//! # Warden Providers
//!
//! Bundled implementations of the Warden provider contracts: in-memory
//! credential store, session store, user directory and audit sink, the JWT
//! token service, the rule-list policy engine and the sliding-window rate
//! limiter, plus the bootstrap that assembles an `AuthGateway` from
//! validated configuration.

pub mod audit;
pub mod credential;
pub mod jwt;
pub mod limiter;
pub mod policy;
pub mod session;
pub mod store;
pub mod user;

pub use audit::{AuditSinkConfig, MemoryAuditSink};
pub use credential::{CredentialStoreConfig, MemoryCredentialStore};
pub use jwt::{JwtServiceConfig, JwtTokenService};
pub use limiter::{RateLimiterConfig, SlidingWindowRateLimiter};
pub use policy::{PolicyEngineConfig, SimplePolicyEngine};
pub use session::{MemorySessionStore, SessionStoreConfig};
pub use user::{MemoryUserDirectory, UserDirectoryConfig};

use std::sync::Arc;
use tracing::info;
use warden_core::config::AuthConfig;
use warden_core::error::Result;
use warden_core::gateway::AuthGateway;
use warden_core::journal::AuditJournal;
use warden_core::providers::credential::CredentialMaterial;
use warden_core::providers::user::NewUser;
use warden_core::registry::ProviderRegistry;
use warden_core::types::CredentialKind;

/// Register every bundled provider under its well-known name.
pub fn register_builtins(registry: &mut ProviderRegistry) {
    registry.register_credential("memory", |config| {
        Ok(Arc::new(MemoryCredentialStore::from_config(config)?) as _)
    });
    registry.register_session("memory", |config| {
        Ok(Arc::new(MemorySessionStore::from_config(config)?) as _)
    });
    registry.register_user("memory", |config| {
        Ok(Arc::new(MemoryUserDirectory::from_config(config)?) as _)
    });
    registry.register_audit("memory", |config| {
        Ok(Arc::new(MemoryAuditSink::from_config(config)?) as _)
    });
    registry.register_policy("memory", |config| {
        Ok(Arc::new(SimplePolicyEngine::from_config(config)?) as _)
    });
    registry.register_policy("simple", |config| {
        Ok(Arc::new(SimplePolicyEngine::from_config(config)?) as _)
    });
    registry.register_token("jwt", |config| {
        Ok(Arc::new(JwtTokenService::from_config(config)?) as _)
    });
    registry.register_rate_limiter("memory", |config| {
        Ok(Arc::new(SlidingWindowRateLimiter::from_config(config)?) as _)
    });
}

/// Build an [`AuthGateway`] from validated configuration: construct each
/// configured provider, wire the deletion cascades, and seed any
/// development test users.
pub async fn bootstrap(config: &AuthConfig, registry: &ProviderRegistry) -> Result<AuthGateway> {
    config.validate(registry)?;

    let credentials = registry.build_credential(
        &config.providers.credential.provider,
        &config.providers.credential.config,
    )?;
    let sessions = registry.build_session(
        &config.providers.session.provider,
        &config.providers.session.config,
    )?;
    let users = registry.build_user(
        &config.providers.user.provider,
        &config.providers.user.config,
    )?;
    let audit = registry.build_audit(
        &config.providers.audit.provider,
        &config.providers.audit.config,
    )?;
    let policy = registry.build_policy(
        &config.providers.policy.provider,
        &config.providers.policy.config,
    )?;

    // Deleting a user tears down the user's sessions and credentials.
    {
        let sessions = sessions.clone();
        users.add_delete_cascade(Arc::new(move |user_id| {
            let sessions = sessions.clone();
            Box::pin(async move { sessions.destroy_user_sessions(&user_id).await })
        }));
    }
    {
        let credentials = credentials.clone();
        users.add_delete_cascade(Arc::new(move |user_id| {
            let credentials = credentials.clone();
            Box::pin(async move {
                let journal = AuditJournal::detached();
                let mut removed = 0;
                for kind in [
                    CredentialKind::Password,
                    CredentialKind::Token,
                    CredentialKind::ApiKey,
                ] {
                    if credentials
                        .delete_credentials(&user_id, kind, &journal)
                        .await?
                    {
                        removed += 1;
                    }
                }
                Ok(removed)
            })
        }));
    }

    let mut builder = AuthGateway::builder()
        .credentials(credentials.clone())
        .sessions(sessions)
        .users(users.clone())
        .audit(audit.clone())
        .policy(policy);

    if let Some(token_config) = &config.providers.token {
        builder = builder.tokens(registry.build_token(&token_config.provider, &token_config.config)?);
    }
    if let Some(limiter_config) = &config.providers.rate_limiter {
        builder = builder.limiter(
            registry.build_rate_limiter(&limiter_config.provider, &limiter_config.config)?,
        );
    }

    let gateway = builder.build()?;

    // Development conveniences: seed test users with password credentials.
    for test_user in &config.development.test_users {
        let journal = AuditJournal::new(audit.clone());
        let mut request = NewUser::named(&test_user.username);
        request.email = test_user.email.clone();
        let user = users.create_user(request, &journal).await?;
        credentials
            .create_credentials(
                &user.id,
                CredentialMaterial::Password {
                    password: test_user.password.clone(),
                },
                &journal,
            )
            .await?;
        for role in &test_user.roles {
            users.assign_role(&user.id, role).await?;
        }
        info!(username = %test_user.username, "Seeded test user");
    }

    Ok(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_register_under_known_names() {
        let mut registry = ProviderRegistry::new();
        register_builtins(&mut registry);
        assert!(registry.has_credential("memory"));
        assert!(registry.has_session("memory"));
        assert!(registry.has_user("memory"));
        assert!(registry.has_audit("memory"));
        assert!(registry.has_policy("memory"));
        assert!(registry.has_policy("simple"));
        assert!(registry.has_token("jwt"));
        assert!(registry.has_rate_limiter("memory"));
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_unknown_provider() {
        let mut registry = ProviderRegistry::new();
        register_builtins(&mut registry);

        let config = AuthConfig::from_value(serde_json::json!({
            "providers": {
                "credential": {"provider": "postgres"},
                "session": {"provider": "memory"},
                "user": {"provider": "memory"},
                "audit": {"provider": "memory"},
                "policy": {"provider": "memory"}
            }
        }))
        .unwrap();

        assert!(bootstrap(&config, &registry).await.is_err());
    }
}
