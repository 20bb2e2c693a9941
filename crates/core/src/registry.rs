use crate::error::Result;
use crate::providers::{
    AuditSink, CredentialStore, PolicyEngine, RateLimiter, SessionStore, TokenService,
    UserDirectory,
};
use std::collections::HashMap;
use std::sync::Arc;

type Constructor<T> = Arc<dyn Fn(&serde_json::Value) -> Result<Arc<T>> + Send + Sync>;

/// Explicit table of provider constructors.
///
/// Providers are registered by name at startup — bundled ones by
/// `warden_providers::register_builtins`, external ones by application
/// code. Configuration resolves provider names against this table; there
/// is no runtime class loading.
#[derive(Default)]
pub struct ProviderRegistry {
    credential: HashMap<String, Constructor<dyn CredentialStore>>,
    session: HashMap<String, Constructor<dyn SessionStore>>,
    user: HashMap<String, Constructor<dyn UserDirectory>>,
    audit: HashMap<String, Constructor<dyn AuditSink>>,
    policy: HashMap<String, Constructor<dyn PolicyEngine>>,
    token: HashMap<String, Constructor<dyn TokenService>>,
    rate_limiter: HashMap<String, Constructor<dyn RateLimiter>>,
}

macro_rules! registry_accessors {
    ($register:ident, $build:ident, $has:ident, $field:ident, $trait_ty:ty) => {
        pub fn $register<F>(&mut self, name: impl Into<String>, constructor: F)
        where
            F: Fn(&serde_json::Value) -> Result<Arc<$trait_ty>> + Send + Sync + 'static,
        {
            self.$field.insert(name.into(), Arc::new(constructor));
        }

        pub fn $build(&self, name: &str, config: &serde_json::Value) -> Result<Arc<$trait_ty>> {
            match self.$field.get(name) {
                Some(constructor) => constructor(config),
                None => Err(crate::error::Error::provider_not_found(name)),
            }
        }

        pub fn $has(&self, name: &str) -> bool {
            self.$field.contains_key(name)
        }
    };
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    registry_accessors!(
        register_credential,
        build_credential,
        has_credential,
        credential,
        dyn CredentialStore
    );
    registry_accessors!(register_session, build_session, has_session, session, dyn SessionStore);
    registry_accessors!(register_user, build_user, has_user, user, dyn UserDirectory);
    registry_accessors!(register_audit, build_audit, has_audit, audit, dyn AuditSink);
    registry_accessors!(register_policy, build_policy, has_policy, policy, dyn PolicyEngine);
    registry_accessors!(register_token, build_token, has_token, token, dyn TokenService);
    registry_accessors!(
        register_rate_limiter,
        build_rate_limiter,
        has_rate_limiter,
        rate_limiter,
        dyn RateLimiter
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::types::{PolicyDecision, PolicyRule, SubjectContext};
    use async_trait::async_trait;

    struct AllowAll;

    #[async_trait]
    impl PolicyEngine for AllowAll {
        async fn evaluate(
            &self,
            _resource: &str,
            _action: &str,
            _subject: &SubjectContext,
        ) -> Result<PolicyDecision> {
            Ok(PolicyDecision {
                allowed: true,
                reason: "test".to_string(),
                policy_id: "default".to_string(),
                applied_policies: vec![],
            })
        }

        async fn bulk_evaluate(
            &self,
            requests: &[(String, String, SubjectContext)],
        ) -> Result<Vec<PolicyDecision>> {
            let mut decisions = Vec::with_capacity(requests.len());
            for (resource, action, subject) in requests {
                decisions.push(self.evaluate(resource, action, subject).await?);
            }
            Ok(decisions)
        }

        async fn register_policy(&self, _rule: PolicyRule) -> Result<String> {
            Ok("0".to_string())
        }
    }

    #[test]
    fn test_register_and_build() {
        let mut registry = ProviderRegistry::new();
        registry.register_policy("allow_all", |_config| Ok(Arc::new(AllowAll) as _));

        assert!(registry.has_policy("allow_all"));
        assert!(!registry.has_policy("memory"));
        assert!(registry
            .build_policy("allow_all", &serde_json::json!({}))
            .is_ok());
    }

    #[test]
    fn test_unknown_provider_name() {
        let registry = ProviderRegistry::new();
        let err = match registry.build_credential("missing", &serde_json::json!({})) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.code, ErrorCode::ProviderNotFound);
    }
}
