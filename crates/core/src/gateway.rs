use crate::enforcement::{enforce, ContractMap};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::journal::{AuditJournal, EventContext};
use crate::pipeline::Pipeline;
use crate::providers::{
    AuditSink, ClientInfo, CredentialStore, PolicyEngine, PresentedCredential, RateLimiter,
    SessionStore, TokenService, UserDirectory,
};
use crate::types::{Decision, PolicyDecision, Session, SubjectContext};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::{info, warn};

/// Pipelines the gateway's own operations must satisfy.
static CONTRACT: Lazy<ContractMap> = Lazy::new(|| {
    let mut table = ContractMap::new();
    table.insert(
        "authenticate",
        Pipeline::event(EventKind::AuthAttempt)
            .then(Pipeline::event(EventKind::AuthSuccess))
            .or(Pipeline::event(EventKind::AuthAttempt).then(Pipeline::event(EventKind::AuthFailure)))
            .or(Pipeline::event(EventKind::AuthAttempt)
                .then(Pipeline::event(EventKind::RateLimitExceeded))),
    );
    table.insert("logout", Pipeline::event(EventKind::AuthLogout));
    table.insert(
        "authorize",
        Pipeline::event(EventKind::AuthzCheck).then(
            Pipeline::event(EventKind::AuthzGrant).or(Pipeline::event(EventKind::AuthzDeny)),
        ),
    );
    table
});

/// Orchestrates the providers into the user-facing authentication flows:
/// authenticate, logout, authorize, session refresh.
///
/// The gateway owns nothing but `Arc` handles; all state lives in the
/// providers. Each flow runs under the enforcement harness against the
/// pipelines declared above.
pub struct AuthGateway {
    credentials: Arc<dyn CredentialStore>,
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserDirectory>,
    audit: Arc<dyn AuditSink>,
    policy: Arc<dyn PolicyEngine>,
    tokens: Option<Arc<dyn TokenService>>,
    limiter: Option<Arc<dyn RateLimiter>>,
}

pub struct AuthGatewayBuilder {
    credentials: Option<Arc<dyn CredentialStore>>,
    sessions: Option<Arc<dyn SessionStore>>,
    users: Option<Arc<dyn UserDirectory>>,
    audit: Option<Arc<dyn AuditSink>>,
    policy: Option<Arc<dyn PolicyEngine>>,
    tokens: Option<Arc<dyn TokenService>>,
    limiter: Option<Arc<dyn RateLimiter>>,
}

impl AuthGatewayBuilder {
    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PolicyEngine>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenService>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> Result<AuthGateway> {
        Ok(AuthGateway {
            credentials: self
                .credentials
                .ok_or_else(|| Error::provider_init("credential store is required"))?,
            sessions: self
                .sessions
                .ok_or_else(|| Error::provider_init("session store is required"))?,
            users: self
                .users
                .ok_or_else(|| Error::provider_init("user directory is required"))?,
            audit: self
                .audit
                .ok_or_else(|| Error::provider_init("audit sink is required"))?,
            policy: self
                .policy
                .ok_or_else(|| Error::provider_init("policy engine is required"))?,
            tokens: self.tokens,
            limiter: self.limiter,
        })
    }
}

impl AuthGateway {
    pub fn builder() -> AuthGatewayBuilder {
        AuthGatewayBuilder {
            credentials: None,
            sessions: None,
            users: None,
            audit: None,
            policy: None,
            tokens: None,
            limiter: None,
        }
    }

    /// A journal wired to this gateway's audit sink, for callers that do
    /// not carry their own.
    pub fn journal(&self) -> AuditJournal {
        AuditJournal::new(self.audit.clone())
    }

    pub fn audit_sink(&self) -> Arc<dyn AuditSink> {
        self.audit.clone()
    }

    pub fn token_service(&self) -> Option<Arc<dyn TokenService>> {
        self.tokens.clone()
    }

    pub fn user_directory(&self) -> Arc<dyn UserDirectory> {
        self.users.clone()
    }

    pub fn session_store(&self) -> Arc<dyn SessionStore> {
        self.sessions.clone()
    }

    pub fn credential_store(&self) -> Arc<dyn CredentialStore> {
        self.credentials.clone()
    }

    pub fn policy_engine(&self) -> Arc<dyn PolicyEngine> {
        self.policy.clone()
    }

    /// Authenticate a user by username and password and open a session.
    ///
    /// Flow: rate-limit consumption, credential verification, session
    /// creation. The audit trail for a successful call reads
    /// `auth.attempt, credential.verify, auth.success, session.create`.
    /// Failures are uniform `InvalidCredentials` regardless of whether the
    /// user exists, the password mismatched or the account is locked; the
    /// audit event records the distinction.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        fingerprint: &str,
        client: ClientInfo,
        journal: &AuditJournal,
    ) -> Result<Session> {
        enforce::<Self, _, _>(&CONTRACT, "authenticate", journal, async {
            journal
                .record(
                    EventKind::AuthAttempt,
                    EventContext::new()
                        .user(username)
                        .action("login")
                        .ip_address_opt(client.ip_address.clone())
                        .user_agent_opt(client.user_agent.clone()),
                )
                .await?;

            if let Some(limiter) = &self.limiter {
                let status = limiter.track(username, "login").await?;
                if !status.allowed {
                    journal
                        .record(
                            EventKind::RateLimitExceeded,
                            EventContext::new()
                                .user(username)
                                .action("login")
                                .meta("retry_after", serde_json::json!(status.retry_after)),
                        )
                        .await?;
                    warn!(username = %username, "Login rate limit exceeded");
                    return Err(Error::rate_limited("Too many login attempts"));
                }
            }

            let user = self.users.get_user_by_username(username).await?;
            let verified = match &user {
                Some(user) if user.is_active => {
                    self.credentials
                        .verify_credentials(
                            &user.id,
                            PresentedCredential::Password {
                                password: password.to_string(),
                            },
                            journal,
                        )
                        .await?
                }
                _ => {
                    // Unknown or inactive user: burn a verification so the
                    // failure path emits the same events as a mismatch.
                    self.credentials
                        .verify_credentials(
                            username,
                            PresentedCredential::Password {
                                password: password.to_string(),
                            },
                            journal,
                        )
                        .await
                        .unwrap_or(false)
                }
            };

            let Some(user) = user.filter(|u| u.is_active && verified) else {
                journal
                    .record(
                        EventKind::AuthFailure,
                        EventContext::new()
                            .user(username)
                            .action("login")
                            .result(Decision::Deny),
                    )
                    .await?;
                return Err(Error::invalid_credentials("Authentication failed"));
            };

            journal
                .record(
                    EventKind::AuthSuccess,
                    EventContext::new().user(&user.id).action("login"),
                )
                .await?;

            let session = self
                .sessions
                .create_session(&user.id, fingerprint, client, None, journal)
                .await?;

            info!(user_id = %user.id, session_id = %session.id, "User authenticated");
            Ok(session)
        })
        .await
    }

    /// Destroy a session and record the logout.
    pub async fn logout(&self, session_id: &str, journal: &AuditJournal) -> Result<bool> {
        enforce::<Self, _, _>(&CONTRACT, "logout", journal, async {
            let destroyed = self.sessions.destroy_session(session_id, journal).await?;
            journal
                .record(
                    EventKind::AuthLogout,
                    EventContext::new().session(session_id),
                )
                .await?;
            Ok(destroyed)
        })
        .await
    }

    /// Authorize an action on a resource for the holder of a session.
    ///
    /// The session is validated first; an invalid session denies without
    /// consulting the policy engine. The decision carries the matching
    /// policy id and reason.
    pub async fn authorize(
        &self,
        session_id: &str,
        fingerprint: &str,
        resource: &str,
        action: &str,
        client: ClientInfo,
        journal: &AuditJournal,
    ) -> Result<PolicyDecision> {
        enforce::<Self, _, _>(&CONTRACT, "authorize", journal, async {
            journal
                .record(
                    EventKind::AuthzCheck,
                    EventContext::new()
                        .session(session_id)
                        .resource(resource)
                        .action(action),
                )
                .await?;

            let session = self
                .sessions
                .validate_session(session_id, fingerprint, client, journal)
                .await?;

            let Some(session) = session else {
                journal
                    .record(
                        EventKind::AuthzDeny,
                        EventContext::new()
                            .session(session_id)
                            .resource(resource)
                            .action(action)
                            .result(Decision::Deny),
                    )
                    .await?;
                return Ok(PolicyDecision {
                    allowed: false,
                    reason: "Session is not valid".to_string(),
                    policy_id: "session".to_string(),
                    applied_policies: vec![],
                });
            };

            let roles = self
                .users
                .get_user_roles(&session.user_id)
                .await?
                .into_iter()
                .map(|role| role.name)
                .collect();
            let permissions = self.users.get_user_permissions(&session.user_id).await?;
            let subject = SubjectContext {
                user_id: Some(session.user_id.clone()),
                roles,
                permissions,
                attributes: Default::default(),
            };

            let decision = self.policy.evaluate(resource, action, &subject).await?;
            let (kind, result) = if decision.allowed {
                (EventKind::AuthzGrant, Decision::Allow)
            } else {
                (EventKind::AuthzDeny, Decision::Deny)
            };
            journal
                .record(
                    kind,
                    EventContext::new()
                        .user(&session.user_id)
                        .session(session_id)
                        .resource(resource)
                        .action(action)
                        .result(result)
                        .meta("policy_id", serde_json::json!(decision.policy_id)),
                )
                .await?;

            Ok(decision)
        })
        .await
    }

    /// Refresh a session's expiry through the session store.
    pub async fn refresh(
        &self,
        session_id: &str,
        journal: &AuditJournal,
    ) -> Result<Option<Session>> {
        self.sessions.refresh_session(session_id, journal).await
    }
}

impl EventContext {
    fn ip_address_opt(self, ip: Option<String>) -> Self {
        match ip {
            Some(ip) => self.ip_address(ip),
            None => self,
        }
    }

    fn user_agent_opt(self, ua: Option<String>) -> Self {
        match ua {
            Some(ua) => self.user_agent(ua),
            None => self,
        }
    }
}
