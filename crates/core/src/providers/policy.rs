use crate::error::Result;
use crate::types::{PolicyDecision, PolicyRule, SubjectContext};
use async_trait::async_trait;

/// Rule-ordered authorization decisions with a fail-secure default.
///
/// Evaluation is deterministic: for a fixed rule list and subject, the same
/// request always yields the same decision.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluate one request. The first rule whose filters all match
    /// determines the decision; otherwise the configured default applies
    /// with policy id `"default"`.
    async fn evaluate(
        &self,
        resource: &str,
        action: &str,
        subject: &SubjectContext,
    ) -> Result<PolicyDecision>;

    /// Evaluate many requests. Semantics must equal the per-request
    /// result; implementations may batch internally.
    async fn bulk_evaluate(
        &self,
        requests: &[(String, String, SubjectContext)],
    ) -> Result<Vec<PolicyDecision>>;

    /// Append a rule. Returns its policy id (the rule's index).
    async fn register_policy(&self, rule: PolicyRule) -> Result<String>;
}
