use async_trait::async_trait;
use glob::Pattern;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::RwLock;
use tracing::warn;
use warden_core::error::{Error, Result};
use warden_core::providers::policy::PolicyEngine;
use warden_core::types::{PolicyDecision, PolicyRule, SubjectContext};

/// Configuration for the rule-list policy engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyEngineConfig {
    /// Decision when no rule matches: "allow" or "deny"
    pub default_decision: String,
    pub case_sensitive_permissions: bool,
    pub policies: Vec<PolicyRule>,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            default_decision: "deny".to_string(),
            case_sensitive_permissions: true,
            policies: Vec::new(),
        }
    }
}

/// Ordered-rule policy engine with glob resource/action matching.
///
/// Rules are evaluated in declaration order; the first rule whose present
/// filters all match decides. With no match the configured default
/// applies, so an empty rule list is fail-secure when the default is deny.
pub struct SimplePolicyEngine {
    rules: RwLock<Vec<PolicyRule>>,
    default_allow: bool,
    case_sensitive_permissions: bool,
}

impl SimplePolicyEngine {
    pub fn new(config: PolicyEngineConfig) -> Result<Self> {
        let default_allow = match config.default_decision.as_str() {
            "allow" => true,
            "deny" => false,
            other => {
                return Err(Error::configuration(format!(
                    "default_decision must be 'allow' or 'deny', got '{}'",
                    other
                )))
            }
        };
        for (index, rule) in config.policies.iter().enumerate() {
            Self::validate_rule(rule)
                .map_err(|e| Error::configuration(format!("Policy {}: {}", index, e.message)))?;
        }
        Ok(Self {
            rules: RwLock::new(config.policies),
            default_allow,
            case_sensitive_permissions: config.case_sensitive_permissions,
        })
    }

    pub fn from_config(value: &serde_json::Value) -> Result<Self> {
        let config: PolicyEngineConfig = serde_json::from_value(value.clone())?;
        Self::new(config)
    }

    fn validate_rule(rule: &PolicyRule) -> Result<()> {
        if rule.effect != "allow" && rule.effect != "deny" {
            return Err(Error::validation(format!(
                "effect must be 'allow' or 'deny', got '{}'",
                rule.effect
            )));
        }
        let has_filter = rule.users.is_some()
            || rule.roles.is_some()
            || rule.permissions.is_some()
            || rule.resources.is_some()
            || rule.actions.is_some()
            || rule.custom.is_some();
        if !has_filter {
            return Err(Error::validation("a policy rule needs at least one filter"));
        }
        Ok(())
    }

    /// `*` matches any run of characters, path separators included.
    fn glob_matches(patterns: &[String], value: &str) -> bool {
        patterns.iter().any(|raw| match Pattern::new(raw) {
            Ok(pattern) => pattern.matches(value),
            Err(e) => {
                warn!(pattern = %raw, error = %e, "Skipping malformed policy pattern");
                false
            }
        })
    }

    fn rule_matches(&self, rule: &PolicyRule, resource: &str, action: &str, subject: &SubjectContext) -> bool {
        if let Some(users) = &rule.users {
            match &subject.user_id {
                Some(user_id) if users.contains(user_id) => {}
                _ => return false,
            }
        }

        if let Some(roles) = &rule.roles {
            if !roles.iter().any(|role| subject.roles.contains(role)) {
                return false;
            }
        }

        if let Some(permissions) = &rule.permissions {
            let subject_permissions: BTreeSet<String> = if self.case_sensitive_permissions {
                subject.permissions.iter().cloned().collect()
            } else {
                subject.permissions.iter().map(|p| p.to_lowercase()).collect()
            };
            let hit = permissions.iter().any(|permission| {
                let wanted = if self.case_sensitive_permissions {
                    permission.clone()
                } else {
                    permission.to_lowercase()
                };
                subject_permissions.contains(&wanted)
            });
            if !hit {
                return false;
            }
        }

        if let Some(resources) = &rule.resources {
            if !Self::glob_matches(resources, resource) {
                return false;
            }
        }

        if let Some(actions) = &rule.actions {
            if !Self::glob_matches(actions, action) {
                return false;
            }
        }

        if let Some(custom) = &rule.custom {
            for (key, expected) in custom {
                if subject.attributes.get(key) != Some(expected) {
                    return false;
                }
            }
        }

        true
    }

    fn default_decision(&self) -> PolicyDecision {
        PolicyDecision {
            allowed: self.default_allow,
            reason: format!(
                "No policy matched, using default decision: {}",
                if self.default_allow { "allow" } else { "deny" }
            ),
            policy_id: "default".to_string(),
            applied_policies: Vec::new(),
        }
    }
}

#[async_trait]
impl PolicyEngine for SimplePolicyEngine {
    async fn evaluate(
        &self,
        resource: &str,
        action: &str,
        subject: &SubjectContext,
    ) -> Result<PolicyDecision> {
        let rules = self.rules.read().expect("policy rules lock poisoned");
        for (index, rule) in rules.iter().enumerate() {
            if self.rule_matches(rule, resource, action, subject) {
                return Ok(PolicyDecision {
                    allowed: rule.effect == "allow",
                    reason: rule
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("Policy {} matched", index)),
                    policy_id: rule
                        .id
                        .clone()
                        .unwrap_or_else(|| index.to_string()),
                    applied_policies: vec![rule.clone()],
                });
            }
        }
        Ok(self.default_decision())
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

    async fn register_policy(&self, rule: PolicyRule) -> Result<String> {
        Self::validate_rule(&rule)?;
        let mut rules = self.rules.write().expect("policy rules lock poisoned");
        rules.push(rule);
        Ok((rules.len() - 1).to_string())
    }
}
