//! Configuration for the authentication framework.
//!
//! Configuration is a nested map surfaced externally as YAML or JSON and
//! deserialized into the structures below. String values support
//! environment interpolation (`${NAME}`, `${NAME:-default}`,
//! `${NAME:?error message}`), resolved at load time; a missing required
//! reference is a configuration error and the process should not start.

use crate::error::{Error, Result};
use crate::registry::ProviderRegistry;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

static ENV_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([-?])((?:[^}])*))?\}")
        .expect("env reference pattern is valid")
});

static DURATION_GRAMMAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)([smhd])$").expect("duration pattern is valid"));

/// Root configuration for the framework.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub development: DevelopmentConfig,
}

fn default_true() -> bool {
    true
}

/// Provider selection. The five core providers are required; the token
/// service and rate limiter are optional extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub credential: ProviderConfig,
    pub session: ProviderConfig,
    pub user: ProviderConfig,
    pub audit: ProviderConfig,
    pub policy: ProviderConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<ProviderConfig>,
}

/// One provider slot: a registered provider name plus its private config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name registered in the [`ProviderRegistry`], e.g. `memory`
    pub provider: String,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub password_security: PasswordSecurityConfig,
    #[serde(default)]
    pub session_security: SessionSecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordSecurityConfig {
    #[serde(default = "default_min_password_length")]
    pub min_length: u32,
    #[serde(default)]
    pub require_complexity: bool,
}

fn default_min_password_length() -> u32 {
    8
}

impl Default for PasswordSecurityConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_password_length(),
            require_complexity: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSecurityConfig {
    /// Sweep cadence in `N[s|m|h|d]` form
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,
    #[serde(default)]
    pub require_ip_validation: bool,
    #[serde(default)]
    pub require_user_agent_validation: bool,
}

fn default_cleanup_interval() -> String {
    "5m".to_string()
}

impl Default for SessionSecurityConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: default_cleanup_interval(),
            require_ip_validation: false,
            require_user_agent_validation: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevelopmentConfig {
    #[serde(default)]
    pub mock_providers: bool,
    #[serde(default)]
    pub bypass_mfa: bool,
    #[serde(default)]
    pub debug_audit: bool,
    #[serde(default)]
    pub test_users: Vec<TestUser>,
}

/// A user seeded at bootstrap in development setups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl AuthConfig {
    /// Load from a YAML or JSON file, interpolating environment references.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;
        let mut value: serde_json::Value = settings.try_deserialize()?;
        interpolate_env(&mut value)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Build from an in-memory JSON value, interpolating environment
    /// references.
    pub fn from_value(mut value: serde_json::Value) -> Result<Self> {
        interpolate_env(&mut value)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Validate against a populated registry: provider names must be
    /// registered, field constraints must hold.
    pub fn validate(&self, registry: &ProviderRegistry) -> Result<()> {
        let slots: [(&str, &ProviderConfig, fn(&ProviderRegistry, &str) -> bool); 5] = [
            ("credential", &self.providers.credential, |r, n| {
                r.has_credential(n)
            }),
            ("session", &self.providers.session, |r, n| r.has_session(n)),
            ("user", &self.providers.user, |r, n| r.has_user(n)),
            ("audit", &self.providers.audit, |r, n| r.has_audit(n)),
            ("policy", &self.providers.policy, |r, n| r.has_policy(n)),
        ];
        for (slot, provider, known) in slots {
            if !known(registry, &provider.provider) {
                return Err(Error::configuration(format!(
                    "Unknown {} provider '{}'",
                    slot, provider.provider
                )));
            }
        }
        if let Some(token) = &self.providers.token {
            if !registry.has_token(&token.provider) {
                return Err(Error::configuration(format!(
                    "Unknown token provider '{}'",
                    token.provider
                )));
            }
        }
        if let Some(limiter) = &self.providers.rate_limiter {
            if !registry.has_rate_limiter(&limiter.provider) {
                return Err(Error::configuration(format!(
                    "Unknown rate limiter provider '{}'",
                    limiter.provider
                )));
            }
        }

        if self.security.password_security.min_length < 1 {
            return Err(Error::configuration(
                "password_security.min_length must be at least 1",
            ));
        }

        parse_duration(&self.security.session_security.cleanup_interval)?;

        // Audit encryption requires a key alongside the flag
        if let Some(map) = self.providers.audit.config.as_object() {
            let enabled = map
                .get("encryption_enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let has_key = map
                .get("encryption_key")
                .and_then(|v| v.as_str())
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            if enabled && !has_key {
                return Err(Error::configuration(
                    "audit.encryption_enabled requires audit.encryption_key",
                ));
            }
        }

        Ok(())
    }
}

/// Parse a `N[s|m|h|d]` duration string.
pub fn parse_duration(value: &str) -> Result<chrono::Duration> {
    let captures = DURATION_GRAMMAR.captures(value).ok_or_else(|| {
        Error::configuration(format!(
            "Invalid duration '{}': expected N[s|m|h|d]",
            value
        ))
    })?;
    let amount: i64 = captures[1]
        .parse()
        .map_err(|_| Error::configuration(format!("Duration '{}' is out of range", value)))?;
    let duration = match &captures[2] {
        "s" => chrono::Duration::seconds(amount),
        "m" => chrono::Duration::minutes(amount),
        "h" => chrono::Duration::hours(amount),
        "d" => chrono::Duration::days(amount),
        _ => unreachable!("pattern restricts the unit"),
    };
    Ok(duration)
}

/// Resolve `${NAME}`-style references in every string of the tree.
pub fn interpolate_env(value: &mut serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::String(s) => {
            *s = interpolate_str(s)?;
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for item in items {
                interpolate_env(item)?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_env(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn interpolate_str(input: &str) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut last_end = 0;
    for captures in ENV_REFERENCE.captures_iter(input) {
        let whole = captures.get(0).expect("capture 0 always present");
        output.push_str(&input[last_end..whole.start()]);
        last_end = whole.end();

        let name = &captures[1];
        let resolved = std::env::var(name).ok();
        match (resolved, captures.get(2).map(|m| m.as_str())) {
            (Some(value), _) => output.push_str(&value),
            (None, Some("-")) => {
                output.push_str(captures.get(3).map(|m| m.as_str()).unwrap_or(""))
            }
            (None, Some("?")) => {
                let message = captures
                    .get(3)
                    .map(|m| m.as_str())
                    .filter(|s| !s.is_empty())
                    .unwrap_or("required environment variable is not set");
                return Err(Error::configuration(format!("{}: {}", name, message)));
            }
            (None, _) => {
                return Err(Error::configuration(format!(
                    "Environment variable '{}' is not set",
                    name
                )))
            }
        }
    }
    output.push_str(&input[last_end..]);
    Ok(output)
}
