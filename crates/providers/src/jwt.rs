use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;
use warden_core::error::{Error, Result};
use warden_core::providers::token::TokenService;
use warden_core::types::{is_sensitive_key, Token, TokenType};
use warden_core::util::with_minimum_duration;

/// Claims managed by the service; everything else in a token is caller
/// payload.
const RESERVED_CLAIMS: [&str; 7] = ["jti", "iat", "exp", "nbf", "iss", "aud", "type"];

/// Configuration for the JWT token service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JwtServiceConfig {
    /// Shared secret for the HS family of algorithms
    pub secret_key: Option<String>,
    /// PEM-encoded private key for the RS/ES families
    pub private_key_pem: Option<String>,
    /// PEM-encoded public key for the RS/ES families
    pub public_key_pem: Option<String>,
    /// One of HS256/384/512, RS256/384/512, ES256/384
    pub algorithm: String,
    pub access_token_expiry_secs: i64,
    pub refresh_token_expiry_secs: i64,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    /// Revoke the presented refresh token when exchanging it
    pub rotate_refresh_tokens: bool,
    /// Track revoked token ids in memory, giving `revoke_token` teeth
    pub track_revocations: bool,
    /// Minimum wall-clock time for validation
    pub min_validation_time_ms: u64,
}

impl Default for JwtServiceConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            private_key_pem: None,
            public_key_pem: None,
            algorithm: "HS256".to_string(),
            access_token_expiry_secs: 3600,
            refresh_token_expiry_secs: 86_400,
            issuer: None,
            audience: None,
            rotate_refresh_tokens: false,
            track_revocations: false,
            min_validation_time_ms: 100,
        }
    }
}

/// JWT-backed token service.
///
/// The algorithm is fixed at construction and used for every decode; a
/// presented token's own `alg` header is never honored, which closes the
/// algorithm-confusion hole.
pub struct JwtTokenService {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    /// Revoked token ids and their expiry, kept only when
    /// `track_revocations` is on
    revoked: DashMap<String, DateTime<Utc>>,
    config: JwtServiceConfig,
}

impl std::fmt::Debug for JwtTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtTokenService")
            .field("algorithm", &self.algorithm)
            .field("config", &self.config)
            .finish()
    }
}

impl JwtTokenService {
    pub fn new(config: JwtServiceConfig) -> Result<Self> {
        let algorithm = Algorithm::from_str(&config.algorithm)
            .map_err(|_| Error::configuration(format!("Unsupported JWT algorithm: {}", config.algorithm)))?;

        let (encoding_key, decoding_key) = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = config.secret_key.as_deref().ok_or_else(|| {
                    Error::configuration("HS algorithms require 'secret_key'")
                })?;
                if secret.len() < 32 {
                    return Err(Error::configuration(
                        "secret_key must be at least 32 bytes",
                    ));
                }
                (
                    EncodingKey::from_secret(secret.as_bytes()),
                    DecodingKey::from_secret(secret.as_bytes()),
                )
            }
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let private = config.private_key_pem.as_deref().ok_or_else(|| {
                    Error::configuration("RS algorithms require 'private_key_pem'")
                })?;
                let public = config.public_key_pem.as_deref().ok_or_else(|| {
                    Error::configuration("RS algorithms require 'public_key_pem'")
                })?;
                (
                    EncodingKey::from_rsa_pem(private.as_bytes())
                        .map_err(|e| Error::configuration(format!("Invalid RSA private key: {}", e)))?,
                    DecodingKey::from_rsa_pem(public.as_bytes())
                        .map_err(|e| Error::configuration(format!("Invalid RSA public key: {}", e)))?,
                )
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                let private = config.private_key_pem.as_deref().ok_or_else(|| {
                    Error::configuration("ES algorithms require 'private_key_pem'")
                })?;
                let public = config.public_key_pem.as_deref().ok_or_else(|| {
                    Error::configuration("ES algorithms require 'public_key_pem'")
                })?;
                (
                    EncodingKey::from_ec_pem(private.as_bytes())
                        .map_err(|e| Error::configuration(format!("Invalid EC private key: {}", e)))?,
                    DecodingKey::from_ec_pem(public.as_bytes())
                        .map_err(|e| Error::configuration(format!("Invalid EC public key: {}", e)))?,
                )
            }
            other => {
                return Err(Error::configuration(format!(
                    "Unsupported JWT algorithm: {:?}",
                    other
                )))
            }
        };

        Ok(Self {
            algorithm,
            encoding_key,
            decoding_key,
            revoked: DashMap::new(),
            config,
        })
    }

    pub fn from_config(value: &serde_json::Value) -> Result<Self> {
        let config: JwtServiceConfig = serde_json::from_value(value.clone())?;
        Self::new(config)
    }

    fn expiry_for(&self, token_type: TokenType, requested: Option<Duration>) -> Duration {
        requested.unwrap_or_else(|| match token_type {
            TokenType::Refresh => Duration::seconds(self.config.refresh_token_expiry_secs),
            _ => Duration::seconds(self.config.access_token_expiry_secs),
        })
    }

    /// Strip sensitive fields and reserved claims from a caller payload.
    fn sanitize_payload(
        payload: HashMap<String, serde_json::Value>,
    ) -> HashMap<String, serde_json::Value> {
        payload
            .into_iter()
            .filter(|(key, _)| !is_sensitive_key(key) && !RESERVED_CLAIMS.contains(&key.as_str()))
            .collect()
    }

    fn decode_claims(&self, token_value: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
        // Exactly the configured algorithm; the token's own header is not
        // consulted for algorithm selection.
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_exp = true;
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.config.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        let decoded = decode::<serde_json::Map<String, serde_json::Value>>(
            token_value,
            &self.decoding_key,
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                Error::token_expired("Token has expired")
            }
            _ => Error::token_invalid(format!("Invalid token: {}", e)),
        })?;
        Ok(decoded.claims)
    }

    fn token_from_claims(
        &self,
        token_value: &str,
        claims: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Token> {
        let token_id = claims
            .get("jti")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::token_invalid("Token missing required 'jti' claim"))?
            .to_string();

        if self.config.track_revocations && self.revoked.contains_key(&token_id) {
            return Err(Error::token_invalid("Token has been revoked"));
        }

        let issued_at = claims.get("iat").and_then(|v| v.as_i64()).unwrap_or(0);
        let expires_at = claims
            .get("exp")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::token_invalid("Token missing required 'exp' claim"))?;
        let expires_at = Utc
            .timestamp_opt(expires_at, 0)
            .single()
            .ok_or_else(|| Error::token_invalid("Token 'exp' claim is out of range"))?;

        // Strict boundary: a token whose expiry equals the current second
        // is already expired.
        if Utc::now() >= expires_at {
            return Err(Error::token_expired("Token has expired"));
        }

        let token_type: TokenType = claims
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("access")
            .parse()?;

        let user_id = claims
            .get("user_id")
            .or_else(|| claims.get("sub"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let payload: HashMap<String, serde_json::Value> = claims
            .into_iter()
            .filter(|(key, _)| !RESERVED_CLAIMS.contains(&key.as_str()))
            .collect();

        Ok(Token {
            token_id,
            token_value: token_value.to_string(),
            token_type,
            user_id,
            payload,
            created_at: Utc
                .timestamp_opt(issued_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
            expires_at,
            is_active: true,
        })
    }
}

#[async_trait]
impl TokenService for JwtTokenService {
    async fn generate_token(
        &self,
        payload: HashMap<String, serde_json::Value>,
        token_type: TokenType,
        expires_in: Option<Duration>,
    ) -> Result<Token> {
        let mut payload = Self::sanitize_payload(payload);

        // The subject is mandatory; mirror user_id into sub when absent.
        let user_id = payload
            .get("user_id")
            .or_else(|| payload.get("sub"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::validation("Token payload requires 'user_id'"))?;
        if !payload.contains_key("sub") {
            payload.insert("sub".to_string(), serde_json::json!(user_id));
        }

        let token_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let expires_at = created_at + self.expiry_for(token_type, expires_in);

        let mut claims = serde_json::Map::new();
        claims.insert("jti".to_string(), serde_json::json!(token_id));
        claims.insert("iat".to_string(), serde_json::json!(created_at.timestamp()));
        claims.insert("exp".to_string(), serde_json::json!(expires_at.timestamp()));
        claims.insert("type".to_string(), serde_json::json!(token_type.as_str()));
        if let Some(issuer) = &self.config.issuer {
            claims.insert("iss".to_string(), serde_json::json!(issuer));
        }
        if let Some(audience) = &self.config.audience {
            claims.insert("aud".to_string(), serde_json::json!(audience));
        }
        for (key, value) in &payload {
            claims.insert(key.clone(), value.clone());
        }

        let header = Header::new(self.algorithm);
        let token_value = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| Error::internal(format!("Failed to sign token: {}", e)))?;

        debug!(token_type = %token_type, user_id = %user_id, "Token generated");
        Ok(Token {
            token_id,
            token_value,
            token_type,
            user_id: Some(user_id),
            payload,
            created_at,
            expires_at,
            is_active: true,
        })
    }

    async fn validate_token(&self, token_value: &str) -> Result<Token> {
        let budget = std::time::Duration::from_millis(self.config.min_validation_time_ms);
        with_minimum_duration(budget, async {
            let claims = self.decode_claims(token_value)?;
            self.token_from_claims(token_value, claims)
        })
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<Token> {
        let presented = self.validate_token(refresh_token).await?;
        if presented.token_type != TokenType::Refresh {
            return Err(Error::token_invalid("Token is not a refresh token"));
        }

        let new_access = self
            .generate_token(presented.payload.clone(), TokenType::Access, None)
            .await?;

        if self.config.rotate_refresh_tokens && self.config.track_revocations {
            self.revoked
                .insert(presented.token_id.clone(), presented.expires_at);
            debug!(token_id = %presented.token_id, "Refresh token rotated out");
        }
        Ok(new_access)
    }

    async fn revoke_token(&self, token_value: &str) -> Result<bool> {
        match self.validate_token(token_value).await {
            Ok(token) => {
                if self.config.track_revocations {
                    self.revoked.insert(token.token_id, token.expires_at);
                }
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn revoke_user_tokens(
        &self,
        _user_id: &str,
        _token_type: Option<TokenType>,
    ) -> Result<u64> {
        // Stateless tokens carry no user index to revoke against.
        Ok(0)
    }

    async fn cleanup_expired_tokens(&self) -> Result<u64> {
        let now = Utc::now();
        let stale: Vec<String> = self
            .revoked
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for token_id in stale {
            if self.revoked.remove(&token_id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    fn config() -> JwtServiceConfig {
        JwtServiceConfig {
            secret_key: Some("a-test-secret-key-of-sufficient-length".to_string()),
            min_validation_time_ms: 0,
            ..Default::default()
        }
    }

    fn service() -> JwtTokenService {
        JwtTokenService::new(config()).unwrap()
    }

    fn payload(user: &str) -> HashMap<String, serde_json::Value> {
        HashMap::from([
            ("user_id".to_string(), serde_json::json!(user)),
            ("plan".to_string(), serde_json::json!("pro")),
        ])
    }

    #[tokio::test]
    async fn test_generate_validate_round_trip() {
        let service = service();
        let token = service
            .generate_token(payload("alice"), TokenType::Access, None)
            .await
            .unwrap();
        assert_eq!(token.token_value.matches('.').count(), 2);

        let validated = service.validate_token(&token.token_value).await.unwrap();
        assert_eq!(validated.token_id, token.token_id);
        assert_eq!(validated.user_id.as_deref(), Some("alice"));
        assert_eq!(validated.token_type, TokenType::Access);
        // Caller payload survives, minus reserved claims
        assert_eq!(validated.payload.get("plan"), Some(&serde_json::json!("pro")));
        assert!(!validated.payload.contains_key("exp"));
        assert!(!validated.payload.contains_key("jti"));
    }

    #[tokio::test]
    async fn test_sensitive_payload_fields_are_stripped() {
        let service = service();
        let mut p = payload("alice");
        p.insert("password".to_string(), serde_json::json!("hunter2"));
        p.insert("api_key".to_string(), serde_json::json!("sk-123"));

        let token = service
            .generate_token(p, TokenType::Access, None)
            .await
            .unwrap();
        assert!(!token.payload.contains_key("password"));
        assert!(!token.payload.contains_key("api_key"));
        assert!(!token.token_value.contains("hunter2"));

        let validated = service.validate_token(&token.token_value).await.unwrap();
        assert!(!validated.payload.contains_key("password"));
    }

    #[tokio::test]
    async fn test_payload_requires_user_id() {
        let service = service();
        let err = service
            .generate_token(HashMap::new(), TokenType::Access, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, warden_core::ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let service = service();
        let token = service
            .generate_token(payload("alice"), TokenType::Access, Some(Duration::seconds(-10)))
            .await
            .unwrap();
        let err = service.validate_token(&token.token_value).await.unwrap_err();
        assert_eq!(err.code, warden_core::ErrorCode::TokenExpired);
    }

    #[tokio::test]
    async fn test_token_expiring_now_is_already_expired() {
        // Validity is strict: now >= exp means expired, so a token whose
        // expiry equals its issue instant never validates.
        let service = service();
        let token = service
            .generate_token(payload("alice"), TokenType::Access, Some(Duration::zero()))
            .await
            .unwrap();
        let err = service.validate_token(&token.token_value).await.unwrap_err();
        assert_eq!(err.code, warden_core::ErrorCode::TokenExpired);
    }

    #[tokio::test]
    async fn test_tampered_token_is_rejected() {
        let service = service();
        let token = service
            .generate_token(payload("alice"), TokenType::Access, None)
            .await
            .unwrap();
        let mut tampered = token.token_value.clone();
        tampered.pop();
        tampered.push('x');
        let err = service.validate_token(&tampered).await.unwrap_err();
        assert_eq!(err.code, warden_core::ErrorCode::TokenInvalid);
    }

    #[tokio::test]
    async fn test_algorithm_confusion_attack_rejected() {
        let service = service();
        // Forge a token claiming alg "none" with a plausible payload
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let exp = (Utc::now() + Duration::hours(1)).timestamp();
        let claims = format!(
            r#"{{"jti":"forged","sub":"alice","user_id":"alice","type":"access","iat":0,"exp":{}}}"#,
            exp
        );
        let body = URL_SAFE_NO_PAD.encode(claims.as_bytes());
        let forged = format!("{}.{}.", header, body);

        let err = service.validate_token(&forged).await.unwrap_err();
        assert_eq!(err.code, warden_core::ErrorCode::TokenInvalid);
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let service = service();
        let other = JwtTokenService::new(JwtServiceConfig {
            secret_key: Some("a-different-secret-key-of-enough-length".to_string()),
            ..config()
        })
        .unwrap();
        let token = other
            .generate_token(payload("alice"), TokenType::Access, None)
            .await
            .unwrap();
        assert!(service.validate_token(&token.token_value).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_flow() {
        let service = service();
        let refresh = service
            .generate_token(payload("alice"), TokenType::Refresh, None)
            .await
            .unwrap();

        let access = service.refresh_token(&refresh.token_value).await.unwrap();
        assert_eq!(access.token_type, TokenType::Access);
        assert_eq!(access.user_id.as_deref(), Some("alice"));
        assert_eq!(access.payload.get("plan"), Some(&serde_json::json!("pro")));
    }

    #[tokio::test]
    async fn test_refresh_rejects_access_token() {
        let service = service();
        let access = service
            .generate_token(payload("alice"), TokenType::Access, None)
            .await
            .unwrap();
        let err = service.refresh_token(&access.token_value).await.unwrap_err();
        assert_eq!(err.code, warden_core::ErrorCode::TokenInvalid);
    }

    #[tokio::test]
    async fn test_refresh_rotation_revokes_presented_token() {
        let service = JwtTokenService::new(JwtServiceConfig {
            rotate_refresh_tokens: true,
            track_revocations: true,
            ..config()
        })
        .unwrap();
        let refresh = service
            .generate_token(payload("alice"), TokenType::Refresh, None)
            .await
            .unwrap();

        service.refresh_token(&refresh.token_value).await.unwrap();
        // The rotated-out refresh token no longer validates
        let err = service.validate_token(&refresh.token_value).await.unwrap_err();
        assert_eq!(err.code, warden_core::ErrorCode::TokenInvalid);
    }

    #[tokio::test]
    async fn test_stateless_revoke_reports_validity() {
        let service = service();
        let token = service
            .generate_token(payload("alice"), TokenType::Access, None)
            .await
            .unwrap();
        assert!(service.revoke_token(&token.token_value).await.unwrap());
        assert!(!service.revoke_token("not-a-token").await.unwrap());
        // Without revocation tracking the token still validates
        assert!(service.validate_token(&token.token_value).await.is_ok());
    }

    #[tokio::test]
    async fn test_tracked_revocation_and_cleanup() {
        let service = JwtTokenService::new(JwtServiceConfig {
            track_revocations: true,
            ..config()
        })
        .unwrap();
        let token = service
            .generate_token(payload("alice"), TokenType::Access, None)
            .await
            .unwrap();
        assert!(service.revoke_token(&token.token_value).await.unwrap());
        assert!(service.validate_token(&token.token_value).await.is_err());

        // Entries whose expiry passed are swept
        service
            .revoked
            .insert("stale".to_string(), Utc::now() - Duration::hours(1));
        assert_eq!(service.cleanup_expired_tokens().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_issuer_and_audience_enforced() {
        let issuing = JwtTokenService::new(JwtServiceConfig {
            issuer: Some("warden".to_string()),
            audience: Some("api".to_string()),
            ..config()
        })
        .unwrap();
        let plain = service();

        let token = plain
            .generate_token(payload("alice"), TokenType::Access, None)
            .await
            .unwrap();
        // A token without the expected iss/aud fails the configured service
        assert!(issuing.validate_token(&token.token_value).await.is_err());

        let token = issuing
            .generate_token(payload("alice"), TokenType::Access, None)
            .await
            .unwrap();
        assert!(issuing.validate_token(&token.token_value).await.is_ok());
    }

    #[test]
    fn test_hs_requires_secret() {
        let err = JwtTokenService::new(JwtServiceConfig::default()).unwrap_err();
        assert_eq!(err.code, warden_core::ErrorCode::ConfigurationError);

        let err = JwtTokenService::new(JwtServiceConfig {
            secret_key: Some("short".to_string()),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.code, warden_core::ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let err = JwtTokenService::new(JwtServiceConfig {
            algorithm: "none".to_string(),
            secret_key: Some("a-test-secret-key-of-sufficient-length".to_string()),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.code, warden_core::ErrorCode::ConfigurationError);
    }
}
