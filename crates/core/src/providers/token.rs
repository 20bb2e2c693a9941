use crate::error::Result;
use crate::types::{Token, TokenType};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;

/// Issuance and validation of signed tokens.
///
/// The signing algorithm is fixed at service construction; validation never
/// honors the algorithm named in a presented token's header. Validation
/// runs under a minimum-time budget so decode failures and signature
/// failures are not timing-distinguishable.
#[async_trait]
pub trait TokenService: Send + Sync {
    /// Generate a token. The payload is sanitized of sensitive fields and
    /// must identify the subject via `user_id` (aliased to `sub` when
    /// absent).
    async fn generate_token(
        &self,
        payload: HashMap<String, serde_json::Value>,
        token_type: TokenType,
        expires_in: Option<Duration>,
    ) -> Result<Token>;

    /// Decode and validate a token with the configured algorithm,
    /// enforcing signature, expiry, and issuer/audience when configured.
    async fn validate_token(&self, token_value: &str) -> Result<Token>;

    /// Exchange a refresh token for a new access token. The presented
    /// token's type must be `refresh`.
    async fn refresh_token(&self, refresh_token: &str) -> Result<Token>;

    /// Revoke a token.
    ///
    /// Tokens are stateless; without a backing revocation list this
    /// validates the token and reports success without making it unusable.
    /// Callers relying on immediate revocation must deploy a backed
    /// implementation.
    async fn revoke_token(&self, token_value: &str) -> Result<bool>;

    /// Revoke every token of a user, optionally filtered by type.
    /// Returns the revocation count (zero for purely stateless services).
    async fn revoke_user_tokens(&self, user_id: &str, token_type: Option<TokenType>)
        -> Result<u64>;

    /// Drop expired entries from any backing revocation state.
    async fn cleanup_expired_tokens(&self) -> Result<u64>;
}
