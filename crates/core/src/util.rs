use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use std::future::Future;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::time::Instant;

/// Run an operation under a minimum wall-clock budget.
///
/// The result is withheld until at least `minimum` has elapsed, so the
/// operation's internal branching (lookup miss, expired artifact,
/// fingerprint mismatch, signature failure) is not observable through
/// response timing. Operations slower than the budget are unaffected.
pub async fn with_minimum_duration<T, Fut>(minimum: Duration, op: Fut) -> T
where
    Fut: Future<Output = T>,
{
    let started = Instant::now();
    let result = op.await;
    let elapsed = started.elapsed();
    if elapsed < minimum {
        tokio::time::sleep(minimum - elapsed).await;
    }
    result
}

/// Constant-time equality for secret material such as opaque tokens.
pub fn secure_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// URL-safe random identifier with the given entropy.
///
/// 16 bytes give the 128-bit minimum required for session IDs; 32 bytes
/// give the 256 bits used for opaque tokens.
pub fn generate_secure_id(num_bytes: usize) -> String {
    let mut bytes = vec![0u8; num_bytes];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(&bytes)
}
