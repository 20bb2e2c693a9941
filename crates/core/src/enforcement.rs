//! Runtime enforcement of declared audit pipelines.
//!
//! Every audited provider method wraps its body in [`enforce`], which reads
//! the journal watermark, runs the operation, and validates the
//! post-watermark event slice against the method's declared pipeline. A
//! violation fails the call even when the operation itself succeeded, and
//! replaces the operation's own error when it failed: audit-integrity
//! errors are primary.

use crate::error::{Error, ErrorCode, Result};
use crate::journal::AuditJournal;
use crate::pipeline::Pipeline;
use once_cell::sync::Lazy;
use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;
use tracing::error;

/// Per-method pipeline table declared by a provider trait.
pub type ContractMap = HashMap<&'static str, Pipeline>;

/// Requirement overrides registered for a concrete provider type. A
/// concrete method's override takes precedence over the trait contract,
/// mirroring a most-derived-first resolution.
static OVERRIDES: Lazy<RwLock<HashMap<(TypeId, &'static str), Pipeline>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Resolution cache: many reads, a single write on first lookup of each
/// (provider type, method) pair.
static RESOLUTION_CACHE: Lazy<RwLock<HashMap<(TypeId, &'static str), Option<Pipeline>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a requirement override for a concrete provider type's method.
pub fn register_override<P: 'static + ?Sized>(method: &'static str, pipeline: Pipeline) {
    let key = (TypeId::of::<P>(), method);
    OVERRIDES
        .write()
        .expect("override table lock poisoned")
        .insert(key, pipeline);
    RESOLUTION_CACHE
        .write()
        .expect("resolution cache lock poisoned")
        .remove(&key);
}

/// Resolve the pipeline requirement for a method on provider type `P`,
/// consulting the concrete override first and the trait contract second.
pub fn resolve<P: 'static + ?Sized>(
    contract: &ContractMap,
    method: &'static str,
) -> Option<Pipeline> {
    let key = (TypeId::of::<P>(), method);

    if let Some(cached) = RESOLUTION_CACHE
        .read()
        .expect("resolution cache lock poisoned")
        .get(&key)
    {
        return cached.clone();
    }

    let resolved = OVERRIDES
        .read()
        .expect("override table lock poisoned")
        .get(&key)
        .cloned()
        .or_else(|| contract.get(method).cloned());

    RESOLUTION_CACHE
        .write()
        .expect("resolution cache lock poisoned")
        .insert(key, resolved.clone());
    resolved
}

/// Error raised when a call's emitted events do not satisfy its declared
/// pipeline. Carries the method name, the expected pipeline rendering and
/// the observed event list.
pub fn audit_requirement_error(
    method: &str,
    pipeline: &Pipeline,
    observed: &[crate::events::EventKind],
    suppressed: Option<&Error>,
) -> Error {
    let observed_values: Vec<&str> = observed.iter().map(|k| k.as_str()).collect();
    let mut err = Error::new(
        ErrorCode::AuditRequirement,
        format!(
            "Audit pipeline requirement not satisfied for '{}': expected '{}', observed [{}]",
            method,
            pipeline,
            observed_values.join(", ")
        ),
    )
    .with_detail("method", serde_json::json!(method))
    .with_detail("expected", serde_json::json!(pipeline.to_string()))
    .with_detail("observed", serde_json::json!(observed_values));
    if let Some(original) = suppressed {
        err = err.with_detail("suppressed_error", serde_json::json!(original.to_string()));
    }
    err
}

/// Scope guard for the watermark protocol.
///
/// Created before the wrapped operation runs; [`AuditScope::finish`]
/// validates the emitted slice and settles the result. If the operation is
/// cancelled and the scope is dropped unfinished, the partial slice is
/// still validated and violations are logged — the audit record is a
/// security contract, not a performance optimization.
pub struct AuditScope<'a> {
    method: &'static str,
    requirement: Option<Pipeline>,
    journal: &'a AuditJournal,
    start: usize,
    finished: bool,
}

impl<'a> AuditScope<'a> {
    pub fn new(
        method: &'static str,
        requirement: Option<Pipeline>,
        journal: &'a AuditJournal,
    ) -> Self {
        let start = journal.last_position();
        Self {
            method,
            requirement,
            journal,
            start,
            finished: false,
        }
    }

    /// Validate the post-watermark slice and settle the wrapped result.
    pub fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        self.finished = true;
        let Some(requirement) = self.requirement.take() else {
            return result;
        };
        let observed = self.journal.events_after(self.start);
        match requirement.validate(&observed) {
            Ok(()) => result,
            Err(_violation) => {
                let suppressed = result.err();
                Err(audit_requirement_error(
                    self.method,
                    &requirement,
                    &observed,
                    suppressed.as_ref(),
                ))
            }
        }
    }
}

impl Drop for AuditScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Cancelled mid-call. A detached drop cannot raise, so the partial
        // slice is validated here and violations surface in the log.
        if let Some(requirement) = &self.requirement {
            let observed = self.journal.events_after(self.start);
            if requirement.validate(&observed).is_err() {
                let observed_values: Vec<&str> = observed.iter().map(|k| k.as_str()).collect();
                error!(
                    method = self.method,
                    expected = %requirement,
                    observed = ?observed_values,
                    "Audit pipeline requirement violated by cancelled call"
                );
            }
        }
    }
}

/// Wrap an audited provider method.
///
/// Resolves the pipeline for `(P, method)` from the trait contract and any
/// concrete override, records the journal watermark, runs `op`, and
/// validates the emitted slice. On violation the call fails with an
/// audit-requirement error regardless of `op`'s own outcome; on success
/// `op`'s result passes through untouched.
pub async fn enforce<P, T, Fut>(
    contract: &ContractMap,
    method: &'static str,
    journal: &AuditJournal,
    op: Fut,
) -> Result<T>
where
    P: 'static + ?Sized,
    Fut: Future<Output = Result<T>>,
{
    let requirement = resolve::<P>(contract, method);
    let scope = AuditScope::new(method, requirement, journal);
    let result = op.await;
    scope.finish(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use once_cell::sync::Lazy;

    struct WellBehaved;
    struct Misbehaving;
    struct Overridden;

    static TEST_CONTRACT: Lazy<ContractMap> = Lazy::new(|| {
        let mut table = ContractMap::new();
        table.insert(
            "operate",
            Pipeline::event(EventKind::AuthAttempt).then(
                Pipeline::event(EventKind::AuthSuccess).or(Pipeline::event(EventKind::AuthFailure)),
            ),
        );
        table
    });

    #[tokio::test]
    async fn test_satisfied_pipeline_passes_result_through() {
        let journal = AuditJournal::detached();
        let result = enforce::<WellBehaved, _, _>(&TEST_CONTRACT, "operate", &journal, async {
            journal.emit(EventKind::AuthAttempt).await?;
            journal.emit(EventKind::AuthSuccess).await?;
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_violation_fails_successful_call() {
        let journal = AuditJournal::detached();
        let result = enforce::<Misbehaving, _, _>(&TEST_CONTRACT, "operate", &journal, async {
            // Emits nothing despite the declared pipeline
            Ok(42)
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::AuditRequirement);
        assert_eq!(err.details.get("method"), Some(&serde_json::json!("operate")));
    }

    #[tokio::test]
    async fn test_violation_replaces_operation_error() {
        let journal = AuditJournal::detached();
        let result: Result<()> =
            enforce::<Misbehaving, _, _>(&TEST_CONTRACT, "operate", &journal, async {
                Err(Error::invalid_credentials("wrong password"))
            })
            .await;
        let err = result.unwrap_err();
        // The audit failure is primary; the original error is preserved in
        // the details map only.
        assert_eq!(err.code, ErrorCode::AuditRequirement);
        assert!(err
            .details
            .get("suppressed_error")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("wrong password"));
    }

    #[tokio::test]
    async fn test_satisfied_pipeline_reraises_operation_error() {
        let journal = AuditJournal::detached();
        let result: Result<()> =
            enforce::<WellBehaved, _, _>(&TEST_CONTRACT, "operate", &journal, async {
                journal.emit(EventKind::AuthAttempt).await?;
                journal.emit(EventKind::AuthFailure).await?;
                Err(Error::invalid_credentials("wrong password"))
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_watermark_ignores_prior_events() {
        let journal = AuditJournal::detached();
        // Events recorded before the wrapped call must not satisfy it.
        journal.emit(EventKind::AuthAttempt).await.unwrap();
        journal.emit(EventKind::AuthSuccess).await.unwrap();

        let result = enforce::<WellBehaved, _, _>(&TEST_CONTRACT, "operate", &journal, async {
            Ok(())
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_method_is_unconstrained() {
        let journal = AuditJournal::detached();
        let result =
            enforce::<WellBehaved, _, _>(&TEST_CONTRACT, "unaudited", &journal, async { Ok(7) })
                .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_override_takes_precedence_over_contract() {
        register_override::<Overridden>(
            "operate",
            Pipeline::event(EventKind::SecurityAnomaly),
        );
        let journal = AuditJournal::detached();

        // The trait contract alone would fail this emission; the override
        // accepts it.
        let result = enforce::<Overridden, _, _>(&TEST_CONTRACT, "operate", &journal, async {
            journal.emit(EventKind::SecurityAnomaly).await?;
            Ok(())
        })
        .await;
        assert!(result.is_ok());

        // Another type still resolves to the trait contract.
        let journal = AuditJournal::detached();
        let result = enforce::<WellBehaved, _, _>(&TEST_CONTRACT, "operate", &journal, async {
            journal.emit(EventKind::SecurityAnomaly).await?;
            Ok(())
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resolution_is_cached() {
        let _ = resolve::<WellBehaved>(&TEST_CONTRACT, "operate");
        let key = (TypeId::of::<WellBehaved>(), "operate");
        assert!(RESOLUTION_CACHE.read().unwrap().contains_key(&key));
    }
}
