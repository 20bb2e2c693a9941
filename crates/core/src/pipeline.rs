use crate::events::EventKind;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// One step of a sequence: a single required event or a group where any
/// one member suffices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    Single(EventKind),
    Group(BTreeSet<EventKind>),
}

impl Step {
    fn matches(&self, kind: EventKind) -> bool {
        match self {
            Step::Single(k) => *k == kind,
            Step::Group(set) => set.contains(&kind),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Single(k) => f.write_str(k.as_str()),
            Step::Group(set) => {
                let rendered: Vec<&str> = set.iter().map(|k| k.as_str()).collect();
                write!(f, "({})", rendered.join(" | "))
            }
        }
    }
}

/// Declarative audit pipeline: which event sequences satisfy a method's
/// contract.
///
/// Built compositionally with [`Pipeline::event`], [`Pipeline::or`] and
/// [`Pipeline::then`]:
///
/// ```
/// use warden_core::events::EventKind;
/// use warden_core::pipeline::Pipeline;
///
/// let requirement = Pipeline::event(EventKind::AuthAttempt)
///     .then(Pipeline::event(EventKind::AuthSuccess).or(Pipeline::event(EventKind::AuthFailure)));
/// assert!(requirement
///     .validate(&[EventKind::AuthAttempt, EventKind::CredentialVerify, EventKind::AuthSuccess])
///     .is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pipeline {
    /// Exactly this event must appear
    Single(EventKind),
    /// Any one of these events suffices
    Group(BTreeSet<EventKind>),
    /// These steps must appear in order; intervening events are permitted
    Sequence(Vec<Step>),
    /// At least one alternative sequence must match
    Alternatives(Vec<Vec<Step>>),
}

impl Pipeline {
    /// Requirement for a single event.
    pub fn event(kind: EventKind) -> Self {
        Pipeline::Single(kind)
    }

    /// Requirement satisfied by any one of the given events.
    /// Duplicates are collapsed.
    pub fn any_of(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Pipeline::Group(kinds.into_iter().collect())
    }

    /// Combine with OR semantics.
    ///
    /// Single/Group operands merge into a Group; Sequence operands combine
    /// into Alternatives; a scalar OR'd with a Sequence is promoted to a
    /// one-step alternative.
    pub fn or(self, other: Pipeline) -> Self {
        use Pipeline::*;
        match (self, other) {
            (Single(a), Single(b)) => {
                Pipeline::Group([a, b].into_iter().collect())
            }
            (Group(mut set), Single(k)) | (Single(k), Group(mut set)) => {
                set.insert(k);
                Group(set)
            }
            (Group(mut a), Group(b)) => {
                a.extend(b);
                Group(a)
            }
            (Alternatives(mut a), Alternatives(b)) => {
                a.extend(b);
                Alternatives(a)
            }
            (Alternatives(mut alts), other) => {
                alts.push(other.into_steps());
                Alternatives(alts)
            }
            (lhs, Alternatives(mut alts)) => {
                alts.insert(0, lhs.into_steps());
                Alternatives(alts)
            }
            (lhs @ Sequence(_), rhs) | (lhs, rhs @ Sequence(_)) => {
                Alternatives(vec![lhs.into_steps(), rhs.into_steps()])
            }
        }
    }

    /// Combine with sequencing semantics: `self` then `other`, in order.
    ///
    /// Sequences flatten; nesting never occurs. Sequencing an Alternatives
    /// term is a construction error.
    pub fn then(self, other: Pipeline) -> Self {
        let mut steps = self.into_steps();
        steps.extend(other.into_steps());
        Pipeline::Sequence(steps)
    }

    fn into_steps(self) -> Vec<Step> {
        match self {
            Pipeline::Single(k) => vec![Step::Single(k)],
            Pipeline::Group(set) => vec![Step::Group(set)],
            Pipeline::Sequence(steps) => steps,
            Pipeline::Alternatives(_) => {
                panic!("an Alternatives pipeline cannot be used as a sequence step")
            }
        }
    }

    /// Test whether the observed event kinds satisfy this pipeline.
    pub fn validate(&self, observed: &[EventKind]) -> Result<(), PipelineViolation> {
        match self {
            Pipeline::Single(k) => {
                if observed.contains(k) {
                    Ok(())
                } else {
                    Err(self.violation(Step::Single(*k), observed))
                }
            }
            Pipeline::Group(set) => {
                if observed.iter().any(|k| set.contains(k)) {
                    Ok(())
                } else {
                    Err(self.violation(Step::Group(set.clone()), observed))
                }
            }
            Pipeline::Sequence(steps) => match Self::scan_sequence(steps, observed) {
                Ok(()) => Ok(()),
                Err(idx) => Err(self.violation(steps[idx].clone(), observed)),
            },
            Pipeline::Alternatives(alts) => {
                if alts
                    .iter()
                    .any(|steps| Self::scan_sequence(steps, observed).is_ok())
                {
                    Ok(())
                } else {
                    // Report the first branch's first unsatisfied step
                    let first_failure = alts
                        .first()
                        .and_then(|steps| {
                            Self::scan_sequence(steps, observed)
                                .err()
                                .map(|idx| steps[idx].clone())
                        })
                        .unwrap_or(Step::Group(BTreeSet::new()));
                    Err(self.violation(first_failure, observed))
                }
            }
        }
    }

    /// Greedy forward scan: each step consumes the first matching event at
    /// or after the cursor. Returns the index of the first unsatisfied step.
    fn scan_sequence(steps: &[Step], observed: &[EventKind]) -> Result<(), usize> {
        let mut cursor = 0;
        for (idx, step) in steps.iter().enumerate() {
            let mut found = false;
            while cursor < observed.len() {
                let matched = step.matches(observed[cursor]);
                cursor += 1;
                if matched {
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(idx);
            }
        }
        Ok(())
    }

    fn violation(&self, failed_step: Step, observed: &[EventKind]) -> PipelineViolation {
        PipelineViolation {
            failed_step: failed_step.to_string(),
            observed: observed.iter().map(|k| k.as_str().to_string()).collect(),
            pipeline: self.to_string(),
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render_steps(steps: &[Step]) -> String {
            steps
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" >> ")
        }

        match self {
            Pipeline::Single(k) => f.write_str(k.as_str()),
            Pipeline::Group(set) => {
                let rendered: Vec<&str> = set.iter().map(|k| k.as_str()).collect();
                write!(f, "({})", rendered.join(" | "))
            }
            Pipeline::Sequence(steps) => f.write_str(&render_steps(steps)),
            Pipeline::Alternatives(alts) => {
                let rendered: Vec<String> = alts.iter().map(|s| render_steps(s)).collect();
                write!(f, "({})", rendered.join(" | "))
            }
        }
    }
}

/// Structured description of a pipeline validation failure: the first
/// unsatisfied step, the observed event values and the pretty-printed
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineViolation {
    pub failed_step: String,
    pub observed: Vec<String>,
    pub pipeline: String,
}

impl fmt::Display for PipelineViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "audit pipeline not satisfied: step '{}' of '{}' not found in observed events [{}]",
            self.failed_step,
            self.pipeline,
            self.observed.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EventKind::*;

    #[test]
    fn test_single_membership() {
        let p = Pipeline::event(CredentialVerify);
        assert!(p.validate(&[AuthAttempt, CredentialVerify]).is_ok());
        assert!(p.validate(&[AuthAttempt]).is_err());
        assert!(p.validate(&[]).is_err());
    }

    #[test]
    fn test_or_collapses_duplicates() {
        let p = Pipeline::event(AuthSuccess)
            .or(Pipeline::event(AuthFailure))
            .or(Pipeline::event(AuthSuccess));
        match &p {
            Pipeline::Group(set) => assert_eq!(set.len(), 2),
            other => panic!("expected group, got {:?}", other),
        }
        assert!(p.validate(&[AuthFailure]).is_ok());
        assert!(p.validate(&[SessionCreate]).is_err());
    }

    #[test]
    fn test_group_or_group_merges() {
        let a = Pipeline::any_of([AuthSuccess, AuthFailure]);
        let b = Pipeline::any_of([RateLimitExceeded, AuthFailure]);
        match a.or(b) {
            Pipeline::Group(set) => assert_eq!(set.len(), 3),
            other => panic!("expected group, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_in_order() {
        let p = Pipeline::event(AuthAttempt).then(Pipeline::event(AuthSuccess));
        assert!(p.validate(&[AuthAttempt, CredentialVerify, AuthSuccess]).is_ok());
        // Out of order fails
        assert!(p.validate(&[AuthSuccess, AuthAttempt]).is_err());
        // Missing step fails
        assert!(p.validate(&[AuthAttempt]).is_err());
    }

    #[test]
    fn test_sequence_flattens() {
        let left = Pipeline::event(AuthAttempt).then(Pipeline::event(CredentialVerify));
        let right = Pipeline::event(AuthSuccess).then(Pipeline::event(SessionCreate));
        match left.then(right) {
            Pipeline::Sequence(steps) => assert_eq!(steps.len(), 4),
            other => panic!("expected sequence, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_with_group_step() {
        let p = Pipeline::event(AuthAttempt)
            .then(Pipeline::event(AuthSuccess).or(Pipeline::event(AuthFailure)));
        assert!(p.validate(&[AuthAttempt, AuthFailure]).is_ok());
        assert!(p.validate(&[AuthAttempt, AuthSuccess]).is_ok());
        assert!(p.validate(&[AuthAttempt, SessionCreate]).is_err());
    }

    #[test]
    fn test_alternatives_any_branch() {
        let happy = Pipeline::event(AuthAttempt)
            .then(Pipeline::event(AuthSuccess))
            .then(Pipeline::event(SessionCreate));
        let failure = Pipeline::event(AuthAttempt).then(Pipeline::event(AuthFailure));
        let p = happy.or(failure);

        assert!(p.validate(&[AuthAttempt, AuthFailure]).is_ok());
        assert!(p
            .validate(&[AuthAttempt, AuthSuccess, SessionCreate])
            .is_ok());
        assert!(p.validate(&[AuthAttempt]).is_err());
    }

    #[test]
    fn test_alternatives_appends() {
        let s1 = Pipeline::event(AuthAttempt).then(Pipeline::event(AuthSuccess));
        let s2 = Pipeline::event(AuthAttempt).then(Pipeline::event(AuthFailure));
        let s3 = Pipeline::event(AuthAttempt).then(Pipeline::event(RateLimitExceeded));
        match s1.or(s2).or(s3) {
            Pipeline::Alternatives(alts) => assert_eq!(alts.len(), 3),
            other => panic!("expected alternatives, got {:?}", other),
        }
    }

    #[test]
    fn test_greedy_scan_consumes_forward() {
        // The cursor only moves forward: a later step cannot match an
        // earlier event even if the kind occurred before.
        let p = Pipeline::event(SessionCreate).then(Pipeline::event(AuthAttempt));
        assert!(p.validate(&[AuthAttempt, SessionCreate]).is_err());
        assert!(p
            .validate(&[AuthAttempt, SessionCreate, AuthAttempt])
            .is_ok());
    }

    #[test]
    fn test_violation_reports_step_and_pipeline() {
        let p = Pipeline::event(AuthAttempt).then(Pipeline::event(AuthSuccess));
        let err = p.validate(&[AuthAttempt]).unwrap_err();
        assert_eq!(err.failed_step, "auth.success");
        assert_eq!(err.observed, vec!["auth.attempt".to_string()]);
        assert_eq!(err.pipeline, "auth.attempt >> auth.success");
    }

    #[test]
    fn test_pretty_printing() {
        let p = Pipeline::event(AuthAttempt)
            .then(Pipeline::event(AuthSuccess).or(Pipeline::event(AuthFailure)));
        // Group members render in vocabulary order
        assert_eq!(p.to_string(), "auth.attempt >> (auth.success | auth.failure)");
    }

    #[test]
    fn test_validate_implies_ordered_occurrence() {
        // validate(A >> B) = Ok implies positions i < j with E[i]=A, E[j]=B
        let p = Pipeline::event(CredentialCreate).then(Pipeline::event(CredentialVerify));
        let stream = [
            SessionCreate,
            CredentialCreate,
            UserUpdate,
            CredentialVerify,
        ];
        assert!(p.validate(&stream).is_ok());
        let i = stream.iter().position(|k| *k == CredentialCreate).unwrap();
        let j = stream.iter().position(|k| *k == CredentialVerify).unwrap();
        assert!(i < j);
    }
}
