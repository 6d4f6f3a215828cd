use crate::domain::step_graph::StepId;
use crate::error::{ActionError, ActionErrorKind};
use std::collections::HashMap;

/// What the engine does with a failed step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The error is a valid domain result (e.g. not-found on an already
    /// removed object); the step completes with an empty result
    BusinessOutcome,
    /// The attempt was lost to a connectivity failure; the step is demoted
    /// and reissued after reconnect, invisible to the caller
    Retryable,
    /// The step failed for good; the workflow's failure outcome fires and
    /// dependents never become ready
    Fatal,
}

/// Maps a (step, error) pair to a [`Decision`].
///
/// Supplied per workflow, because the same error code means different
/// things on different steps: not-found on "get contact" is a real
/// failure, not-found on "delete descriptor" is an acceptable no-op.
pub trait ErrorClassifier: Send + Sync {
    /// Classify one failed attempt
    fn classify(&self, step_id: &StepId, error: &ActionError) -> Decision;
}

/// Built-in default: connectivity loss replays, everything else is fatal
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, _step_id: &StepId, error: &ActionError) -> Decision {
        match error.kind() {
            ActionErrorKind::Offline => Decision::Retryable,
            _ => Decision::Fatal,
        }
    }
}

/// Declarative per-workflow classification table.
///
/// Lookup precedence: exact (step, kind) rule, then per-kind default, then
/// [`DefaultClassifier`]. The whole error policy of a workflow is auditable
/// here, independent of control flow.
#[derive(Debug, Clone, Default)]
pub struct ClassifierTable {
    step_rules: HashMap<(StepId, ActionErrorKind), Decision>,
    kind_defaults: HashMap<ActionErrorKind, Decision>,
}

impl ClassifierTable {
    /// Start building a table
    pub fn builder() -> ClassifierTableBuilder {
        ClassifierTableBuilder {
            table: ClassifierTable::default(),
        }
    }
}

impl ErrorClassifier for ClassifierTable {
    fn classify(&self, step_id: &StepId, error: &ActionError) -> Decision {
        let kind = error.kind();
        if let Some(decision) = self.step_rules.get(&(step_id.clone(), kind)) {
            return *decision;
        }
        if let Some(decision) = self.kind_defaults.get(&kind) {
            return *decision;
        }
        DefaultClassifier.classify(step_id, error)
    }
}

/// Builder for [`ClassifierTable`]
#[derive(Debug, Clone)]
pub struct ClassifierTableBuilder {
    table: ClassifierTable,
}

impl ClassifierTableBuilder {
    /// Add an exact (step, kind) rule
    pub fn step_rule(
        mut self,
        step_id: impl Into<StepId>,
        kind: ActionErrorKind,
        decision: Decision,
    ) -> Self {
        self.table
            .step_rules
            .insert((step_id.into(), kind), decision);
        self
    }

    /// Add a default for every step hitting the given error kind
    pub fn kind_default(mut self, kind: ActionErrorKind, decision: Decision) -> Self {
        self.table.kind_defaults.insert(kind, decision);
        self
    }

    /// Finish the table
    pub fn build(self) -> ClassifierTable {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classifier() {
        let classifier = DefaultClassifier;
        let step = StepId::from("get_space");

        assert_eq!(
            classifier.classify(&step, &ActionError::Offline("lost".to_string())),
            Decision::Retryable
        );
        assert_eq!(
            classifier.classify(&step, &ActionError::NotFound("x".to_string())),
            Decision::Fatal
        );
        assert_eq!(
            classifier.classify(&step, &ActionError::PermissionDenied("x".to_string())),
            Decision::Fatal
        );
    }

    #[test]
    fn test_table_falls_back_to_default() {
        let table = ClassifierTable::builder().build();
        let step = StepId::from("get_space");

        assert_eq!(
            table.classify(&step, &ActionError::Offline("lost".to_string())),
            Decision::Retryable
        );
        assert_eq!(
            table.classify(&step, &ActionError::Backend("boom".to_string())),
            Decision::Fatal
        );
    }

    #[test]
    fn test_step_rule_overrides_kind_default() {
        let table = ClassifierTable::builder()
            .kind_default(ActionErrorKind::NotFound, Decision::Fatal)
            .step_rule(
                "delete_descriptor",
                ActionErrorKind::NotFound,
                Decision::BusinessOutcome,
            )
            .build();

        // The deletion target being gone already is an acceptable no-op
        assert_eq!(
            table.classify(
                &StepId::from("delete_descriptor"),
                &ActionError::NotFound("descriptor".to_string())
            ),
            Decision::BusinessOutcome
        );

        // The same code on another step is a real failure
        assert_eq!(
            table.classify(
                &StepId::from("get_contact"),
                &ActionError::NotFound("contact".to_string())
            ),
            Decision::Fatal
        );
    }

    #[test]
    fn test_kind_default_applies_to_all_steps() {
        let table = ClassifierTable::builder()
            .kind_default(ActionErrorKind::LimitReached, Decision::BusinessOutcome)
            .build();

        for step in ["a", "b", "c"] {
            assert_eq!(
                table.classify(
                    &StepId::from(step),
                    &ActionError::LimitReached("quota".to_string())
                ),
                Decision::BusinessOutcome
            );
        }
    }

    #[test]
    fn test_rule_is_kind_specific() {
        let table = ClassifierTable::builder()
            .step_rule(
                "get_group",
                ActionErrorKind::NotFound,
                Decision::BusinessOutcome,
            )
            .build();

        // A different kind on the same step still takes the default path
        assert_eq!(
            table.classify(
                &StepId::from("get_group"),
                &ActionError::Backend("boom".to_string())
            ),
            Decision::Fatal
        );
    }
}
