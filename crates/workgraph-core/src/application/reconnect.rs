use crate::domain::correlator::RequestCorrelator;
use crate::domain::instance::WorkflowState;
use crate::domain::step_graph::{StepDefinition, StepGraph, StepId};
use tracing::{debug, warn};

/// Connectivity-loss bookkeeping.
///
/// On a retryable failure the failing step is demoted out of the in-flight
/// set so the next drive pass after reconnect reissues it; on restore,
/// every step that is still in flight (its reply lost to the outage) is
/// demoted the same way. Steps that opted out of replay are left alone;
/// the driver escalates their retryable failures instead.
pub struct ReconnectPolicy;

impl ReconnectPolicy {
    /// Apply a `Retryable` classification for one step whose request has
    /// already been resolved. Demotes the step, clears its partial scratch
    /// output, and sets the offline mark.
    pub fn on_retryable(state: &mut WorkflowState, step: &StepDefinition) {
        warn!(
            instance_id = %state.id,
            step_id = %step.id,
            "connectivity lost, demoting step for replay"
        );
        state.demote(step.id.clone(), &step.output_key);
        state.set_offline();
    }

    /// Connectivity returned: demote every still-issued replayable step
    /// (retiring its request so a late reply is dropped), clear the
    /// offline mark, and return the demoted steps.
    pub fn on_restored(
        state: &mut WorkflowState,
        correlator: &RequestCorrelator,
        graph: &StepGraph,
    ) -> Vec<StepId> {
        let mut demoted = Vec::new();

        for step_id in state.issued_snapshot() {
            let Some(step) = graph.get(&step_id) else {
                continue;
            };
            if !step.replayable {
                debug!(
                    instance_id = %state.id,
                    step_id = %step_id,
                    "leaving non-replayable step in flight across reconnect"
                );
                continue;
            }
            if let Some(request_id) = correlator.find_by_step(&step_id) {
                correlator.retire(request_id);
            }
            state.demote(step_id.clone(), &step.output_key);
            demoted.push(step_id);
        }

        state.clear_offline();
        demoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::step_graph::{action_fn, ExecutionResult};
    use crate::types::{RequestId, ScratchValue};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn graph() -> Arc<StepGraph> {
        let noop = || action_fn(|_| async { ExecutionResult::Success(ScratchValue::null()) });
        StepGraph::build(vec![
            StepDefinition::new("get_twincode", noop()),
            StepDefinition::new("push_message", noop()).non_replayable(),
        ])
        .unwrap()
    }

    #[test]
    fn test_on_retryable_demotes_and_marks_offline() {
        let graph = graph();
        let mut state = WorkflowState::new(Arc::clone(&graph), HashMap::new());
        let step = graph.get(&StepId::from("get_twincode")).unwrap();

        state
            .mark_issued(step.id.clone(), RequestId(1))
            .unwrap();

        ReconnectPolicy::on_retryable(&mut state, step);

        assert!(!state.is_issued(&step.id));
        assert!(state.offline());
        assert_eq!(state.replay_snapshot(), vec![step.id.clone()]);
    }

    #[test]
    fn test_on_restored_demotes_only_replayable_steps() {
        let graph = graph();
        let correlator = RequestCorrelator::new();
        let mut state = WorkflowState::new(Arc::clone(&graph), HashMap::new());

        let replayable = correlator.track(StepId::from("get_twincode"));
        state
            .mark_issued(StepId::from("get_twincode"), replayable.request_id)
            .unwrap();

        let committed = correlator.track(StepId::from("push_message"));
        state
            .mark_issued(StepId::from("push_message"), committed.request_id)
            .unwrap();

        state.set_offline();

        let demoted = ReconnectPolicy::on_restored(&mut state, &correlator, &graph);

        assert_eq!(demoted, vec![StepId::from("get_twincode")]);
        assert!(!state.offline());

        // The replayable step's request is retired so a late reply is
        // dropped; the non-replayable one stays tracked
        assert!(correlator.take_stale(replayable.request_id));
        assert!(correlator.resolve(committed.request_id).is_some());
        assert!(state.is_issued(&StepId::from("push_message")));
    }
}
