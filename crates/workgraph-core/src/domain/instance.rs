use crate::domain::events::{SettleReport, SettleStatus, WorkEvent};
use crate::domain::step_graph::{StepGraph, StepId};
use crate::error::{ActionError, EngineError};
use crate::types::{InstanceId, RequestId, ScratchValue, ScratchView};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Lifecycle status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Work may still be requested, issued, and completed
    Running,
    /// Every requested step completed or was skipped; no failures
    Settled,
    /// Every requested step is terminal but at least one failed or could
    /// never run
    Failed,
    /// The owner disposed the instance; all further effects are suppressed
    Disposed,
}

/// Aggregate: mutable per-invocation state of one workflow.
///
/// Holds the requested/issued/completed/skipped/failed step sets and the
/// scratch bag of intermediate results. Mutated only under the driver's
/// serial lock; invariant checks here are the backstop against the
/// double-complete and stale-flag bug class this engine exists to remove.
#[derive(Debug)]
pub struct WorkflowState {
    /// Unique identifier of this instance
    pub id: InstanceId,
    graph: Arc<StepGraph>,
    status: WorkStatus,
    requested: HashSet<StepId>,
    issued: HashSet<StepId>,
    completed: HashSet<StepId>,
    skipped: HashSet<StepId>,
    failed: HashSet<StepId>,
    failed_errors: HashMap<StepId, ActionError>,
    scratch: HashMap<String, ScratchValue>,
    offline: bool,
    replay: HashSet<StepId>,
    settle: Option<SettleReport>,
    events: Vec<WorkEvent>,
}

impl WorkflowState {
    /// Create a running instance over a graph, with optional seed scratch
    /// entries (the caller's trigger data)
    pub fn new(graph: Arc<StepGraph>, seed: HashMap<String, ScratchValue>) -> Self {
        Self {
            id: InstanceId::generate(),
            graph,
            status: WorkStatus::Running,
            requested: HashSet::new(),
            issued: HashSet::new(),
            completed: HashSet::new(),
            skipped: HashSet::new(),
            failed: HashSet::new(),
            failed_errors: HashMap::new(),
            scratch: seed,
            offline: false,
            replay: HashSet::new(),
            settle: None,
            events: Vec::with_capacity(8),
        }
    }

    /// Current lifecycle status
    pub fn status(&self) -> WorkStatus {
        self.status
    }

    /// Whether the step has been requested (explicitly or as a dependency)
    pub fn is_requested(&self, id: &StepId) -> bool {
        self.requested.contains(id)
    }

    /// Whether the step's action is currently in flight
    pub fn is_issued(&self, id: &StepId) -> bool {
        self.issued.contains(id)
    }

    /// Whether the step has reached any terminal state
    pub fn is_terminal(&self, id: &StepId) -> bool {
        self.completed.contains(id) || self.skipped.contains(id) || self.failed.contains(id)
    }

    /// Whether the step satisfies downstream readiness: completed or
    /// skipped. A fatally failed step never satisfies a dependency.
    pub fn satisfies_dependency(&self, id: &StepId) -> bool {
        self.completed.contains(id) || self.skipped.contains(id)
    }

    /// Whether any requested step has been recorded
    pub fn has_requested(&self) -> bool {
        !self.requested.is_empty()
    }

    /// Whether any step action is in flight
    pub fn has_inflight(&self) -> bool {
        !self.issued.is_empty()
    }

    /// Whether the transport is currently marked offline
    pub fn offline(&self) -> bool {
        self.offline
    }

    /// Add steps (a dependency closure) to the requested set
    pub fn record_request(&mut self, steps: HashSet<StepId>) {
        let mut added: Vec<StepId> = steps
            .into_iter()
            .filter(|id| self.requested.insert(id.clone()))
            .collect();
        if added.is_empty() {
            return;
        }
        added.sort_by(|a, b| a.0.cmp(&b.0));
        self.record_event(WorkEvent::WorkRequested {
            steps: added,
            timestamp: Utc::now(),
        });
    }

    /// Mark a step's action as dispatched
    pub fn mark_issued(&mut self, id: StepId, request_id: RequestId) -> Result<(), EngineError> {
        if self.issued.contains(&id) {
            return Err(EngineError::ContractViolation(format!(
                "step {} issued while already in flight",
                id
            )));
        }
        if self.is_terminal(&id) {
            return Err(EngineError::ContractViolation(format!(
                "step {} issued after reaching a terminal state",
                id
            )));
        }
        self.issued.insert(id.clone());
        self.replay.remove(&id);
        self.record_event(WorkEvent::StepIssued {
            step_id: id,
            request_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Move a step from issued to completed, optionally writing its result
    /// into the scratch bag. `None` records a business outcome: the step
    /// legitimately produced nothing.
    pub fn mark_completed(
        &mut self,
        id: StepId,
        result: Option<ScratchValue>,
        output_key: &str,
    ) -> Result<(), EngineError> {
        if !self.issued.remove(&id) {
            return Err(EngineError::ContractViolation(format!(
                "step {} completed without being in flight",
                id
            )));
        }
        let notified = match result {
            Some(value) => {
                self.scratch.insert(output_key.to_string(), value.clone());
                value
            }
            None => ScratchValue::null(),
        };
        self.completed.insert(id.clone());
        self.record_event(WorkEvent::StepCompleted {
            step_id: id,
            result: notified,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Mark a never-issued optional step as skipped (terminal,
    /// not-applicable)
    pub fn mark_skipped(&mut self, id: StepId) {
        self.skipped.insert(id.clone());
        self.record_event(WorkEvent::StepSkipped {
            step_id: id,
            timestamp: Utc::now(),
        });
    }

    /// Move a step from issued to failed with its error
    pub fn mark_failed(&mut self, id: StepId, error: ActionError) -> Result<(), EngineError> {
        if !self.issued.remove(&id) {
            return Err(EngineError::ContractViolation(format!(
                "step {} failed without being in flight",
                id
            )));
        }
        self.failed.insert(id.clone());
        self.failed_errors.insert(id.clone(), error.clone());
        self.record_event(WorkEvent::StepFailed {
            step_id: id,
            error,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Demote an in-flight step so the driver reissues it after reconnect.
    /// Clears the step's own scratch output so the retry starts clean.
    pub fn demote(&mut self, id: StepId, output_key: &str) {
        if !self.issued.remove(&id) {
            return;
        }
        self.scratch.remove(output_key);
        self.replay.insert(id.clone());
        self.record_event(WorkEvent::StepDemoted {
            step_id: id,
            timestamp: Utc::now(),
        });
    }

    /// Set the offline mark; returns true if the mark was newly set
    pub fn set_offline(&mut self) -> bool {
        if self.offline {
            return false;
        }
        self.offline = true;
        self.record_event(WorkEvent::ConnectivityLost {
            timestamp: Utc::now(),
        });
        true
    }

    /// Clear the offline mark after connectivity returns
    pub fn clear_offline(&mut self) {
        if !self.offline {
            return;
        }
        self.offline = false;
        self.replay.clear();
        self.record_event(WorkEvent::ConnectivityRestored {
            timestamp: Utc::now(),
        });
    }

    /// Steps currently in flight
    pub fn issued_snapshot(&self) -> Vec<StepId> {
        self.issued.iter().cloned().collect()
    }

    /// Steps demoted and awaiting reconnect replay
    pub fn replay_snapshot(&self) -> Vec<StepId> {
        self.replay.iter().cloned().collect()
    }

    /// Look up a scratch entry
    pub fn scratch_value(&self, key: &str) -> Option<&ScratchValue> {
        self.scratch.get(key)
    }

    /// Whether a scratch key is present
    pub fn has_scratch(&self, key: &str) -> bool {
        self.scratch.contains_key(key)
    }

    /// Copy of the scratch bag for a step context
    pub fn scratch_view(&self) -> ScratchView {
        ScratchView::new(self.scratch.clone())
    }

    /// Whether every requested step is terminal
    pub fn all_requested_terminal(&self) -> bool {
        self.requested.iter().all(|id| self.is_terminal(id))
    }

    /// Build the terminal summary over the requested set
    pub fn settle_report(&self) -> SettleReport {
        let mut completed = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = Vec::new();
        let mut blocked = Vec::new();

        for id in &self.requested {
            if self.completed.contains(id) {
                completed.push(id.clone());
            } else if self.skipped.contains(id) {
                skipped.push(id.clone());
            } else if let Some(error) = self.failed_errors.get(id) {
                failed.push((id.clone(), error.clone()));
            } else {
                blocked.push(id.clone());
            }
        }

        completed.sort_by(|a, b| a.0.cmp(&b.0));
        skipped.sort_by(|a, b| a.0.cmp(&b.0));
        failed.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
        blocked.sort_by(|a, b| a.0.cmp(&b.0));

        let status = if failed.is_empty() && blocked.is_empty() {
            SettleStatus::Completed
        } else {
            SettleStatus::Blocked
        };

        SettleReport {
            status,
            completed,
            skipped,
            failed,
            blocked,
        }
    }

    /// Transition to a terminal status with its report; records the
    /// settle event exactly once
    pub fn finish(&mut self, report: SettleReport) {
        if self.settle.is_some() || self.status != WorkStatus::Running {
            return;
        }
        self.status = if report.is_complete() {
            WorkStatus::Settled
        } else {
            WorkStatus::Failed
        };
        self.settle = Some(report.clone());
        self.record_event(WorkEvent::Settled {
            report,
            timestamp: Utc::now(),
        });
    }

    /// Terminal summary, once settled
    pub fn settle(&self) -> Option<&SettleReport> {
        self.settle.as_ref()
    }

    /// Suppress all further effects; pending undelivered events are
    /// discarded
    pub fn set_disposed(&mut self) {
        self.status = WorkStatus::Disposed;
        self.events.clear();
    }

    /// The graph this instance runs over
    pub fn graph(&self) -> &Arc<StepGraph> {
        &self.graph
    }

    /// Fatal error recorded for a step, if any
    pub fn failed_error(&self, id: &StepId) -> Option<&ActionError> {
        self.failed_errors.get(id)
    }

    /// Record a lifecycle event for later delivery
    pub fn record_event(&mut self, event: WorkEvent) {
        self.events.push(event);
    }

    /// Get and clear all recorded events
    pub fn take_events(&mut self) -> Vec<WorkEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::step_graph::{action_fn, ExecutionResult, StepDefinition};
    use serde_json::json;

    fn test_graph() -> Arc<StepGraph> {
        let noop = || action_fn(|_| async { ExecutionResult::Success(ScratchValue::null()) });
        StepGraph::build(vec![
            StepDefinition::new("step1", noop()),
            StepDefinition::new("step2", noop()).after("step1"),
            StepDefinition::new("step3", noop()).after("step2"),
        ])
        .unwrap()
    }

    fn running_state() -> WorkflowState {
        let mut state = WorkflowState::new(test_graph(), HashMap::new());
        state.take_events();
        state
    }

    #[test]
    fn test_new_state() {
        let state = WorkflowState::new(test_graph(), HashMap::new());

        assert_eq!(state.status(), WorkStatus::Running);
        assert!(!state.has_requested());
        assert!(!state.has_inflight());
        assert!(!state.offline());
        assert!(state.all_requested_terminal()); // vacuously
        assert!(!state.id.0.is_empty());
    }

    #[test]
    fn test_record_request_dedupes() {
        let mut state = running_state();

        let mut steps = HashSet::new();
        steps.insert(StepId::from("step1"));
        steps.insert(StepId::from("step2"));
        state.record_request(steps);

        let events = state.take_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            WorkEvent::WorkRequested { steps, .. } => assert_eq!(steps.len(), 2),
            other => panic!("Expected WorkRequested, got {:?}", other),
        }

        // Requesting the same steps again records nothing new
        let mut steps = HashSet::new();
        steps.insert(StepId::from("step1"));
        state.record_request(steps);
        assert!(state.take_events().is_empty());
    }

    #[test]
    fn test_issue_complete_lifecycle() {
        let mut state = running_state();
        let step1 = StepId::from("step1");

        state.mark_issued(step1.clone(), RequestId(1)).unwrap();
        assert!(state.is_issued(&step1));
        assert!(!state.is_terminal(&step1));

        state
            .mark_completed(
                step1.clone(),
                Some(ScratchValue::new(json!({"space": 1}))),
                "step1",
            )
            .unwrap();

        assert!(!state.is_issued(&step1));
        assert!(state.is_terminal(&step1));
        assert!(state.satisfies_dependency(&step1));
        assert_eq!(state.scratch_value("step1").unwrap().as_value()["space"], 1);
    }

    #[test]
    fn test_double_issue_is_contract_violation() {
        let mut state = running_state();
        let step1 = StepId::from("step1");

        state.mark_issued(step1.clone(), RequestId(1)).unwrap();
        let err = state.mark_issued(step1, RequestId(2)).unwrap_err();
        match err {
            EngineError::ContractViolation(msg) => assert!(msg.contains("already in flight")),
            _ => panic!("Expected ContractViolation"),
        }
    }

    #[test]
    fn test_complete_without_issue_is_contract_violation() {
        let mut state = running_state();

        let err = state
            .mark_completed(StepId::from("step1"), None, "step1")
            .unwrap_err();
        match err {
            EngineError::ContractViolation(msg) => {
                assert!(msg.contains("without being in flight"));
            }
            _ => panic!("Expected ContractViolation"),
        }
    }

    #[test]
    fn test_business_outcome_leaves_scratch_absent() {
        let mut state = running_state();
        let step1 = StepId::from("step1");

        state.mark_issued(step1.clone(), RequestId(1)).unwrap();
        state.mark_completed(step1.clone(), None, "step1").unwrap();

        assert!(state.is_terminal(&step1));
        assert!(!state.has_scratch("step1"));

        let events = state.take_events();
        let completed = events
            .iter()
            .find(|e| matches!(e, WorkEvent::StepCompleted { .. }))
            .unwrap();
        match completed {
            WorkEvent::StepCompleted { result, .. } => assert!(result.is_null()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_failed_step_does_not_satisfy_dependency() {
        let mut state = running_state();
        let step1 = StepId::from("step1");

        state.mark_issued(step1.clone(), RequestId(1)).unwrap();
        state
            .mark_failed(step1.clone(), ActionError::Backend("boom".to_string()))
            .unwrap();

        assert!(state.is_terminal(&step1));
        assert!(!state.satisfies_dependency(&step1));
        assert!(state.failed_error(&step1).is_some());
    }

    #[test]
    fn test_demote_clears_scratch_and_marks_replay() {
        let mut state = running_state();
        let step1 = StepId::from("step1");

        state.mark_issued(step1.clone(), RequestId(1)).unwrap();
        // Partial output from a half-finished attempt
        state
            .scratch
            .insert("step1".to_string(), ScratchValue::null());

        state.demote(step1.clone(), "step1");

        assert!(!state.is_issued(&step1));
        assert!(!state.is_terminal(&step1));
        assert!(!state.has_scratch("step1"));
        assert_eq!(state.replay_snapshot(), vec![step1.clone()]);

        // Reissuing takes the step back out of the replay set
        state.mark_issued(step1.clone(), RequestId(2)).unwrap();
        assert!(state.replay_snapshot().is_empty());
    }

    #[test]
    fn test_demote_ignores_steps_not_in_flight() {
        let mut state = running_state();
        state.demote(StepId::from("step1"), "step1");
        assert!(state.replay_snapshot().is_empty());
        assert!(state.take_events().is_empty());
    }

    #[test]
    fn test_offline_mark_set_once() {
        let mut state = running_state();

        assert!(state.set_offline());
        assert!(!state.set_offline());
        assert!(state.offline());

        let events = state.take_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, WorkEvent::ConnectivityLost { .. }))
                .count(),
            1
        );

        state.clear_offline();
        assert!(!state.offline());
        // Clearing again is a no-op
        state.clear_offline();
        let events = state.take_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, WorkEvent::ConnectivityRestored { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_settle_report_buckets() {
        let mut state = running_state();
        let mut steps = HashSet::new();
        for id in ["step1", "step2", "step3"] {
            steps.insert(StepId::from(id));
        }
        state.record_request(steps);

        state.mark_issued(StepId::from("step1"), RequestId(1)).unwrap();
        state
            .mark_completed(StepId::from("step1"), Some(ScratchValue::null()), "step1")
            .unwrap();

        state.mark_issued(StepId::from("step2"), RequestId(2)).unwrap();
        state
            .mark_failed(
                StepId::from("step2"),
                ActionError::PermissionDenied("no".to_string()),
            )
            .unwrap();

        let report = state.settle_report();
        assert_eq!(report.status, SettleStatus::Blocked);
        assert_eq!(report.completed, vec![StepId::from("step1")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.blocked, vec![StepId::from("step3")]);
    }

    #[test]
    fn test_finish_records_settle_once() {
        let mut state = running_state();
        let mut steps = HashSet::new();
        steps.insert(StepId::from("step1"));
        state.record_request(steps);

        state.mark_issued(StepId::from("step1"), RequestId(1)).unwrap();
        state
            .mark_completed(StepId::from("step1"), Some(ScratchValue::null()), "step1")
            .unwrap();

        let report = state.settle_report();
        state.finish(report.clone());
        assert_eq!(state.status(), WorkStatus::Settled);
        assert_eq!(state.settle(), Some(&report));

        // A second finish is ignored
        state.finish(report);
        let events = state.take_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, WorkEvent::Settled { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_dispose_discards_pending_events() {
        let mut state = running_state();
        state.mark_issued(StepId::from("step1"), RequestId(1)).unwrap();

        state.set_disposed();
        assert_eq!(state.status(), WorkStatus::Disposed);
        assert!(state.take_events().is_empty());
    }

    #[test]
    fn test_seed_scratch() {
        let mut seed = HashMap::new();
        seed.insert(
            "invitation".to_string(),
            ScratchValue::new(json!({"code": "abc"})),
        );
        let state = WorkflowState::new(test_graph(), seed);

        assert!(state.has_scratch("invitation"));
        let view = state.scratch_view();
        assert_eq!(view.get("invitation").unwrap().as_value()["code"], "abc");
    }
}
