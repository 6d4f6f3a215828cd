use crate::domain::step_graph::StepId;
use crate::error::ActionError;
use crate::types::{RequestId, ScratchValue};
use chrono::{DateTime, Utc};

/// How a workflow instance finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleStatus {
    /// Every requested step completed or was skipped as not-applicable
    Completed,
    /// At least one requested step failed or could never run
    Blocked,
}

/// Terminal summary of one workflow instance, delivered exactly once with
/// the settle notification
#[derive(Debug, Clone, PartialEq)]
pub struct SettleReport {
    /// Overall outcome
    pub status: SettleStatus,
    /// Steps that completed (including business-outcome completions)
    pub completed: Vec<StepId>,
    /// Optional steps skipped for lack of input
    pub skipped: Vec<StepId>,
    /// Steps that failed fatally, with their errors
    pub failed: Vec<(StepId, ActionError)>,
    /// Steps that were requested but could never be issued
    pub blocked: Vec<StepId>,
}

impl SettleReport {
    /// Whether every requested step reached a successful terminal state
    pub fn is_complete(&self) -> bool {
        self.status == SettleStatus::Completed
    }
}

/// Lifecycle event recorded by instance state mutations and delivered by
/// the driver
#[derive(Debug, Clone, PartialEq)]
pub enum WorkEvent {
    /// New steps were added to the requested set
    WorkRequested {
        /// The newly requested steps, dependency closure included
        steps: Vec<StepId>,
        /// When the request was recorded
        timestamp: DateTime<Utc>,
    },
    /// A step's action was dispatched
    StepIssued {
        /// The issued step
        step_id: StepId,
        /// The request tracking this attempt
        request_id: RequestId,
        /// When the step was issued
        timestamp: DateTime<Utc>,
    },
    /// A step reached a successful terminal state
    StepCompleted {
        /// The completed step
        step_id: StepId,
        /// The produced value (null for business outcomes and skips)
        result: ScratchValue,
        /// When the completion was recorded
        timestamp: DateTime<Utc>,
    },
    /// An optional step was skipped for lack of input
    StepSkipped {
        /// The skipped step
        step_id: StepId,
        /// When the skip was recorded
        timestamp: DateTime<Utc>,
    },
    /// A step failed fatally
    StepFailed {
        /// The failed step
        step_id: StepId,
        /// The classifying error
        error: ActionError,
        /// When the failure was recorded
        timestamp: DateTime<Utc>,
    },
    /// An in-flight step was demoted for replay after reconnect
    StepDemoted {
        /// The demoted step
        step_id: StepId,
        /// When the demotion was recorded
        timestamp: DateTime<Utc>,
    },
    /// A connectivity loss was observed
    ConnectivityLost {
        /// When the loss was observed
        timestamp: DateTime<Utc>,
    },
    /// Connectivity was restored and demoted steps reissued
    ConnectivityRestored {
        /// When the restore was observed
        timestamp: DateTime<Utc>,
    },
    /// Every requested step reached a terminal state
    Settled {
        /// Terminal summary
        report: SettleReport,
        /// When the workflow settled
        timestamp: DateTime<Utc>,
    },
}

impl WorkEvent {
    /// Stable event-type name for logging and metrics
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkEvent::WorkRequested { .. } => "work.requested",
            WorkEvent::StepIssued { .. } => "step.issued",
            WorkEvent::StepCompleted { .. } => "step.completed",
            WorkEvent::StepSkipped { .. } => "step.skipped",
            WorkEvent::StepFailed { .. } => "step.failed",
            WorkEvent::StepDemoted { .. } => "step.demoted",
            WorkEvent::ConnectivityLost { .. } => "connectivity.lost",
            WorkEvent::ConnectivityRestored { .. } => "connectivity.restored",
            WorkEvent::Settled { .. } => "work.settled",
        }
    }

    /// When the event occurred
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WorkEvent::WorkRequested { timestamp, .. }
            | WorkEvent::StepIssued { timestamp, .. }
            | WorkEvent::StepCompleted { timestamp, .. }
            | WorkEvent::StepSkipped { timestamp, .. }
            | WorkEvent::StepFailed { timestamp, .. }
            | WorkEvent::StepDemoted { timestamp, .. }
            | WorkEvent::ConnectivityLost { timestamp }
            | WorkEvent::ConnectivityRestored { timestamp }
            | WorkEvent::Settled { timestamp, .. } => *timestamp,
        }
    }
}

/// Caller-facing outcome observer, registered per `request_work` call.
///
/// Each method fires at most once per step for the steps the observer was
/// registered against; `on_settled` fires exactly once when all requested
/// work is done. Delivery stops permanently once the instance is disposed.
pub trait WorkObserver: Send + Sync {
    /// A step reached a successful terminal state (null result for
    /// business outcomes and skips)
    fn on_step_completed(&self, _step_id: &StepId, _result: &ScratchValue) {}

    /// A step failed fatally
    fn on_step_failed(&self, _step_id: &StepId, _error: &ActionError) {}

    /// Every requested step reached a terminal state
    fn on_settled(&self, _report: &SettleReport) {}
}

/// Instance-wide sink receiving the full lifecycle event stream, for
/// logging, metrics, or test instrumentation
pub trait EventSink: Send + Sync {
    /// Observe one lifecycle event
    fn on_event(&self, event: &WorkEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types() {
        let now = Utc::now();
        let event = WorkEvent::StepCompleted {
            step_id: StepId::from("get_space"),
            result: ScratchValue::null(),
            timestamp: now,
        };

        assert_eq!(event.event_type(), "step.completed");
        assert_eq!(event.timestamp(), now);
    }

    #[test]
    fn test_settle_report_is_complete() {
        let complete = SettleReport {
            status: SettleStatus::Completed,
            completed: vec![StepId::from("a")],
            skipped: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
        };
        assert!(complete.is_complete());

        let blocked = SettleReport {
            status: SettleStatus::Blocked,
            completed: Vec::new(),
            skipped: Vec::new(),
            failed: vec![(
                StepId::from("b"),
                ActionError::Backend("boom".to_string()),
            )],
            blocked: Vec::new(),
        };
        assert!(!blocked.is_complete());
    }

    #[test]
    fn test_observer_defaults_are_noops() {
        struct Silent;
        impl WorkObserver for Silent {}

        let observer = Silent;
        observer.on_step_completed(&StepId::from("a"), &ScratchValue::null());
        observer.on_step_failed(&StepId::from("a"), &ActionError::Backend("x".to_string()));
        observer.on_settled(&SettleReport {
            status: SettleStatus::Completed,
            completed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
        });
    }
}
