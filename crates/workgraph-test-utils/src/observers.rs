//! Recording observers and sinks for asserting on engine notifications.

use std::sync::Mutex;
use tokio::sync::Notify;
use workgraph_core::{
    ActionError, EventSink, ScratchValue, SettleReport, StepId, WorkEvent, WorkObserver,
};

/// One notification captured by a [`RecordingObserver`]
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedOutcome {
    /// `on_step_completed` fired
    Completed(StepId, ScratchValue),
    /// `on_step_failed` fired
    Failed(StepId, ActionError),
    /// `on_settled` fired
    Settled(SettleReport),
}

/// Observer that records every notification it receives, in order
#[derive(Debug, Default)]
pub struct RecordingObserver {
    outcomes: Mutex<Vec<ObservedOutcome>>,
}

impl RecordingObserver {
    /// Create an empty recording observer
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded notification, in delivery order
    pub fn outcomes(&self) -> Vec<ObservedOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    /// Steps reported as completed, in delivery order
    pub fn completed(&self) -> Vec<StepId> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|o| match o {
                ObservedOutcome::Completed(step_id, _) => Some(step_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Steps reported as failed, in delivery order
    pub fn failed(&self) -> Vec<StepId> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|o| match o {
                ObservedOutcome::Failed(step_id, _) => Some(step_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Settle reports received
    pub fn settle_reports(&self) -> Vec<SettleReport> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|o| match o {
                ObservedOutcome::Settled(report) => Some(report.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether nothing has been delivered
    pub fn is_empty(&self) -> bool {
        self.outcomes.lock().unwrap().is_empty()
    }
}

impl WorkObserver for RecordingObserver {
    fn on_step_completed(&self, step_id: &StepId, result: &ScratchValue) {
        self.outcomes
            .lock()
            .unwrap()
            .push(ObservedOutcome::Completed(step_id.clone(), result.clone()));
    }

    fn on_step_failed(&self, step_id: &StepId, error: &ActionError) {
        self.outcomes
            .lock()
            .unwrap()
            .push(ObservedOutcome::Failed(step_id.clone(), error.clone()));
    }

    fn on_settled(&self, report: &SettleReport) {
        self.outcomes
            .lock()
            .unwrap()
            .push(ObservedOutcome::Settled(report.clone()));
    }
}

/// Event sink that captures the full lifecycle stream and lets tests wait
/// for a matching event
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<WorkEvent>>,
    notify: Notify,
}

impl RecordingSink {
    /// Create an empty recording sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Every captured event, in order
    pub fn events(&self) -> Vec<WorkEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Number of captured events matching a predicate
    pub fn count(&self, pred: impl Fn(&WorkEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    /// Wait until some captured event matches the predicate
    pub async fn wait_for(&self, pred: impl Fn(&WorkEvent) -> bool) {
        loop {
            let notified = self.notify.notified();
            if self.events.lock().unwrap().iter().any(&pred) {
                return;
            }
            notified.await;
        }
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: &WorkEvent) {
        self.events.lock().unwrap().push(event.clone());
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workgraph_core::SettleStatus;

    #[test]
    fn test_recording_observer_orders_outcomes() {
        let observer = RecordingObserver::new();
        assert!(observer.is_empty());

        observer.on_step_completed(&StepId::from("a"), &ScratchValue::null());
        observer.on_step_failed(&StepId::from("b"), &ActionError::Backend("x".to_string()));
        observer.on_settled(&SettleReport {
            status: SettleStatus::Blocked,
            completed: vec![StepId::from("a")],
            skipped: Vec::new(),
            failed: vec![(StepId::from("b"), ActionError::Backend("x".to_string()))],
            blocked: Vec::new(),
        });

        assert_eq!(observer.completed(), vec![StepId::from("a")]);
        assert_eq!(observer.failed(), vec![StepId::from("b")]);
        assert_eq!(observer.settle_reports().len(), 1);
        assert_eq!(observer.outcomes().len(), 3);
    }

    #[tokio::test]
    async fn test_recording_sink_wait_for() {
        let sink = std::sync::Arc::new(RecordingSink::new());

        let waiter = {
            let sink = std::sync::Arc::clone(&sink);
            tokio::spawn(async move {
                sink.wait_for(|e| matches!(e, WorkEvent::ConnectivityLost { .. }))
                    .await;
            })
        };

        sink.on_event(&WorkEvent::ConnectivityLost {
            timestamp: chrono::Utc::now(),
        });

        waiter.await.unwrap();
        assert_eq!(
            sink.count(|e| matches!(e, WorkEvent::ConnectivityLost { .. })),
            1
        );
    }
}
