//! Controllable step actions for driving the engine deterministically in
//! tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use workgraph_core::{ExecutionResult, StepAction, StepContext};

/// Action that replays a scripted sequence of results, one per attempt.
///
/// Once the script is exhausted the last scripted result repeats, so a
/// retried step keeps behaving sensibly.
pub struct ScriptedAction {
    script: Mutex<VecDeque<ExecutionResult>>,
    fallback: ExecutionResult,
    attempts: AtomicUsize,
}

impl ScriptedAction {
    /// Script an explicit sequence of results; must be non-empty
    pub fn sequence(results: Vec<ExecutionResult>) -> Arc<Self> {
        assert!(!results.is_empty(), "script must contain at least one result");
        let fallback = results.last().cloned().unwrap();
        Arc::new(Self {
            script: Mutex::new(results.into()),
            fallback,
            attempts: AtomicUsize::new(0),
        })
    }

    /// Always succeed with the given value
    pub fn succeeding(value: serde_json::Value) -> Arc<Self> {
        Self::sequence(vec![ExecutionResult::Success(
            workgraph_core::ScratchValue::new(value),
        )])
    }

    /// Always fail with the given error
    pub fn failing(error: workgraph_core::ActionError) -> Arc<Self> {
        Self::sequence(vec![ExecutionResult::Failure(error)])
    }

    /// Fail `failures` times with the given error, then succeed with the
    /// given value
    pub fn fail_then_succeed(
        failures: usize,
        error: workgraph_core::ActionError,
        value: serde_json::Value,
    ) -> Arc<Self> {
        let mut results = vec![ExecutionResult::Failure(error); failures];
        results.push(ExecutionResult::Success(
            workgraph_core::ScratchValue::new(value),
        ));
        Self::sequence(results)
    }

    /// How many times the engine attempted this action
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepAction for ScriptedAction {
    async fn execute(&self, _ctx: StepContext) -> ExecutionResult {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct PendingState {
    issues: Mutex<Vec<StepContext>>,
    notify: Notify,
}

struct PendingAction {
    state: Arc<PendingState>,
}

#[async_trait]
impl StepAction for PendingAction {
    async fn execute(&self, ctx: StepContext) -> ExecutionResult {
        self.state.issues.lock().unwrap().push(ctx);
        self.state.notify.notify_waiters();
        ExecutionResult::Pending
    }
}

/// Test-side handle to a [`pending`] action
pub struct PendingHandle {
    state: Arc<PendingState>,
}

impl PendingHandle {
    /// Contexts of every attempt issued so far
    pub fn issues(&self) -> Vec<StepContext> {
        self.state.issues.lock().unwrap().clone()
    }

    /// Number of attempts issued so far
    pub fn issue_count(&self) -> usize {
        self.state.issues.lock().unwrap().len()
    }

    /// Wait until at least `count` attempts have been issued
    pub async fn wait_for_issues(&self, count: usize) {
        loop {
            let notified = self.state.notify.notified();
            if self.issue_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

/// Action that records its context and returns `Pending`; the test
/// completes it later through the driver's completion entry point using
/// the recorded request id
pub fn pending() -> (Arc<dyn StepAction>, PendingHandle) {
    let state = Arc::new(PendingState {
        issues: Mutex::new(Vec::new()),
        notify: Notify::new(),
    });
    (
        Arc::new(PendingAction {
            state: Arc::clone(&state),
        }),
        PendingHandle { state },
    )
}

struct GateState {
    permits: Semaphore,
    issued: AtomicUsize,
    notify: Notify,
}

struct GatedAction {
    state: Arc<GateState>,
    result: ExecutionResult,
}

#[async_trait]
impl StepAction for GatedAction {
    async fn execute(&self, _ctx: StepContext) -> ExecutionResult {
        self.state.issued.fetch_add(1, Ordering::SeqCst);
        self.state.notify.notify_waiters();
        let permit = self
            .state
            .permits
            .acquire()
            .await
            .expect("gate semaphore closed");
        permit.forget();
        self.result.clone()
    }
}

/// Test-side handle to a [`gated`] action
pub struct GateHandle {
    state: Arc<GateState>,
}

impl GateHandle {
    /// Allow one held attempt to finish
    pub fn release(&self) {
        self.state.permits.add_permits(1);
    }

    /// Number of attempts currently started
    pub fn issued(&self) -> usize {
        self.state.issued.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` attempts have started
    pub async fn wait_issued(&self, count: usize) {
        loop {
            let notified = self.state.notify.notified();
            if self.issued() >= count {
                return;
            }
            notified.await;
        }
    }
}

/// Action that starts immediately but holds its result until the test
/// releases it, keeping the step observably in flight
pub fn gated(result: ExecutionResult) -> (Arc<dyn StepAction>, GateHandle) {
    let state = Arc::new(GateState {
        permits: Semaphore::new(0),
        issued: AtomicUsize::new(0),
        notify: Notify::new(),
    });
    (
        Arc::new(GatedAction {
            state: Arc::clone(&state),
            result,
        }),
        GateHandle { state },
    )
}
