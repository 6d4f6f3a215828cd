use crate::application::classifier::{Decision, DefaultClassifier, ErrorClassifier};
use crate::application::lifecycle::LifecycleGuard;
use crate::application::reconnect::ReconnectPolicy;
use crate::domain::correlator::{RequestCorrelator, RequestRecord};
use crate::domain::events::{EventSink, SettleReport, WorkEvent, WorkObserver};
use crate::domain::instance::{WorkStatus, WorkflowState};
use crate::domain::step_graph::{ExecutionResult, StepContext, StepDefinition, StepGraph, StepId};
use crate::error::{ActionError, EngineError};
use crate::types::{InstanceId, RequestId, ScratchValue};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// One outcome observer and the steps it was registered against
struct Registration {
    steps: HashSet<StepId>,
    observer: Arc<dyn WorkObserver>,
}

/// Everything guarded by the instance's serial lock
struct DriverState {
    state: WorkflowState,
    observers: Vec<Registration>,
}

/// The re-entrant scheduling engine for one workflow instance.
///
/// Walks the step graph against the instance state and issues every ready
/// step; completions re-enter through [`complete_request`] and trigger the
/// next drive pass. All state mutation is serialized on one
/// `tokio::sync::Mutex`, so drive passes and completions for the same
/// instance never interleave; step actions themselves run on arbitrary
/// worker tasks.
///
/// [`complete_request`]: WorkflowDriver::complete_request
pub struct WorkflowDriver {
    weak: Weak<WorkflowDriver>,
    graph: Arc<StepGraph>,
    classifier: Arc<dyn ErrorClassifier>,
    correlator: RequestCorrelator,
    guard: LifecycleGuard,
    instance_id: InstanceId,
    state: Mutex<DriverState>,
    settled_tx: watch::Sender<bool>,
    settled_rx: watch::Receiver<bool>,
    sink: Option<Arc<dyn EventSink>>,
}

impl WorkflowDriver {
    /// Create a driver over a graph with the given classifier
    pub fn new(graph: Arc<StepGraph>, classifier: Arc<dyn ErrorClassifier>) -> Arc<Self> {
        Self::builder(graph).classifier(classifier).build()
    }

    /// Start building a driver with seed scratch and an optional event sink
    pub fn builder(graph: Arc<StepGraph>) -> WorkflowDriverBuilder {
        WorkflowDriverBuilder {
            graph,
            classifier: Arc::new(DefaultClassifier),
            seed: HashMap::new(),
            sink: None,
        }
    }

    /// Identifier of this instance
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Current lifecycle status
    pub async fn status(&self) -> WorkStatus {
        self.state.lock().await.state.status()
    }

    /// Request that the named steps (plus their transitive dependencies)
    /// be driven to completion
    pub async fn request_work<I, S>(&self, steps: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.request_inner(steps.into_iter().map(Into::into).collect(), None)
            .await
    }

    /// Request work and register an observer for the named steps' terminal
    /// outcomes and the settle notification
    pub async fn request_work_with_observer<I, S>(
        &self,
        steps: I,
        observer: Arc<dyn WorkObserver>,
    ) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.request_inner(
            steps.into_iter().map(Into::into).collect(),
            Some(observer),
        )
        .await
    }

    async fn request_inner(
        &self,
        steps: Vec<StepId>,
        observer: Option<Arc<dyn WorkObserver>>,
    ) -> Result<(), EngineError> {
        if steps.is_empty() {
            return Err(EngineError::ValidationError(
                "requested work must name at least one step".to_string(),
            ));
        }
        for step_id in &steps {
            if !self.graph.contains(step_id) {
                return Err(EngineError::UnknownStep(step_id.0.clone()));
            }
        }

        let mut ds = self.state.lock().await;
        match ds.state.status() {
            WorkStatus::Running => {}
            WorkStatus::Disposed => {
                return Err(EngineError::InvalidState(
                    "instance has been disposed".to_string(),
                ))
            }
            WorkStatus::Settled | WorkStatus::Failed => {
                return Err(EngineError::InvalidState(
                    "workflow has already settled".to_string(),
                ))
            }
        }

        let closure = self.graph.closure(&steps);
        ds.state.record_request(closure);

        if let Some(observer) = observer {
            let named: HashSet<StepId> = steps.iter().cloned().collect();
            // Steps that already reached a terminal state under an earlier
            // request are reported to the new observer immediately
            self.deliver_terminal_snapshot(&ds, &named, observer.as_ref());
            ds.observers.push(Registration {
                steps: named,
                observer,
            });
        }

        self.drive(&mut ds);
        self.flush_events(&mut ds);
        Ok(())
    }

    /// Complete the in-flight attempt for a step by step id.
    ///
    /// Completing a step with no attempt in flight (double completion, or a
    /// step that was never issued) is an engine contract violation and is
    /// reported as an error, never silently ignored.
    pub async fn complete(
        &self,
        step_id: &StepId,
        outcome: Result<ScratchValue, ActionError>,
    ) -> Result<(), EngineError> {
        match self.correlator.find_by_step(step_id) {
            Some(request_id) => self.complete_request(request_id, outcome).await,
            None => self.contract_violation(format!(
                "completion for step {} with no attempt in flight",
                step_id
            )),
        }
    }

    /// Complete an attempt by request id: the entry point spawned actions
    /// and out-of-band backend replies use
    pub async fn complete_request(
        &self,
        request_id: RequestId,
        outcome: Result<ScratchValue, ActionError>,
    ) -> Result<(), EngineError> {
        if self.correlator.take_stale(request_id) {
            debug!(
                instance_id = %self.instance_id,
                request_id = %request_id,
                "dropping reply for request retired by reconnect"
            );
            return Ok(());
        }
        let Some(record) = self.correlator.resolve(request_id) else {
            return self.contract_violation(format!(
                "reply for unknown request {}",
                request_id
            ));
        };

        let mut ds = self.state.lock().await;
        if ds.state.status() == WorkStatus::Disposed {
            debug!(
                instance_id = %self.instance_id,
                step_id = %record.step_id,
                "absorbing completion after dispose"
            );
            return Ok(());
        }
        let Some(step) = self.graph.get(&record.step_id) else {
            return self.contract_violation(format!(
                "request {} resolved to step {} which is not in the graph",
                request_id, record.step_id
            ));
        };

        match outcome {
            Ok(value) => {
                debug!(
                    instance_id = %self.instance_id,
                    step_id = %step.id,
                    request_id = %request_id,
                    "step completed"
                );
                ds.state
                    .mark_completed(step.id.clone(), Some(value), &step.output_key)?;
            }
            Err(action_error) => {
                self.apply_failure(&mut ds, step, action_error)?;
            }
        }

        self.drive(&mut ds);
        self.flush_events(&mut ds);
        Ok(())
    }

    /// Route a failed attempt through the workflow's classifier
    fn apply_failure(
        &self,
        ds: &mut DriverState,
        step: &StepDefinition,
        action_error: ActionError,
    ) -> Result<(), EngineError> {
        match self.classifier.classify(&step.id, &action_error) {
            Decision::BusinessOutcome => {
                debug!(
                    instance_id = %self.instance_id,
                    step_id = %step.id,
                    error = %action_error,
                    "error classified as business outcome"
                );
                ds.state.mark_completed(step.id.clone(), None, &step.output_key)?;
            }
            Decision::Retryable => {
                if step.replayable {
                    ReconnectPolicy::on_retryable(&mut ds.state, step);
                } else {
                    // Reissuing a non-idempotent side effect blindly is
                    // worse than failing it
                    warn!(
                        instance_id = %self.instance_id,
                        step_id = %step.id,
                        "retryable error on non-replayable step, escalating to fatal"
                    );
                    ds.state.mark_failed(step.id.clone(), action_error)?;
                }
            }
            Decision::Fatal => {
                warn!(
                    instance_id = %self.instance_id,
                    step_id = %step.id,
                    error = %action_error,
                    "step failed"
                );
                ds.state.mark_failed(step.id.clone(), action_error)?;
            }
        }
        Ok(())
    }

    /// Explicit transport-loss notification; drive passes issue nothing
    /// until connectivity is restored
    pub async fn on_connectivity_lost(&self) {
        let mut ds = self.state.lock().await;
        if ds.state.status() != WorkStatus::Running {
            return;
        }
        ds.state.set_offline();
        self.flush_events(&mut ds);
    }

    /// Connectivity returned: replay every unfinished replayable step and
    /// resume driving
    pub async fn on_connectivity_restored(&self) {
        let mut ds = self.state.lock().await;
        if ds.state.status() != WorkStatus::Running {
            return;
        }
        if ds.state.offline() {
            let demoted =
                ReconnectPolicy::on_restored(&mut ds.state, &self.correlator, &self.graph);
            info!(
                instance_id = %self.instance_id,
                demoted = demoted.len(),
                "connectivity restored"
            );
        }
        self.drive(&mut ds);
        self.flush_events(&mut ds);
    }

    /// Stop all caller-visible effects of this instance.
    ///
    /// Idempotent. In-flight actions are not cancelled (the backend call
    /// may already be committed); their completions are absorbed silently.
    /// After this returns, no observer callback will fire.
    pub async fn dispose(&self) {
        {
            let mut ds = self.state.lock().await;
            if ds.state.status() != WorkStatus::Disposed {
                debug!(instance_id = %self.instance_id, "disposing instance");
                ds.state.set_disposed();
                ds.observers.clear();
            }
        }
        self.guard.revoke();
    }

    /// Watch channel that flips to true when all requested work is done
    pub fn settled(&self) -> watch::Receiver<bool> {
        self.settled_rx.clone()
    }

    /// Wait until every requested step has reached a terminal state
    pub async fn wait_settled(&self) {
        let mut rx = self.settled_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Terminal summary, once settled
    pub async fn settle_report(&self) -> Option<SettleReport> {
        self.state.lock().await.state.settle().cloned()
    }

    /// Current scratch entry for a key
    pub async fn scratch_value(&self, key: &str) -> Option<ScratchValue> {
        self.state.lock().await.state.scratch_value(key).cloned()
    }

    /// Snapshot of in-flight requests with issue timestamps, for
    /// stale-request instrumentation by wrapping layers
    pub fn in_flight(&self) -> Vec<RequestRecord> {
        self.correlator.in_flight()
    }

    /// One drive pass: issue every currently-ready step, then check for
    /// settlement. Re-entrant by construction: always runs under the
    /// serial lock.
    fn drive(&self, ds: &mut DriverState) {
        if ds.state.status() != WorkStatus::Running {
            return;
        }
        if ds.state.offline() {
            debug!(instance_id = %self.instance_id, "offline, drive pass suspended");
            return;
        }

        let mut progressed = true;
        while progressed {
            progressed = false;

            for step in self.graph.steps() {
                if !ds.state.is_requested(&step.id)
                    || ds.state.is_issued(&step.id)
                    || ds.state.is_terminal(&step.id)
                {
                    continue;
                }
                if !step
                    .run_after
                    .iter()
                    .all(|dep| ds.state.satisfies_dependency(dep))
                {
                    continue;
                }
                if let Some(missing) = step
                    .requires
                    .iter()
                    .find(|key| !ds.state.has_scratch(key))
                {
                    if step.optional {
                        debug!(
                            instance_id = %self.instance_id,
                            step_id = %step.id,
                            key = %missing,
                            "input absent, skipping optional step"
                        );
                        ds.state.mark_skipped(step.id.clone());
                        progressed = true;
                    }
                    continue;
                }

                self.issue(ds, step);
                progressed = true;
            }
        }

        self.check_settled(ds);
    }

    /// Dispatch one step's action
    fn issue(&self, ds: &mut DriverState, step: &StepDefinition) {
        let record = self.correlator.track(step.id.clone());
        if let Err(err) = ds.state.mark_issued(step.id.clone(), record.request_id) {
            error!(
                instance_id = %self.instance_id,
                step_id = %step.id,
                error = %err,
                "refusing to issue step"
            );
            self.correlator.resolve(record.request_id);
            return;
        }

        debug!(
            instance_id = %self.instance_id,
            step_id = %step.id,
            request_id = %record.request_id,
            "issuing step"
        );

        let ctx = StepContext {
            instance_id: self.instance_id.clone(),
            step_id: step.id.clone(),
            request_id: record.request_id,
            scratch: ds.state.scratch_view(),
        };
        let action = Arc::clone(&step.action);
        let request_id = record.request_id;
        let Some(driver) = self.weak.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            match action.execute(ctx).await {
                ExecutionResult::Pending => {}
                ExecutionResult::Success(value) => {
                    let _ = driver.complete_request(request_id, Ok(value)).await;
                }
                ExecutionResult::Failure(action_error) => {
                    let _ = driver.complete_request(request_id, Err(action_error)).await;
                }
            }
        });
    }

    /// Settle or stall detection after a drive pass
    fn check_settled(&self, ds: &mut DriverState) {
        if ds.state.status() != WorkStatus::Running || !ds.state.has_requested() {
            return;
        }

        if ds.state.all_requested_terminal() {
            let report = ds.state.settle_report();
            info!(
                instance_id = %self.instance_id,
                completed = report.completed.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "workflow settled"
            );
            ds.state.finish(report);
            let _ = self.settled_tx.send(true);
        } else if !ds.state.has_inflight() && !ds.state.offline() {
            // Quiescent but incomplete: every remaining step is waiting on
            // a dependency or input that can no longer appear
            let report = ds.state.settle_report();
            warn!(
                instance_id = %self.instance_id,
                blocked = report.blocked.len(),
                failed = report.failed.len(),
                "workflow blocked, no step can make progress"
            );
            ds.state.finish(report);
            let _ = self.settled_tx.send(true);
        }
    }

    /// Deliver recorded lifecycle events to the sink and to per-request
    /// observers, under a delivery permit
    fn flush_events(&self, ds: &mut DriverState) {
        let events = ds.state.take_events();
        if events.is_empty() {
            return;
        }
        let Some(_permit) = self.guard.acquire() else {
            return;
        };

        let null = ScratchValue::null();
        for event in &events {
            if let Some(sink) = &self.sink {
                sink.on_event(event);
            }
            match event {
                WorkEvent::StepCompleted {
                    step_id, result, ..
                } => {
                    for registration in &ds.observers {
                        if registration.steps.contains(step_id) {
                            registration.observer.on_step_completed(step_id, result);
                        }
                    }
                }
                WorkEvent::StepSkipped { step_id, .. } => {
                    for registration in &ds.observers {
                        if registration.steps.contains(step_id) {
                            registration.observer.on_step_completed(step_id, &null);
                        }
                    }
                }
                WorkEvent::StepFailed { step_id, error, .. } => {
                    for registration in &ds.observers {
                        if registration.steps.contains(step_id) {
                            registration.observer.on_step_failed(step_id, error);
                        }
                    }
                }
                WorkEvent::Settled { report, .. } => {
                    for registration in &ds.observers {
                        registration.observer.on_settled(report);
                    }
                }
                _ => {}
            }
        }
    }

    /// Report already-terminal steps to an observer registered after the
    /// fact
    fn deliver_terminal_snapshot(
        &self,
        ds: &DriverState,
        named: &HashSet<StepId>,
        observer: &dyn WorkObserver,
    ) {
        let terminal: Vec<&StepId> = named
            .iter()
            .filter(|id| ds.state.is_terminal(id))
            .collect();
        if terminal.is_empty() {
            return;
        }
        let Some(_permit) = self.guard.acquire() else {
            return;
        };

        let null = ScratchValue::null();
        for step_id in terminal {
            if let Some(error) = ds.state.failed_error(step_id) {
                observer.on_step_failed(step_id, error);
                continue;
            }
            let result = self
                .graph
                .get(step_id)
                .and_then(|step| ds.state.scratch_value(&step.output_key));
            observer.on_step_completed(step_id, result.unwrap_or(&null));
        }
    }

    fn contract_violation<T>(&self, message: String) -> Result<T, EngineError> {
        error!(instance_id = %self.instance_id, "{}", message);
        Err(EngineError::ContractViolation(message))
    }
}

/// Builder for [`WorkflowDriver`]
pub struct WorkflowDriverBuilder {
    graph: Arc<StepGraph>,
    classifier: Arc<dyn ErrorClassifier>,
    seed: HashMap<String, ScratchValue>,
    sink: Option<Arc<dyn EventSink>>,
}

impl WorkflowDriverBuilder {
    /// Use a workflow-specific classifier instead of the built-in default
    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Seed a scratch entry before any step runs (the caller's trigger
    /// data, e.g. the invitation being accepted)
    pub fn seed(mut self, key: impl Into<String>, value: ScratchValue) -> Self {
        self.seed.insert(key.into(), value);
        self
    }

    /// Attach an instance-wide lifecycle event sink
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the driver
    pub fn build(self) -> Arc<WorkflowDriver> {
        let state = WorkflowState::new(Arc::clone(&self.graph), self.seed);
        let instance_id = state.id.clone();
        let (settled_tx, settled_rx) = watch::channel(false);

        Arc::new_cyclic(|weak| WorkflowDriver {
            weak: weak.clone(),
            graph: self.graph,
            classifier: self.classifier,
            correlator: RequestCorrelator::new(),
            guard: LifecycleGuard::new(),
            instance_id,
            state: Mutex::new(DriverState {
                state,
                observers: Vec::new(),
            }),
            settled_tx,
            settled_rx,
            sink: self.sink,
        })
    }
}
