use crate::error::{ActionError, EngineError};
use crate::types::{InstanceId, RequestId, ScratchValue, ScratchView};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Value object: step identifier, unique within a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        StepId(id.to_string())
    }
}

impl From<String> for StepId {
    fn from(id: String) -> Self {
        StepId(id)
    }
}

/// Result of one step action attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// The action finished and produced a value for the scratch bag
    Success(ScratchValue),
    /// The action failed with a backend error
    Failure(ActionError),
    /// The reply will arrive later through
    /// [`WorkflowDriver::complete_request`](crate::application::driver::WorkflowDriver::complete_request)
    Pending,
}

/// Context handed to an action for one attempt.
///
/// Carries a scratch snapshot taken at issue time plus the identifiers an
/// external backend needs to route its reply back.
#[derive(Clone, Debug)]
pub struct StepContext {
    /// The workflow instance this attempt belongs to
    pub instance_id: InstanceId,
    /// The step being attempted
    pub step_id: StepId,
    /// The request id an out-of-band reply must carry
    pub request_id: RequestId,
    /// Snapshot of the scratch bag at issue time
    pub scratch: ScratchView,
}

/// One named asynchronous unit of work.
///
/// Implementations perform the backend operation and either return the
/// outcome directly or return [`ExecutionResult::Pending`] and deliver the
/// outcome later via the driver's completion entry point.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Perform one attempt of the step
    async fn execute(&self, ctx: StepContext) -> ExecutionResult;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> StepAction for FnAction<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = ExecutionResult> + Send,
{
    async fn execute(&self, ctx: StepContext) -> ExecutionResult {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`StepAction`]
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn StepAction>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionResult> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// Declaration of one step in a graph
#[derive(Clone)]
pub struct StepDefinition {
    /// Step identity
    pub id: StepId,

    /// Steps that must reach a successful terminal state before this one
    /// can be issued
    pub run_after: Vec<StepId>,

    /// Scratch keys that must be present before this step can be issued
    pub requires: Vec<String>,

    /// Scratch key the step's successful result is stored under
    pub output_key: String,

    /// Skip the step (terminal, not-applicable) when a required scratch
    /// key is absent once its dependencies are terminal
    pub optional: bool,

    /// Whether the step may be demoted and reissued after a connectivity
    /// loss. Steps with non-idempotent side effects and no already-applied
    /// check must opt out.
    pub replayable: bool,

    /// The asynchronous action the step performs
    pub action: Arc<dyn StepAction>,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("run_after", &self.run_after)
            .field("requires", &self.requires)
            .field("output_key", &self.output_key)
            .field("optional", &self.optional)
            .field("replayable", &self.replayable)
            .finish()
    }
}

impl StepDefinition {
    /// Create a step with no dependencies, storing its result under its
    /// own id
    pub fn new(id: impl Into<StepId>, action: Arc<dyn StepAction>) -> Self {
        let id = id.into();
        let output_key = id.0.clone();
        Self {
            id,
            run_after: Vec::new(),
            requires: Vec::new(),
            output_key,
            optional: false,
            replayable: true,
            action,
        }
    }

    /// Require another step to be terminal before this one is issued
    pub fn after(mut self, dep: impl Into<StepId>) -> Self {
        self.run_after.push(dep.into());
        self
    }

    /// Require a scratch key to be present before this step is issued
    pub fn needs(mut self, key: impl Into<String>) -> Self {
        self.requires.push(key.into());
        self
    }

    /// Store the step's result under a different scratch key
    pub fn stores_as(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    /// Mark the step optional: an absent required input skips it instead
    /// of blocking the workflow
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Opt the step out of reconnect replay
    pub fn non_replayable(mut self) -> Self {
        self.replayable = false;
        self
    }
}

/// Immutable, validated set of steps shared by every instance of one
/// workflow type.
///
/// Built once via [`StepGraph::build`]; construction fails (with an error,
/// never a panic) on duplicate ids, unresolved dependencies, duplicate
/// output keys, or dependency cycles.
#[derive(Debug)]
pub struct StepGraph {
    steps: Vec<StepDefinition>,
    index: HashMap<StepId, usize>,
}

impl StepGraph {
    /// Validate the step declarations and build the graph
    pub fn build(steps: Vec<StepDefinition>) -> Result<Arc<StepGraph>, EngineError> {
        if steps.is_empty() {
            return Err(EngineError::ValidationError(
                "graph must have at least one step".to_string(),
            ));
        }

        // Id uniqueness
        let mut index = HashMap::with_capacity(steps.len());
        for (position, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), position).is_some() {
                return Err(EngineError::ValidationError(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }

        // Output key uniqueness: two producers for one scratch key would
        // make readiness and replay clearing ambiguous
        let mut outputs = HashSet::with_capacity(steps.len());
        for step in &steps {
            if !outputs.insert(step.output_key.as_str()) {
                return Err(EngineError::ValidationError(format!(
                    "duplicate output key: {}",
                    step.output_key
                )));
            }
        }

        // run_after references must resolve
        for step in &steps {
            for dep in &step.run_after {
                if !index.contains_key(dep) {
                    return Err(EngineError::ValidationError(format!(
                        "step {} references non-existent dependency: {}",
                        step.id, dep
                    )));
                }
            }
        }

        let graph = StepGraph { steps, index };
        graph.check_for_cycles()?;
        Ok(Arc::new(graph))
    }

    /// Steps in declaration order (the drive-pass evaluation order)
    pub fn steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter()
    }

    /// Look up a step by id
    pub fn get(&self, id: &StepId) -> Option<&StepDefinition> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// Check whether a step id is part of the graph
    pub fn contains(&self, id: &StepId) -> bool {
        self.index.contains_key(id)
    }

    /// All step ids, in declaration order
    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// Number of steps in the graph
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the graph has no steps (never true for a built graph)
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The given steps plus their transitive `run_after` dependencies.
    ///
    /// Requesting a step implicitly requests everything it depends on;
    /// this computes that closure.
    pub fn closure(&self, roots: &[StepId]) -> HashSet<StepId> {
        let mut reached = HashSet::new();
        let mut pending: Vec<&StepId> = roots.iter().collect();

        while let Some(id) = pending.pop() {
            if !reached.insert(id.clone()) {
                continue;
            }
            if let Some(step) = self.get(id) {
                pending.extend(step.run_after.iter());
            }
        }

        reached
    }

    /// Check for cycles in the step dependencies
    fn check_for_cycles(&self) -> Result<(), EngineError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for step in &self.steps {
            if self.is_cyclic(&step.id, &mut visited, &mut rec_stack) {
                return Err(EngineError::ValidationError(format!(
                    "cycle detected in step dependencies involving step: {}",
                    step.id
                )));
            }
        }

        Ok(())
    }

    /// DFS cycle detection over `run_after` edges
    fn is_cyclic<'a>(
        &'a self,
        step_id: &'a StepId,
        visited: &mut HashSet<&'a StepId>,
        rec_stack: &mut HashSet<&'a StepId>,
    ) -> bool {
        if !visited.contains(step_id) {
            visited.insert(step_id);
            rec_stack.insert(step_id);

            if let Some(step) = self.get(step_id) {
                for dep in &step.run_after {
                    if (!visited.contains(dep) && self.is_cyclic(dep, visited, rec_stack))
                        || rec_stack.contains(dep)
                    {
                        return true;
                    }
                }
            }
        }

        rec_stack.remove(step_id);
        false
    }
}
