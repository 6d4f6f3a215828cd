//! Small helpers for assembling step graphs in tests.

use std::sync::Arc;
use workgraph_core::{
    action_fn, ActionError, ExecutionResult, ScratchValue, StepAction, StepDefinition,
};

/// Shorthand for a step over a boxed action
pub fn step(id: &str, action: Arc<dyn StepAction>) -> StepDefinition {
    StepDefinition::new(id, action)
}

/// Action that immediately succeeds with the given JSON value
pub fn succeed_with(value: serde_json::Value) -> Arc<dyn StepAction> {
    action_fn(move |_ctx| {
        let value = value.clone();
        async move { ExecutionResult::Success(ScratchValue::new(value)) }
    })
}

/// Action that immediately fails with the given error
pub fn fail_with(error: ActionError) -> Arc<dyn StepAction> {
    action_fn(move |_ctx| {
        let error = error.clone();
        async move { ExecutionResult::Failure(error) }
    })
}

/// Wire the steps into a linear chain: each step runs after the previous
/// one and requires its output
pub fn chain(defs: Vec<StepDefinition>) -> Vec<StepDefinition> {
    let mut chained = Vec::with_capacity(defs.len());
    let mut previous: Option<(workgraph_core::StepId, String)> = None;

    for def in defs {
        let next_previous = (def.id.clone(), def.output_key.clone());
        let def = match previous.take() {
            Some((prev_id, prev_output)) => def.after(prev_id).needs(prev_output),
            None => def,
        };
        previous = Some(next_previous);
        chained.push(def);
    }

    chained
}
