//! Domain layer: step graphs, instance state, request correlation, and
//! lifecycle events.

/// Request-id to step correlation
pub mod correlator;

/// Lifecycle events, observers, and settle reports
pub mod events;

/// Per-invocation workflow state
pub mod instance;

/// Step declarations and the validated step graph
pub mod step_graph;
