//! Testing utilities for workgraph workflows.
//!
//! Provides scripted and controllable step actions, recording observers
//! and event sinks, and small graph-building helpers, so workflow authors
//! can test their graphs the same way the engine tests itself.

pub mod actions;
pub mod builders;
pub mod observers;

/// Re-export for mock-based observer tests
pub use mockall;

pub use actions::{gated, pending, GateHandle, PendingHandle, ScriptedAction};
pub use builders::{chain, fail_with, step, succeed_with};
pub use observers::{ObservedOutcome, RecordingObserver, RecordingSink};
