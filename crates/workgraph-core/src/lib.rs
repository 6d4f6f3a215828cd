//!
//! Workgraph Core - step-dependency workflow engine
//!
//! This crate drives a bounded set of named asynchronous steps to
//! completion: later steps depend on data produced by earlier ones, some
//! steps are optional, attempts can be lost to connectivity failures and
//! are replayed after reconnect, and every requested step's terminal
//! outcome is reported exactly once. It generalizes the issued/completed
//! flag pattern that multi-step backend services otherwise re-implement by
//! hand.
//!
//! Declare steps with [`StepDefinition`], validate them into a
//! [`StepGraph`], then run instances through a [`WorkflowDriver`]:
//! `request_work` names the outcomes the caller wants, actions complete
//! asynchronously, and the settle notification fires once all requested
//! work is done.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - step graphs, instance state, correlation, events
pub mod domain;

/// Application services - drive loop, classification, reconnect, lifecycle
pub mod application;

/// Core value types
pub mod types;

/// Error types
pub mod error;

// Re-export the main API surface
pub use application::classifier::{
    ClassifierTable, ClassifierTableBuilder, DefaultClassifier, Decision, ErrorClassifier,
};
pub use application::driver::{WorkflowDriver, WorkflowDriverBuilder};
pub use application::lifecycle::{DeliveryPermit, LifecycleGuard};
pub use application::reconnect::ReconnectPolicy;
pub use domain::correlator::{RequestCorrelator, RequestRecord};
pub use domain::events::{EventSink, SettleReport, SettleStatus, WorkEvent, WorkObserver};
pub use domain::instance::{WorkStatus, WorkflowState};
pub use domain::step_graph::{
    action_fn, ExecutionResult, StepAction, StepContext, StepDefinition, StepGraph, StepId,
};
pub use error::{ActionError, ActionErrorKind, EngineError};
pub use types::{InstanceId, RequestId, ScratchValue, ScratchView};
