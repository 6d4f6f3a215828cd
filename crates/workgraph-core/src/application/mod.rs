//! Application layer: the drive loop, error classification, reconnect
//! replay, and callback lifecycle.

/// Error classification tables
pub mod classifier;

/// The re-entrant scheduling engine
pub mod driver;

/// Callback-delivery permits
pub mod lifecycle;

/// Connectivity-loss replay policy
pub mod reconnect;
