use crate::domain::step_graph::StepId;
use crate::types::RequestId;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// One in-flight request: which step issued it and when
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    /// The allocated request id
    pub request_id: RequestId,
    /// The step that issued the request
    pub step_id: StepId,
    /// When the request was dispatched, for stale-request instrumentation
    pub issued_at: DateTime<Utc>,
}

/// Maps opaque request ids to the steps that issued them.
///
/// This is the one structure in the engine that is touched from arbitrary
/// worker threads: an action's completion resolves its request id here
/// before handing control back to the instance's serial context.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    records: DashMap<RequestId, RequestRecord>,
    stale: DashSet<RequestId>,
    next: AtomicU64,
}

impl RequestCorrelator {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id for a step dispatch and start tracking it
    pub fn track(&self, step_id: StepId) -> RequestRecord {
        let request_id = RequestId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let record = RequestRecord {
            request_id,
            step_id,
            issued_at: Utc::now(),
        };
        self.records.insert(request_id, record.clone());
        record
    }

    /// Resolve a reply: remove and return the matching record
    pub fn resolve(&self, request_id: RequestId) -> Option<RequestRecord> {
        self.records.remove(&request_id).map(|(_, record)| record)
    }

    /// Find the in-flight request for a step, if any
    pub fn find_by_step(&self, step_id: &StepId) -> Option<RequestId> {
        self.records
            .iter()
            .find(|entry| &entry.value().step_id == step_id)
            .map(|entry| *entry.key())
    }

    /// Stop tracking a request that was demoted for replay; a late reply
    /// for it will be dropped instead of reported as a contract violation
    pub fn retire(&self, request_id: RequestId) -> Option<RequestRecord> {
        let removed = self.resolve(request_id);
        if removed.is_some() {
            self.stale.insert(request_id);
        }
        removed
    }

    /// Check-and-clear whether a request id was retired
    pub fn take_stale(&self, request_id: RequestId) -> bool {
        self.stale.remove(&request_id).is_some()
    }

    /// Snapshot of all in-flight requests, issue timestamps included
    pub fn in_flight(&self) -> Vec<RequestRecord> {
        self.records
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of in-flight requests
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no requests are in flight
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
