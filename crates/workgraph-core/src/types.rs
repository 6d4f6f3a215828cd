use crate::error::ActionError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// A single value produced by a step, stored in the instance scratch bag.
///
/// This is a wrapper around a JSON value with typed helpers, so that steps
/// can exchange structured data without the engine knowing the caller's
/// domain types.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScratchValue {
    value: serde_json::Value,
}

impl ScratchValue {
    /// Create a scratch value from a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Create a null scratch value (the "legitimately nothing" result)
    #[inline]
    pub fn null() -> Self {
        Self {
            value: serde_json::Value::Null,
        }
    }

    /// Check whether the value is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Borrow the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Try to convert the value to a string slice
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Deserialize the value into a caller-supplied type
    pub fn decode<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Serialize a caller-supplied value into a scratch value
    pub fn encode<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Create a scratch value holding a plain string
    #[inline]
    pub fn from_string(s: &str) -> Self {
        Self::new(serde_json::Value::String(s.to_string()))
    }
}

/// Read-only snapshot of the scratch bag, handed to step actions.
///
/// Actions never see live instance state; they get a copy taken at issue
/// time, so a concurrently completing step cannot change an action's inputs
/// under it.
#[derive(Clone, Debug, Default)]
pub struct ScratchView {
    entries: HashMap<String, ScratchValue>,
}

impl ScratchView {
    pub(crate) fn new(entries: HashMap<String, ScratchValue>) -> Self {
        Self { entries }
    }

    /// Look up a scratch entry by key
    pub fn get(&self, key: &str) -> Option<&ScratchValue> {
        self.entries.get(key)
    }

    /// Look up a scratch entry, failing with a backend error if absent
    pub fn require(&self, key: &str) -> Result<&ScratchValue, ActionError> {
        self.entries
            .get(key)
            .ok_or_else(|| ActionError::Backend(format!("missing scratch input: {}", key)))
    }

    /// Look up and deserialize a scratch entry in one go
    pub fn decode<T>(&self, key: &str) -> Result<T, ActionError>
    where
        T: DeserializeOwned,
    {
        self.require(key)?
            .decode()
            .map_err(|e| ActionError::Backend(format!("scratch input {}: {}", key, e)))
    }

    /// Check whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries in the snapshot
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Value object: identifier of one issued request.
///
/// Allocated by the [`RequestCorrelator`](crate::domain::correlator::RequestCorrelator)
/// when a step is dispatched; asynchronous replies carry it back so the
/// engine can resolve which step they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value object: identifier of one workflow instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Generate a fresh random instance id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
