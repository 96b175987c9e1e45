use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{EntityError, PreconditionError};

/// Result alias for operations that can only fail on a precondition.
pub type CollectResult<T> = std::result::Result<T, PreconditionError>;

/// Stable, opaque identifier of a remotely-managed entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityHandle(String);

impl EntityHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One entity whose detail and metrics were both fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedResult<D, M> {
    pub handle: EntityHandle,
    pub detail: D,
    pub metrics: M,
}

/// Outcome of a fan-out batch: every submitted entity lands in exactly one
/// of the two lists.
#[derive(Debug)]
pub struct Collection<D, M> {
    pub results: Vec<CollectedResult<D, M>>,
    pub errors: Vec<EntityError>,
}

impl<D, M> Collection<D, M> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            results: Vec::with_capacity(capacity),
            errors: Vec::new(),
        }
    }

    /// Total number of entities accounted for.
    pub fn total(&self) -> usize {
        self.results.len() + self.errors.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Orders results and errors by handle for presentation.
    pub fn sort_by_handle(&mut self) {
        self.results.sort_by(|a, b| a.handle.cmp(&b.handle));
        self.errors.sort_by(|a, b| a.handle().cmp(b.handle()));
    }
}

impl<D, M> Default for Collection<D, M> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}
