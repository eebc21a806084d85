//! Execution primitives shared by the pipeline and the orchestrator.
//!
//! - Immutable [`Sample`] inputs shared read-only across contributions
//! - [`SolverIndex`] with the inactive-level sentinel
//! - Task dispatch ([`dispatch`]) and deterministic sample generation ([`rng`])

pub mod dispatch;
pub mod rng;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use dispatch::{InlineRuntime, TaskFuture, TaskRuntime, WorkStealingRuntime};
pub use rng::{SampleDistribution, SampleRng};

/// One random draw fed to the simulation.
///
/// Cloning is cheap and yields a handle to the same read-only data, which is
/// how the contributions of one instance share their input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample(Arc<[f64]>);

impl Sample {
    /// Wrap a vector of random components.
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        Self(values.into())
    }

    /// Random components.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the sample has no components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Component `i`, or `default` when the sample is shorter.
    #[must_use]
    pub fn component_or(&self, i: usize, default: f64) -> f64 {
        self.0.get(i).copied().unwrap_or(default)
    }
}

impl From<Vec<f64>> for Sample {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

/// Multi-index identifying the level a wrapper instance works on.
///
/// Any negative component marks an inactive placeholder level whose solves
/// contribute zeros. An empty index means plain Monte Carlo at level 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverIndex(Vec<i64>);

impl SolverIndex {
    /// Create an index, normalising an empty list to `[0]`.
    #[must_use]
    pub fn new(components: Vec<i64>) -> Self {
        if components.is_empty() {
            Self(vec![0])
        } else {
            Self(components)
        }
    }

    /// Level 0 index.
    #[must_use]
    pub fn coarsest() -> Self {
        Self(vec![0])
    }

    /// Whether every component is non-negative.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.0.iter().all(|&c| c >= 0)
    }

    /// Refinement level of an active index (its first component).
    #[must_use]
    pub fn level(&self) -> Option<usize> {
        if self.is_active() {
            self.0.first().and_then(|&c| usize::try_from(c).ok())
        } else {
            None
        }
    }

    /// Raw components.
    #[must_use]
    pub fn components(&self) -> &[i64] {
        &self.0
    }
}

impl Default for SolverIndex {
    fn default() -> Self {
        Self::coarsest()
    }
}

impl std::fmt::Display for SolverIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
