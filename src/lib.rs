//! # mlmc-wrapper
//!
//! Distributed sample execution and state serialization for a multilevel
//! Monte Carlo solver wrapper.
//!
//! A wrapper instance is bound to one solver index (one refinement level).
//! It serializes the base model once, then answers `solve(sample)` requests
//! by running the refinement chain up to its level, solving there, and
//! unfolding the flat quantity-of-interest vector into the partition the
//! caller expects.
//!
//! ## Example
//!
//! ```rust
//! use mlmc_wrapper::prelude::*;
//!
//! let unfolder = Unfolder::new(OutputDimension::derive(5, 2).unwrap());
//! let raw = RawContribution::new(vec![1.0, 2.0, 3.0, 4.0, 5.0], 0.5);
//! let result = unfolder.unfold(&raw).unwrap();
//! assert_eq!(result.parts(), &[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0]]);
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::suboptimal_flops,
    clippy::imprecise_flops,
    clippy::too_many_lines,
    clippy::too_many_arguments,
    clippy::missing_const_for_fn,
    clippy::needless_range_loop,
    clippy::manual_midpoint,
)]

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod refinement;
pub mod scenario;
pub mod state;
pub mod unfold;
pub mod wrapper;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{RefinementStrategy, WrapperConfig, WrapperConfigBuilder};
    pub use crate::engine::{
        InlineRuntime, Sample, SampleDistribution, SampleRng, SolverIndex, TaskRuntime,
        WorkStealingRuntime,
    };
    pub use crate::error::{WrapperError, WrapperResult};
    pub use crate::scenario::{
        BenchmarkScenario, Parameters, RefinementParameters, SimulationScenario, SolveContext,
    };
    pub use crate::state::{LevelArena, SerializedState, StateCodec, StateKey};
    pub use crate::unfold::{AggregatedResult, OutputDimension, RawContribution, Unfolder};
    pub use crate::wrapper::{Lifecycle, MeshParameters, SolverWrapper};
}

/// Re-export for public API
pub use error::{WrapperError, WrapperResult};
