//! Solver wrapper: one Monte Carlo level instance.
//!
//! Lifecycle:
//!
//! ```text
//! Constructed --serialize--> Serialized --mesh parameters--> Ready --dispose--> Disposed
//! ```
//!
//! Synchronous wrappers serialize during construction; asynchronous ones wait
//! for an explicit [`SolverWrapper::serialize`]. An inactive solver index
//! never serializes and goes straight to `Ready`, its solves return zeros.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{RefinementStrategy, WrapperConfig};
use crate::engine::{Sample, SolverIndex, TaskRuntime};
use crate::error::{WrapperError, WrapperResult};
use crate::executor::{ExecutionPlan, QoiWriter, SampleExecutor};
use crate::refinement::{ChainPolicy, RefinementPipeline};
use crate::scenario::{Parameters, RefinementParameters, SimulationScenario, USE_INPUT_MODEL_PART};
use crate::state::{LevelArena, StateCodec, StateKey};
use crate::unfold::{AggregatedResult, RawContribution, Unfolder};

/// Wrapper lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Built, nothing serialized yet.
    Constructed,
    /// Base states serialized, mesh parameters pending.
    Serialized,
    /// Accepting solves.
    Ready,
    /// States released; terminal.
    Disposed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Constructed => "Constructed",
            Self::Serialized => "Serialized",
            Self::Ready => "Ready",
            Self::Disposed => "Disposed",
        };
        f.write_str(name)
    }
}

/// Mesh size of the current level and its inverse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshParameters {
    /// Characteristic mesh size `h`.
    pub mesh_size: f64,
    /// Mesh parameter `1 / h`.
    pub mesh_parameter: f64,
}

impl MeshParameters {
    /// Build from a mesh size.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `mesh_size` is not positive and
    /// finite.
    pub fn from_size(mesh_size: f64) -> WrapperResult<Self> {
        if !(mesh_size.is_finite() && mesh_size > 0.0) {
            return Err(WrapperError::config(format!(
                "estimated mesh size must be positive and finite, got {mesh_size}"
            )));
        }
        Ok(Self {
            mesh_size,
            mesh_parameter: mesh_size.recip(),
        })
    }
}

/// Orchestrates serialization, execution and aggregation for one level.
pub struct SolverWrapper<S: SimulationScenario, R: TaskRuntime> {
    config: WrapperConfig,
    scenario: Arc<S>,
    runtime: Arc<R>,
    codec: StateCodec,
    index: SolverIndex,
    unfolder: Unfolder,
    project_parameters: Vec<Parameters>,
    refinement: Option<RefinementParameters>,
    executor: Option<SampleExecutor<S>>,
    mesh: Option<MeshParameters>,
    lifecycle: Lifecycle,
}

impl<S: SimulationScenario, R: TaskRuntime> fmt::Debug for SolverWrapper<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolverWrapper")
            .field("strategy", &self.config.refinement_strategy)
            .field("index", &self.index)
            .field("runtime", &self.runtime.name())
            .field("lifecycle", &self.lifecycle)
            .field("mesh", &self.mesh)
            .finish_non_exhaustive()
    }
}

impl<S: SimulationScenario, R: TaskRuntime> SolverWrapper<S, R> {
    /// Build a wrapper, loading project and refinement parameter files named
    /// by the configuration.
    ///
    /// # Errors
    ///
    /// Returns an I/O or configuration error if a parameter file cannot be
    /// loaded, plus everything [`SolverWrapper::with_parameters`] returns.
    pub fn new(config: WrapperConfig, scenario: Arc<S>, runtime: Arc<R>) -> WrapperResult<Self> {
        let project_parameters = config
            .project_parameters_path
            .iter()
            .map(Parameters::load)
            .collect::<WrapperResult<Vec<_>>>()?;
        let refinement = config
            .refinement_parameters_path
            .as_deref()
            .map(RefinementParameters::load)
            .transpose()?;
        Self::with_parameters(config, scenario, runtime, project_parameters, refinement)
    }

    /// Parse a YAML configuration and build a wrapper from it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid document (including an
    /// unknown refinement strategy) before the engine is touched.
    pub fn from_yaml(yaml: &str, scenario: Arc<S>, runtime: Arc<R>) -> WrapperResult<Self> {
        Self::new(WrapperConfig::from_yaml(yaml)?, scenario, runtime)
    }

    /// Load a configuration file and build a wrapper from it.
    ///
    /// # Errors
    ///
    /// See [`WrapperConfig::load`] and [`SolverWrapper::new`].
    pub fn load<P: AsRef<Path>>(path: P, scenario: Arc<S>, runtime: Arc<R>) -> WrapperResult<Self> {
        Self::new(WrapperConfig::load(path)?, scenario, runtime)
    }

    /// Build a wrapper from in-memory parameters.
    ///
    /// Synchronous wrappers serialize immediately.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the output shape is invalid, the
    /// parameters do not match the strategy, or serialization fails.
    pub fn with_parameters(
        config: WrapperConfig,
        scenario: Arc<S>,
        runtime: Arc<R>,
        project_parameters: Vec<Parameters>,
        refinement: Option<RefinementParameters>,
    ) -> WrapperResult<Self> {
        let unfolder = Unfolder::new(config.output_dimension()?);
        let index = config.solver_index();
        let strategy = config.refinement_strategy;

        if project_parameters.is_empty() {
            return Err(WrapperError::config("no project parameters given"));
        }
        if strategy.is_adaptive() && refinement.is_none() {
            return Err(WrapperError::config(format!(
                "refinementStrategy '{strategy}' requires refinement parameters"
            )));
        }
        if strategy == RefinementStrategy::ReadingFromFile {
            if let Some(level) = index.level() {
                if level >= project_parameters.len() {
                    return Err(WrapperError::config(format!(
                        "solverWrapperIndex level {level} has no project parameters \
                         ({} given for reading_from_file)",
                        project_parameters.len()
                    )));
                }
            }
        }

        let mut wrapper = Self {
            codec: StateCodec::new(config.compression_level),
            config,
            scenario,
            runtime,
            index,
            unfolder,
            project_parameters,
            refinement,
            executor: None,
            mesh: None,
            lifecycle: Lifecycle::Constructed,
        };

        if !wrapper.config.asynchronous {
            wrapper.serialize()?;
        }
        Ok(wrapper)
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &WrapperConfig {
        &self.config
    }

    /// Solver index of this instance.
    #[must_use]
    pub const fn index(&self) -> &SolverIndex {
        &self.index
    }

    /// Output partition.
    #[must_use]
    pub const fn unfolder(&self) -> &Unfolder {
        &self.unfolder
    }

    /// Mesh parameters of the current level, once computed.
    #[must_use]
    pub const fn mesh_parameters(&self) -> Option<MeshParameters> {
        self.mesh
    }

    /// Compressed bytes held in serialized states.
    #[must_use]
    pub fn stored_bytes(&self) -> usize {
        self.executor.as_ref().map_or(0, |e| e.plan().stored_bytes())
    }

    fn require(&self, expected: Lifecycle) -> WrapperResult<()> {
        if self.lifecycle == expected {
            Ok(())
        } else {
            Err(WrapperError::invalid_state(
                expected.to_string(),
                self.lifecycle.to_string(),
            ))
        }
    }

    /// Serialize base states and compute mesh parameters.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the wrapper is `Constructed`, and any
    /// engine or state store error raised while building the states. On
    /// error the wrapper stays `Constructed` and may be serialized again.
    pub fn serialize(&mut self) -> WrapperResult<()> {
        self.require(Lifecycle::Constructed)?;

        let Some(level) = self.index.level() else {
            debug!(index = %self.index, "inactive level, skipping serialization");
            self.lifecycle = Lifecycle::Ready;
            return Ok(());
        };

        let plan = self.build_plan(level)?;
        let mut executor = SampleExecutor::new(
            Arc::clone(&self.scenario),
            self.codec,
            plan,
            self.config.number_of_scalar_outputs(),
        );
        if self.config.print_to_file {
            executor = executor.with_writer(QoiWriter::new(&self.config.output_directory));
        }
        info!(
            strategy = %self.config.refinement_strategy,
            level,
            bytes = executor.plan().stored_bytes(),
            "serialized base states"
        );
        self.lifecycle = Lifecycle::Serialized;

        let mesh = match self.compute_mesh_parameters(&executor, level) {
            Ok(mesh) => mesh,
            Err(e) => {
                executor.release();
                self.lifecycle = Lifecycle::Constructed;
                return Err(e);
            }
        };
        info!(level, h = mesh.mesh_size, "computed mesh parameters");
        self.executor = Some(executor);
        self.mesh = Some(mesh);
        self.lifecycle = Lifecycle::Ready;
        Ok(())
    }

    /// Project parameters rewritten to reuse the deserialized model.
    fn prepared_parameters(&self) -> Vec<Parameters> {
        self.project_parameters
            .iter()
            .cloned()
            .map(|mut p| {
                p.set_model_import_input_type(USE_INPUT_MODEL_PART);
                p
            })
            .collect()
    }

    fn refinement_parameters(&self) -> WrapperResult<&RefinementParameters> {
        self.refinement.as_ref().ok_or_else(|| {
            WrapperError::config(format!(
                "refinementStrategy '{}' requires refinement parameters",
                self.config.refinement_strategy
            ))
        })
    }

    fn build_pipeline(&self, parameters: &Parameters) -> WrapperResult<RefinementPipeline<S>> {
        let run_id = self.config.run_id;
        let fake = self.config.fake_sample();
        let model = self.scenario.initialize(parameters, &fake)?;
        let refinement = self.refinement_parameters()?;
        Ok(RefinementPipeline::new(
            Arc::clone(&self.scenario),
            self.codec,
            run_id,
            ChainPolicy {
                jump_to_finest: self.config.adaptive_refinement_jump_to_finest_level,
                mapping: self.config.mapping_output_quantities,
            },
            self.codec.encode(StateKey::new(run_id, 0), &model)?,
            self.codec.encode(StateKey::new(run_id, 0), parameters)?,
            self.codec.encode(StateKey::new(run_id, 0), refinement)?,
        ))
    }

    fn build_plan(&self, level: usize) -> WrapperResult<ExecutionPlan<S>> {
        let run_id = self.config.run_id;
        let parameters = self.prepared_parameters();
        let base_parameters = parameters
            .first()
            .ok_or_else(|| WrapperError::config("no project parameters given"))?;

        match self.config.refinement_strategy {
            RefinementStrategy::StochasticAdaptiveRefinement => Ok(ExecutionPlan::Stochastic {
                pipeline: self.build_pipeline(base_parameters)?,
                different_tasks: self.config.different_tasks(),
            }),
            RefinementStrategy::DeterministicAdaptiveRefinement => {
                let pipeline = self.build_pipeline(base_parameters)?;
                let mut models = LevelArena::new(run_id);
                for state in pipeline.precompute_levels(level, &self.config.fake_sample())? {
                    models.push(state)?;
                }
                Ok(ExecutionPlan::Deterministic {
                    models,
                    parameters: self.codec.encode(StateKey::new(run_id, 0), base_parameters)?,
                    mapping: self.config.mapping_output_quantities,
                })
            }
            RefinementStrategy::ReadingFromFile => {
                let fake = self.config.fake_sample();
                let mut models = LevelArena::new(run_id);
                let mut stored_parameters = LevelArena::new(run_id);
                for (i, p) in parameters.iter().enumerate() {
                    let model = self.scenario.initialize(p, &fake)?;
                    models.push(self.codec.encode(StateKey::new(run_id, i), &model)?)?;
                    stored_parameters.push(self.codec.encode(StateKey::new(run_id, i), p)?)?;
                }
                Ok(ExecutionPlan::ReadingFromFile {
                    models,
                    parameters: stored_parameters,
                    mapping: self.config.mapping_output_quantities,
                })
            }
        }
    }

    fn compute_mesh_parameters(
        &self,
        executor: &SampleExecutor<S>,
        level: usize,
    ) -> WrapperResult<MeshParameters> {
        let size = match executor.plan() {
            ExecutionPlan::Stochastic { pipeline, .. } => {
                let model: S::Model = self.codec.decode(pipeline.base_model())?;
                self.scenario
                    .estimate_mesh_size(&model, self.refinement_parameters()?, level)?
            }
            ExecutionPlan::Deterministic { models, .. } => {
                let model: S::Model = self.codec.decode(models.get(level)?)?;
                self.scenario
                    .estimate_mesh_size(&model, self.refinement_parameters()?, level)?
            }
            ExecutionPlan::ReadingFromFile { models, .. } => {
                let model: S::Model = self.codec.decode(models.get(level)?)?;
                let refinement = self.refinement.clone().unwrap_or_default();
                self.scenario.estimate_mesh_size(&model, &refinement, level)?
            }
        };
        MeshParameters::from_size(size)
    }

    /// Run one sample and return the shaped quantities of interest with the
    /// elapsed time in seconds.
    ///
    /// With several contributions per instance, plain QoI are averaged,
    /// combined QoI are summed and elapsed times are summed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless `Ready`, `RefinementFailure` if the
    /// sample failed (retryable), and `ShapeMismatch` if the engine output
    /// has the wrong width.
    pub fn solve(&self, sample: Sample) -> WrapperResult<(AggregatedResult, f64)> {
        self.require(Lifecycle::Ready)?;

        let Some(executor) = self.executor.as_ref() else {
            debug!(index = %self.index, "inactive level, returning zero quantities");
            let zeros = RawContribution::zeros(self.config.number_of_scalar_outputs());
            return Ok((self.unfolder.unfold(&zeros)?, 0.0));
        };

        let contributions = self.config.number_contributions_per_instance;
        let raw = executor.execute_all(self.runtime.as_ref(), &self.index, &sample, contributions)?;
        let elapsed = raw.iter().map(|r| r.elapsed).sum();

        let result = match raw.as_slice() {
            [single] => self.unfolder.unfold(single)?,
            many => self.unfolder.postprocess_contributions(
                many,
                self.config.number_qoi,
                self.config.number_combined_qoi,
            )?,
        };
        debug!(
            index = %self.index,
            contributions,
            elapsed,
            runtime = self.runtime.name(),
            "sample solved"
        );
        Ok((result, elapsed))
    }

    /// Release every serialized state. Terminal.
    pub fn dispose(&mut self) {
        if let Some(mut executor) = self.executor.take() {
            executor.release();
        }
        self.mesh = None;
        self.lifecycle = Lifecycle::Disposed;
        debug!(index = %self.index, "wrapper disposed");
    }
}
