//! Sample executor: one realization per contribution.
//!
//! The execution plan is resolved once from the refinement strategy:
//!
//! | Strategy | Solved state |
//! |---|---|
//! | `reading_from_file` | stored model and parameters of level L |
//! | `deterministic_adaptive_refinement` | stored, precomputed model of level L |
//! | `stochastic_adaptive_refinement` | refinement chain recomputed per sample |
//!
//! An inactive solver index short-circuits to a zero contribution without
//! touching the engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::engine::{Sample, SolverIndex, TaskRuntime};
use crate::error::{WrapperError, WrapperResult};
use crate::refinement::{ChainOutput, RefinementPipeline};
use crate::scenario::{Parameters, SimulationScenario, SolveContext};
use crate::state::{LevelArena, SerializedState, StateCodec};
use crate::unfold::RawContribution;

/// How the model of the current level is obtained, resolved once.
pub enum ExecutionPlan<S: SimulationScenario> {
    /// Chain recomputed per sample.
    Stochastic {
        /// Chain driver holding the serialized base state.
        pipeline: RefinementPipeline<S>,
        /// Dispatch one task per level instead of one per chain.
        different_tasks: bool,
    },
    /// Levels precomputed once with the fake sample.
    Deterministic {
        /// Pre-solve model of every level `0..=L`.
        models: LevelArena,
        /// Project parameters shared by all levels.
        parameters: SerializedState,
        /// Map outputs onto the level-0 model.
        mapping: bool,
    },
    /// One stored model and parameter set per level.
    ReadingFromFile {
        /// Model of every level.
        models: LevelArena,
        /// Project parameters of every level.
        parameters: LevelArena,
        /// Map outputs onto the level-0 model.
        mapping: bool,
    },
}

impl<S: SimulationScenario> ExecutionPlan<S> {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Stochastic { .. } => "stochastic_adaptive_refinement",
            Self::Deterministic { .. } => "deterministic_adaptive_refinement",
            Self::ReadingFromFile { .. } => "reading_from_file",
        }
    }

    /// Total compressed bytes held by the plan.
    #[must_use]
    pub fn stored_bytes(&self) -> usize {
        match self {
            Self::Stochastic { pipeline, .. } => pipeline.base_model().compressed_size(),
            Self::Deterministic {
                models, parameters, ..
            } => models.total_bytes() + parameters.compressed_size(),
            Self::ReadingFromFile {
                models, parameters, ..
            } => models.total_bytes() + parameters.total_bytes(),
        }
    }
}

impl<S: SimulationScenario> std::fmt::Debug for ExecutionPlan<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("strategy", &self.name())
            .field("stored_bytes", &self.stored_bytes())
            .finish()
    }
}

/// JSON document written per contribution when printing to file.
#[derive(Debug, Serialize)]
struct QoiRecord<'a> {
    level: usize,
    contribution: usize,
    qoi: &'a [f64],
    elapsed: f64,
}

/// Writes per-contribution QoI vectors into a directory.
#[derive(Debug, Clone)]
pub struct QoiWriter {
    directory: PathBuf,
}

impl QoiWriter {
    /// Create a writer for `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// File a contribution is written to.
    #[must_use]
    pub fn path_for(&self, level: usize, contribution: usize) -> PathBuf {
        self.directory
            .join(format!("qoi_level_{level}_contribution_{contribution}.json"))
    }

    /// Write one contribution.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or file cannot be written.
    pub fn write(
        &self,
        level: usize,
        contribution: usize,
        raw: &RawContribution,
    ) -> WrapperResult<PathBuf> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.path_for(level, contribution);
        let record = QoiRecord {
            level,
            contribution,
            qoi: &raw.values,
            elapsed: raw.elapsed,
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| WrapperError::serialization(e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Target directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Solve a stored model with stored parameters.
#[allow(clippy::too_many_arguments)]
fn solve_stored<S: SimulationScenario>(
    scenario: &S,
    codec: StateCodec,
    level: usize,
    model: &SerializedState,
    parameters: &SerializedState,
    reference: Option<&SerializedState>,
    sample: &Sample,
    contribution: usize,
) -> WrapperResult<RawContribution> {
    let mut model: S::Model = codec.decode(model)?;
    let parameters: Parameters = codec.decode(parameters)?;
    let reference: Option<S::Model> = reference.map(|r| codec.decode(r)).transpose()?;

    let start = Instant::now();
    let context = SolveContext {
        level,
        contribution,
        reference: reference.as_ref(),
    };
    let values = scenario
        .solve(&mut model, &parameters, sample, &context)
        .map_err(|e| match e {
            WrapperError::RefinementFailure { .. } => e,
            other => WrapperError::refinement(level, other.to_string()),
        })?;
    Ok(RawContribution::new(values, start.elapsed().as_secs_f64()))
}

/// Executes realizations of one wrapper instance.
pub struct SampleExecutor<S: SimulationScenario> {
    scenario: Arc<S>,
    codec: StateCodec,
    plan: ExecutionPlan<S>,
    outputs: usize,
    writer: Option<QoiWriter>,
}

impl<S: SimulationScenario> std::fmt::Debug for SampleExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleExecutor")
            .field("plan", &self.plan)
            .field("outputs", &self.outputs)
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

impl<S: SimulationScenario> SampleExecutor<S> {
    /// Create an executor returning `outputs` scalars per contribution.
    #[must_use]
    pub const fn new(
        scenario: Arc<S>,
        codec: StateCodec,
        plan: ExecutionPlan<S>,
        outputs: usize,
    ) -> Self {
        Self {
            scenario,
            codec,
            plan,
            outputs,
            writer: None,
        }
    }

    /// Write every contribution's QoI vector with `writer`.
    #[must_use]
    pub fn with_writer(mut self, writer: QoiWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Execution plan in use.
    #[must_use]
    pub const fn plan(&self) -> &ExecutionPlan<S> {
        &self.plan
    }

    /// Width of one raw contribution.
    #[must_use]
    pub const fn outputs(&self) -> usize {
        self.outputs
    }

    /// Zero contribution of an inactive level.
    #[must_use]
    pub fn inactive(&self) -> RawContribution {
        RawContribution::zeros(self.outputs)
    }

    /// Execute one contribution.
    ///
    /// # Errors
    ///
    /// See [`SampleExecutor::execute_all`].
    pub fn execute<R: TaskRuntime>(
        &self,
        runtime: &R,
        index: &SolverIndex,
        sample: &Sample,
        contribution: usize,
    ) -> WrapperResult<RawContribution> {
        self.execute_contributions(runtime, index, sample, &[contribution])?
            .pop()
            .ok_or_else(|| WrapperError::task("executor returned no contribution"))
    }

    /// Execute `n` independent contributions for the same sample.
    ///
    /// Contributions run as independent tasks. An inactive index yields `n`
    /// zero contributions with zero elapsed time and no engine call.
    ///
    /// # Errors
    ///
    /// Returns the first failed contribution's error (`RefinementFailure`
    /// for collaborator failures), `ShapeMismatch` if the engine returns the
    /// wrong number of outputs, or an I/O error from printing.
    pub fn execute_all<R: TaskRuntime>(
        &self,
        runtime: &R,
        index: &SolverIndex,
        sample: &Sample,
        n: usize,
    ) -> WrapperResult<Vec<RawContribution>> {
        let ids: Vec<usize> = (0..n).collect();
        self.execute_contributions(runtime, index, sample, &ids)
    }

    fn execute_contributions<R: TaskRuntime>(
        &self,
        runtime: &R,
        index: &SolverIndex,
        sample: &Sample,
        contributions: &[usize],
    ) -> WrapperResult<Vec<RawContribution>> {
        let Some(level) = index.level() else {
            debug!(%index, "inactive level, returning zero contributions");
            return Ok(contributions.iter().map(|_| self.inactive()).collect());
        };

        let results: Vec<WrapperResult<RawContribution>> = match &self.plan {
            ExecutionPlan::Stochastic {
                pipeline,
                different_tasks,
            } => {
                let chains = if *different_tasks {
                    pipeline.run_multi_task(runtime, level, sample, contributions)
                } else {
                    pipeline.run_all_at_once(runtime, level, sample, contributions)
                };
                chains
                    .into_iter()
                    .map(|chain| {
                        chain.map(|ChainOutput { qoi, elapsed }| RawContribution::new(qoi, elapsed))
                    })
                    .collect()
            }
            ExecutionPlan::Deterministic {
                models,
                parameters,
                mapping,
            } => {
                let model = models.get(level)?;
                let reference = if *mapping && level > 0 {
                    Some(models.get(0)?)
                } else {
                    None
                };
                self.dispatch_stored(
                    runtime,
                    level,
                    model,
                    parameters,
                    reference,
                    sample,
                    contributions,
                )
            }
            ExecutionPlan::ReadingFromFile {
                models,
                parameters,
                mapping,
            } => {
                let model = models.get(level)?;
                let reference = if *mapping && level > 0 {
                    Some(models.get(0)?)
                } else {
                    None
                };
                let parameters = parameters.get(level)?;
                self.dispatch_stored(
                    runtime,
                    level,
                    model,
                    parameters,
                    reference,
                    sample,
                    contributions,
                )
            }
        };

        let mut raw = Vec::with_capacity(contributions.len());
        for (result, &contribution) in results.into_iter().zip(contributions) {
            let contribution_raw = result?;
            if contribution_raw.len() != self.outputs {
                return Err(WrapperError::ShapeMismatch {
                    index: contribution,
                    expected: self.outputs,
                    found: contribution_raw.len(),
                });
            }
            if let Some(writer) = &self.writer {
                let path = writer.write(level, contribution, &contribution_raw)?;
                info!(level, contribution, path = %path.display(), "wrote quantities of interest");
            }
            raw.push(contribution_raw);
        }
        Ok(raw)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_stored<R: TaskRuntime>(
        &self,
        runtime: &R,
        level: usize,
        model: &SerializedState,
        parameters: &SerializedState,
        reference: Option<&SerializedState>,
        sample: &Sample,
        contributions: &[usize],
    ) -> Vec<WrapperResult<RawContribution>> {
        let jobs: Vec<_> = contributions
            .iter()
            .map(|&contribution| {
                let scenario = Arc::clone(&self.scenario);
                let codec = self.codec;
                let model = model.clone();
                let parameters = parameters.clone();
                let reference = reference.cloned();
                let sample = sample.clone();
                move || {
                    solve_stored(
                        scenario.as_ref(),
                        codec,
                        level,
                        &model,
                        &parameters,
                        reference.as_ref(),
                        &sample,
                        contribution,
                    )
                }
            })
            .collect();
        runtime.run_all(jobs)
    }

    /// Release every stored state.
    pub fn release(&mut self) {
        match &mut self.plan {
            ExecutionPlan::Stochastic { .. } => {}
            ExecutionPlan::Deterministic { models, .. } => models.clear(),
            ExecutionPlan::ReadingFromFile {
                models, parameters, ..
            } => {
                models.clear();
                parameters.clear();
            }
        }
    }
}
