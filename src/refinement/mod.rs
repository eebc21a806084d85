//! Refinement pipeline: level-by-level chains of refine and solve steps.
//!
//! A chain for target level `L` visits the local levels returned by
//! [`planned_levels`]. Level 0 solves the serialized base model; every later
//! level refines the previous step's solved model and solves the result.
//!
//! Two scheduling modes:
//! - all-at-once: one dispatched job per contribution runs the whole chain
//! - multi-task: one dispatched job per contribution and level, driven from
//!   the calling thread; each step's state moves into the next step
//!
//! Jobs never wait on other jobs. In multi-task mode the caller waits on a
//! whole level before submitting the next one.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::engine::{Sample, TaskFuture, TaskRuntime};
use crate::error::{WrapperError, WrapperResult};
use crate::scenario::{Parameters, RefinementParameters, SimulationScenario, SolveContext};
use crate::state::{SerializedState, StateCodec, StateKey};

/// Local levels executed for `target`.
///
/// Without jump-to-finest every level `0..=target` runs. With it only the
/// two endpoints run.
///
/// # Example
///
/// ```rust
/// use mlmc_wrapper::refinement::planned_levels;
///
/// assert_eq!(planned_levels(3, false), vec![0, 1, 2, 3]);
/// assert_eq!(planned_levels(3, true), vec![0, 3]);
/// assert_eq!(planned_levels(0, true), vec![0]);
/// ```
#[must_use]
pub fn planned_levels(target: usize, jump_to_finest: bool) -> Vec<usize> {
    if jump_to_finest && target > 0 {
        vec![0, target]
    } else {
        (0..=target).collect()
    }
}

/// Chain policy flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainPolicy {
    /// Execute only levels 0 and the target.
    pub jump_to_finest: bool,
    /// Pass the level-0 model as mapping reference to finer steps.
    pub mapping: bool,
}

/// Result of one chain step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Level the step ran at.
    pub level: usize,
    /// Raw quantities of interest.
    pub qoi: Vec<f64>,
    /// Solved model, input of the next step.
    pub state: SerializedState,
    /// Seconds spent in this step.
    pub elapsed: f64,
}

/// Final outcome of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutput {
    /// Quantities of interest of the finest executed level.
    pub qoi: Vec<f64>,
    /// Seconds accumulated over all steps.
    pub elapsed: f64,
}

/// Serialized inputs every worker needs, shipped by value.
#[derive(Debug, Clone)]
struct ChainInputs {
    base_model: SerializedState,
    parameters: SerializedState,
    refinement: SerializedState,
}

/// Executes refinement steps and chains for one wrapper instance.
pub struct RefinementPipeline<S: SimulationScenario> {
    scenario: Arc<S>,
    codec: StateCodec,
    run_id: u64,
    policy: ChainPolicy,
    inputs: ChainInputs,
}

impl<S: SimulationScenario> Clone for RefinementPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            scenario: Arc::clone(&self.scenario),
            codec: self.codec,
            run_id: self.run_id,
            policy: self.policy,
            inputs: self.inputs.clone(),
        }
    }
}

impl<S: SimulationScenario> std::fmt::Debug for RefinementPipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefinementPipeline")
            .field("run_id", &self.run_id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Keep collaborator failures attributed to the level they happened at.
fn at_level(level: usize) -> impl Fn(WrapperError) -> WrapperError {
    move |e| match e {
        WrapperError::RefinementFailure { .. } => e,
        other => WrapperError::refinement(level, other.to_string()),
    }
}

impl<S: SimulationScenario> RefinementPipeline<S> {
    /// Create a pipeline from serialized base model, project parameters and
    /// refinement parameters.
    #[must_use]
    pub fn new(
        scenario: Arc<S>,
        codec: StateCodec,
        run_id: u64,
        policy: ChainPolicy,
        base_model: SerializedState,
        parameters: SerializedState,
        refinement: SerializedState,
    ) -> Self {
        Self {
            scenario,
            codec,
            run_id,
            policy,
            inputs: ChainInputs {
                base_model,
                parameters,
                refinement,
            },
        }
    }

    /// Chain policy in use.
    #[must_use]
    pub const fn policy(&self) -> ChainPolicy {
        self.policy
    }

    /// Serialized level-0 model.
    #[must_use]
    pub const fn base_model(&self) -> &SerializedState {
        &self.inputs.base_model
    }

    fn decode_inputs(&self) -> WrapperResult<(Parameters, RefinementParameters)> {
        let parameters = self.codec.decode(&self.inputs.parameters)?;
        let refinement = self.codec.decode(&self.inputs.refinement)?;
        Ok((parameters, refinement))
    }

    /// Refine `coarser` towards `level` for `sample`.
    ///
    /// # Errors
    ///
    /// Returns `RefinementFailure` if the collaborator fails, or a state
    /// store error if a blob cannot be decoded.
    pub fn refine(
        &self,
        level: usize,
        coarser: &SerializedState,
        sample: &Sample,
    ) -> WrapperResult<(SerializedState, f64)> {
        let start = Instant::now();
        let (parameters, refinement) = self.decode_inputs()?;
        let model: S::Model = self.codec.decode(coarser)?;
        let finer = self
            .scenario
            .refine(model, &parameters, &refinement, sample, level)
            .map_err(at_level(level))?;
        let state = self.codec.encode(StateKey::new(self.run_id, level), &finer)?;
        Ok((state, start.elapsed().as_secs_f64()))
    }

    /// Run one chain step at `level`.
    ///
    /// `previous` is the solved model of the previous step; `None` starts
    /// from the base model.
    ///
    /// # Errors
    ///
    /// Returns `RefinementFailure` tagged with `level` if refining or solving
    /// fails.
    pub fn level_step(
        &self,
        level: usize,
        previous: Option<&SerializedState>,
        sample: &Sample,
        contribution: usize,
    ) -> WrapperResult<StepOutput> {
        let start = Instant::now();
        let (parameters, refinement) = self.decode_inputs()?;

        let model: S::Model = match previous {
            None => self.codec.decode(&self.inputs.base_model)?,
            Some(state) => {
                let coarser: S::Model = self.codec.decode(state)?;
                self.scenario
                    .refine(coarser, &parameters, &refinement, sample, level)
                    .map_err(at_level(level))?
            }
        };

        let (qoi, state) = self.solve_model(level, model, &parameters, sample, contribution)?;
        Ok(StepOutput {
            level,
            qoi,
            state,
            elapsed: start.elapsed().as_secs_f64(),
        })
    }

    /// Solve `model` at `level` and serialize the solved model.
    fn solve_model(
        &self,
        level: usize,
        mut model: S::Model,
        parameters: &Parameters,
        sample: &Sample,
        contribution: usize,
    ) -> WrapperResult<(Vec<f64>, SerializedState)> {
        let reference: Option<S::Model> = if self.policy.mapping && level > 0 {
            Some(self.codec.decode(&self.inputs.base_model)?)
        } else {
            None
        };
        let context = SolveContext {
            level,
            contribution,
            reference: reference.as_ref(),
        };
        let qoi = self
            .scenario
            .solve(&mut model, parameters, sample, &context)
            .map_err(at_level(level))?;

        let state = self.codec.encode(StateKey::new(self.run_id, level), &model)?;
        Ok((qoi, state))
    }

    /// Run the whole chain for `target` on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error; no partial QoI is returned.
    pub fn run_chain(
        &self,
        target: usize,
        sample: &Sample,
        contribution: usize,
    ) -> WrapperResult<ChainOutput> {
        let mut previous: Option<StepOutput> = None;
        let mut elapsed = 0.0;

        for level in planned_levels(target, self.policy.jump_to_finest) {
            let step = self.level_step(
                level,
                previous.as_ref().map(|p| &p.state),
                sample,
                contribution,
            )?;
            elapsed += step.elapsed;
            previous = Some(step);
        }

        previous
            .map(|step| ChainOutput {
                qoi: step.qoi,
                elapsed,
            })
            .ok_or_else(|| WrapperError::refinement(target, "refinement chain executed no level"))
    }

    /// Run one chain per contribution id, one dispatched job each.
    pub fn run_all_at_once<R: TaskRuntime>(
        &self,
        runtime: &R,
        target: usize,
        sample: &Sample,
        contributions: &[usize],
    ) -> Vec<WrapperResult<ChainOutput>> {
        let jobs: Vec<_> = contributions
            .iter()
            .map(|&contribution| {
                let pipeline = self.clone();
                let sample = sample.clone();
                move || pipeline.run_chain(target, &sample, contribution)
            })
            .collect();
        runtime.run_all(jobs)
    }

    /// Run one chain per contribution id with one dispatched job per level.
    ///
    /// A failed chain stops receiving steps; the other chains continue.
    pub fn run_multi_task<R: TaskRuntime>(
        &self,
        runtime: &R,
        target: usize,
        sample: &Sample,
        contributions: &[usize],
    ) -> Vec<WrapperResult<ChainOutput>> {
        let mut chains: Vec<WrapperResult<Option<StepOutput>>> =
            contributions.iter().map(|_| Ok(None)).collect();
        let mut elapsed = vec![0.0; contributions.len()];

        for level in planned_levels(target, self.policy.jump_to_finest) {
            let futures: Vec<Option<TaskFuture<StepOutput>>> = chains
                .iter_mut()
                .zip(contributions)
                .map(|(chain, &contribution)| {
                    let previous = match chain {
                        Ok(previous) => previous.take(),
                        Err(_) => return None,
                    };
                    let pipeline = self.clone();
                    let sample = sample.clone();
                    Some(runtime.submit(move || {
                        let coarser = previous.as_ref().map(|p| &p.state);
                        pipeline.level_step(level, coarser, &sample, contribution)
                    }))
                })
                .collect();

            for (slot, future) in futures.into_iter().enumerate() {
                let Some(future) = future else { continue };
                let contribution = contributions[slot];
                chains[slot] = match future.wait() {
                    Ok(step) => {
                        elapsed[slot] += step.elapsed;
                        debug!(level, contribution, elapsed = step.elapsed, "chain step done");
                        Ok(Some(step))
                    }
                    Err(e) => {
                        warn!(level, contribution, error = %e, "chain aborted");
                        Err(e)
                    }
                };
            }
        }

        chains
            .into_iter()
            .zip(elapsed)
            .map(|(chain, elapsed)| {
                chain?
                    .map(|step| ChainOutput {
                        qoi: step.qoi,
                        elapsed,
                    })
                    .ok_or_else(|| {
                        WrapperError::refinement(target, "refinement chain executed no level")
                    })
            })
            .collect()
    }

    /// Precompute pre-solve models for every level `0..=target` with one
    /// fixed sample.
    ///
    /// Entry `k` is the model of level `k` before it is solved; entry 0 is
    /// the base model. Jump-to-finest does not apply, every level is built.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub fn precompute_levels(
        &self,
        target: usize,
        sample: &Sample,
    ) -> WrapperResult<Vec<SerializedState>> {
        let (parameters, _) = self.decode_inputs()?;
        let mut levels = vec![self.inputs.base_model.clone()];
        let mut solved: Option<SerializedState> = None;

        for level in 0..=target {
            let current = match &solved {
                None => self.inputs.base_model.clone(),
                Some(coarser) => {
                    let (refined, _) = self.refine(level, coarser, sample)?;
                    levels.push(refined.clone());
                    refined
                }
            };
            if level < target {
                let model: S::Model = self.codec.decode(&current)?;
                let (_, state) = self.solve_model(level, model, &parameters, sample, 0)?;
                solved = Some(state);
            }
        }

        Ok(levels)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{InlineRuntime, WorkStealingRuntime};
    use crate::scenario::BenchmarkScenario;
    use proptest::prelude::*;
    use serde_json::json;

    fn pipeline(policy: ChainPolicy) -> RefinementPipeline<BenchmarkScenario> {
        let scenario = Arc::new(BenchmarkScenario::new(2, 1));
        let codec = StateCodec::default();
        let parameters = Parameters::new(json!({ "mesh": { "elements": 8 } }));
        let refinement = RefinementParameters {
            metric: Parameters::new(json!({ "interpolation_error": 0.05 })),
            remesh: Parameters::new(json!({ "minimal_size": 1e-3 })),
        };
        let base = scenario.initialize(&parameters, &Sample::new(vec![])).unwrap();
        RefinementPipeline::new(
            Arc::clone(&scenario),
            codec,
            7,
            policy,
            codec.encode(StateKey::new(7, 0), &base).unwrap(),
            codec.encode(StateKey::new(7, 0), &parameters).unwrap(),
            codec.encode(StateKey::new(7, 0), &refinement).unwrap(),
        )
    }

    #[test]
    fn test_planned_levels() {
        assert_eq!(planned_levels(0, false), vec![0]);
        assert_eq!(planned_levels(1, true), vec![0, 1]);
        assert_eq!(planned_levels(4, true), vec![0, 4]);
        assert_eq!(planned_levels(2, false), vec![0, 1, 2]);
    }

    #[test]
    fn test_level_zero_solves_base() {
        let p = pipeline(ChainPolicy::default());
        let step = p.level_step(0, None, &Sample::new(vec![0.1, 0.2]), 0).unwrap();
        assert_eq!(step.level, 0);
        assert_eq!(step.qoi.len(), 3);
        assert_eq!(step.state.key(), StateKey::new(7, 0));
        assert!(step.elapsed >= 0.0);
    }

    #[test]
    fn test_refine_produces_finer_level() {
        let p = pipeline(ChainPolicy::default());
        let sample = Sample::new(vec![0.1, 0.2]);
        let step = p.level_step(0, None, &sample, 0).unwrap();
        let (finer, elapsed) = p.refine(1, &step.state, &sample).unwrap();
        assert_eq!(finer.level(), 1);
        assert!(elapsed >= 0.0);
    }

    #[test]
    fn test_refining_unsolved_base_fails_with_level() {
        let p = pipeline(ChainPolicy::default());
        let err = p
            .refine(2, &p.base_model().clone(), &Sample::new(vec![]))
            .expect_err("unsolved");
        assert!(matches!(err, WrapperError::RefinementFailure { level: 2, .. }));
    }

    #[test]
    fn test_all_at_once_matches_multi_task() {
        let p = pipeline(ChainPolicy::default());
        let sample = Sample::new(vec![-0.4, 0.7]);
        let runtime = InlineRuntime;
        let a = p.run_all_at_once(&runtime, 2, &sample, &[0, 1]);
        let b = p.run_multi_task(&runtime, 2, &sample, &[0, 1]);
        for (a, b) in a.into_iter().zip(b) {
            assert_eq!(a.unwrap().qoi, b.unwrap().qoi);
        }
    }

    #[test]
    fn test_multi_task_on_pool() {
        let p = pipeline(ChainPolicy {
            jump_to_finest: false,
            mapping: true,
        });
        let sample = Sample::new(vec![0.3, -0.1]);
        let runtime = WorkStealingRuntime::with_workers(3).unwrap();
        let pooled = p.run_multi_task(&runtime, 2, &sample, &[0, 1, 2, 3]);
        let inline = p.run_chain(2, &sample, 0).unwrap();
        assert_eq!(pooled.len(), 4);
        for out in pooled {
            assert_eq!(out.unwrap().qoi, inline.qoi);
        }
    }

    #[test]
    fn test_precompute_levels() {
        let p = pipeline(ChainPolicy::default());
        let levels = p.precompute_levels(2, &Sample::new(vec![0.0, 0.0])).unwrap();
        assert_eq!(levels.len(), 3);
        for (k, state) in levels.iter().enumerate() {
            assert_eq!(state.level(), k);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Both scheduling modes yield the same final QoI.
        #[test]
        fn prop_modes_agree(s0 in -1.0f64..1.0, s1 in -1.0f64..1.0, target in 0usize..3) {
            let p = pipeline(ChainPolicy::default());
            let sample = Sample::new(vec![s0, s1]);
            let a = p.run_chain(target, &sample, 0).unwrap();
            let b = p.run_multi_task(&InlineRuntime, target, &sample, &[0]).remove(0).unwrap();
            prop_assert_eq!(a.qoi, b.qoi);
        }
    }
}
