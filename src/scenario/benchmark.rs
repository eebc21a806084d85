//! One-dimensional adaptive benchmark scenario.
//!
//! A rod on `[0, length]` carrying the field
//!
//! ```text
//! u(x) = sin(pi x / length) exp(-kappa x) + exp(-((x - c) / w)^2)
//! kappa = exp(0.5 s0),  c = length (0.5 + 0.3 tanh(s1))
//! ```
//!
//! where `s0` and `s1` are the first two sample components. The bump moves
//! with the sample, so metric-driven refinement is sample dependent, which
//! is what the stochastic strategy exists for. Refinement bisects every cell
//! whose interpolation error estimate `h^2 |u''| / 8` exceeds the level
//! tolerance `interpolation_error / 2^level`.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Parameters, RefinementParameters, SimulationScenario, SolveContext};
use crate::engine::Sample;
use crate::error::{WrapperError, WrapperResult};

/// Number of sample components the field reads.
pub const SAMPLE_COMPONENTS: usize = 2;

const DEFAULT_ELEMENTS: usize = 8;
const DEFAULT_INTERPOLATION_ERROR: f64 = 0.05;
const DEFAULT_MINIMAL_SIZE: f64 = 1e-4;
const DEFAULT_MAX_NODES: usize = 100_000;
const BUMP_WIDTH: f64 = 0.05;
const MAX_REFINEMENT_PASSES: usize = 32;

/// Discretized rod: node coordinates and, once solved, nodal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RodModel {
    /// Model part name.
    pub name: String,
    /// Node coordinates, strictly increasing.
    pub nodes: Vec<f64>,
    /// Nodal field; empty until solved.
    pub field: Vec<f64>,
    /// Level the mesh was refined for.
    pub level: usize,
}

impl RodModel {
    /// Number of cells.
    #[must_use]
    pub fn cells(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    /// Smallest cell length.
    #[must_use]
    pub fn min_cell_size(&self) -> f64 {
        self.nodes
            .windows(2)
            .map(|w| w[1] - w[0])
            .fold(f64::INFINITY, f64::min)
    }

    /// Rod length.
    #[must_use]
    pub fn length(&self) -> f64 {
        match (self.nodes.first(), self.nodes.last()) {
            (Some(a), Some(b)) => b - a,
            _ => 0.0,
        }
    }

    /// Whether the nodal field is populated.
    #[must_use]
    pub fn is_solved(&self) -> bool {
        !self.field.is_empty() && self.field.len() == self.nodes.len()
    }
}

/// Deterministic 1-D scenario producing `number_qoi` moments of the field and
/// `number_combined_qoi` power integrals.
#[derive(Debug, Clone, Copy)]
pub struct BenchmarkScenario {
    number_qoi: usize,
    number_combined_qoi: usize,
}

impl BenchmarkScenario {
    /// Create a scenario emitting the given number of outputs.
    #[must_use]
    pub const fn new(number_qoi: usize, number_combined_qoi: usize) -> Self {
        Self {
            number_qoi,
            number_combined_qoi,
        }
    }

    /// Width of the returned QoI vector.
    #[must_use]
    pub const fn outputs(&self) -> usize {
        self.number_qoi + self.number_combined_qoi
    }
}

/// Field value at `x` for `sample`.
fn field_at(x: f64, length: f64, sample: &Sample) -> f64 {
    let kappa = (0.5 * sample.component_or(0, 0.0)).exp();
    let center = length * 0.3_f64.mul_add(sample.component_or(1, 0.0).tanh(), 0.5);
    let bump = (-((x - center) / (BUMP_WIDTH * length)).powi(2)).exp();
    (PI * x / length).sin() * (-kappa * x).exp() + bump
}

fn evaluate(nodes: &[f64], length: f64, sample: &Sample) -> Vec<f64> {
    nodes.iter().map(|&x| field_at(x, length, sample)).collect()
}

/// Piecewise-linear interpolation of `(nodes, values)` at `x`.
fn interpolate(nodes: &[f64], values: &[f64], x: f64) -> f64 {
    let i = nodes.partition_point(|&n| n <= x);
    if i == 0 {
        return values.first().copied().unwrap_or(0.0);
    }
    if i >= nodes.len() {
        return values.last().copied().unwrap_or(0.0);
    }
    let (x0, x1) = (nodes[i - 1], nodes[i]);
    let t = (x - x0) / (x1 - x0);
    (values[i] - values[i - 1]).mul_add(t, values[i - 1])
}

/// Trapezoidal integral of `f(u) x^power` on the mesh.
fn integrate(nodes: &[f64], values: &[f64], power: i32, f: impl Fn(f64) -> f64) -> f64 {
    nodes
        .windows(2)
        .zip(values.windows(2))
        .map(|(x, u)| {
            let left = f(u[0]) * x[0].powi(power);
            let right = f(u[1]) * x[1].powi(power);
            0.5 * (x[1] - x[0]) * (left + right)
        })
        .sum()
}

/// Nodal second derivative estimate on a non-uniform mesh.
fn curvature(nodes: &[f64], values: &[f64]) -> Vec<f64> {
    let n = nodes.len();
    let mut out = vec![0.0; n];
    for i in 1..n.saturating_sub(1) {
        let hl = nodes[i] - nodes[i - 1];
        let hr = nodes[i + 1] - nodes[i];
        let slope_r = (values[i + 1] - values[i]) / hr;
        let slope_l = (values[i] - values[i - 1]) / hl;
        out[i] = (2.0 * (slope_r - slope_l) / (hl + hr)).abs();
    }
    if n >= 3 {
        out[0] = out[1];
        out[n - 1] = out[n - 2];
    }
    out
}

impl SimulationScenario for BenchmarkScenario {
    type Model = RodModel;

    fn initialize(&self, parameters: &Parameters, _sample: &Sample) -> WrapperResult<RodModel> {
        let elements = parameters
            .get_usize(&["mesh", "elements"])
            .unwrap_or(DEFAULT_ELEMENTS);
        let length = parameters.get_f64(&["mesh", "length"]).unwrap_or(1.0);
        if elements == 0 {
            return Err(WrapperError::config("mesh.elements must be positive, got 0"));
        }
        if !(length.is_finite() && length > 0.0) {
            return Err(WrapperError::config(format!(
                "mesh.length must be positive, got {length}"
            )));
        }

        let h = length / elements as f64;
        Ok(RodModel {
            name: parameters
                .model_part_name()
                .unwrap_or("MainModelPart")
                .to_string(),
            nodes: (0..=elements).map(|i| i as f64 * h).collect(),
            field: Vec::new(),
            level: 0,
        })
    }

    fn solve(
        &self,
        model: &mut RodModel,
        _parameters: &Parameters,
        sample: &Sample,
        context: &SolveContext<'_, RodModel>,
    ) -> WrapperResult<Vec<f64>> {
        if model.nodes.len() < 2 {
            return Err(WrapperError::refinement(
                context.level,
                format!("model '{}' has no cells", model.name),
            ));
        }
        let length = model.length();
        model.field = evaluate(&model.nodes, length, sample);

        let (nodes, values) = match context.reference {
            Some(reference) => {
                let mapped = reference
                    .nodes
                    .iter()
                    .map(|&x| interpolate(&model.nodes, &model.field, x))
                    .collect();
                (reference.nodes.as_slice(), mapped)
            }
            None => (model.nodes.as_slice(), model.field.clone()),
        };

        let mut qoi = Vec::with_capacity(self.outputs());
        for k in 0..self.number_qoi {
            let power = i32::try_from(k).unwrap_or(i32::MAX);
            qoi.push(integrate(nodes, &values, power, |u| u));
        }
        for p in 0..self.number_combined_qoi {
            let exponent = i32::try_from(p + 2).unwrap_or(i32::MAX);
            qoi.push(integrate(nodes, &values, 0, |u| u.powi(exponent)));
        }

        if let Some(bad) = qoi.iter().position(|q| !q.is_finite()) {
            return Err(WrapperError::refinement(
                context.level,
                format!("quantity of interest {bad} is not finite"),
            ));
        }
        Ok(qoi)
    }

    fn refine(
        &self,
        model: RodModel,
        _parameters: &Parameters,
        refinement: &RefinementParameters,
        sample: &Sample,
        level: usize,
    ) -> WrapperResult<RodModel> {
        if !model.is_solved() {
            return Err(WrapperError::refinement(
                level,
                format!("model '{}' must be solved before refinement", model.name),
            ));
        }

        let base_error = refinement
            .metric
            .get_f64(&["interpolation_error"])
            .unwrap_or(DEFAULT_INTERPOLATION_ERROR);
        let tolerance = base_error / 2f64.powi(i32::try_from(level).unwrap_or(i32::MAX));
        let minimal_size = refinement
            .remesh
            .get_f64(&["minimal_size"])
            .unwrap_or(DEFAULT_MINIMAL_SIZE);
        let maximal_size = refinement
            .remesh
            .get_f64(&["maximal_size"])
            .unwrap_or(f64::INFINITY);
        let max_nodes = refinement
            .remesh
            .get_usize(&["max_number_of_nodes"])
            .unwrap_or(DEFAULT_MAX_NODES);

        let length = model.length();
        let mut nodes = model.nodes;
        let mut values = model.field;

        for pass in 0..MAX_REFINEMENT_PASSES {
            let hessian = curvature(&nodes, &values);
            let mut refined = Vec::with_capacity(nodes.len() * 2);
            let mut split = 0usize;

            for i in 0..nodes.len() - 1 {
                let h = nodes[i + 1] - nodes[i];
                let error = h * h * hessian[i].max(hessian[i + 1]) / 8.0;
                refined.push(nodes[i]);
                if (error > tolerance || h > maximal_size) && 0.5 * h >= minimal_size {
                    refined.push(0.5 * (nodes[i] + nodes[i + 1]));
                    split += 1;
                }
            }
            refined.extend(nodes.last().copied());

            if refined.len() > max_nodes {
                return Err(WrapperError::refinement(
                    level,
                    format!(
                        "remeshing needs {} nodes, max_number_of_nodes is {max_nodes}",
                        refined.len()
                    ),
                ));
            }
            if split == 0 {
                debug!(level, pass, nodes = nodes.len(), "refinement converged");
                break;
            }
            nodes = refined;
            values = evaluate(&nodes, length, sample);
        }

        Ok(RodModel {
            name: model.name,
            nodes,
            field: Vec::new(),
            level,
        })
    }

    fn estimate_mesh_size(
        &self,
        model: &RodModel,
        refinement: &RefinementParameters,
        level: usize,
    ) -> WrapperResult<f64> {
        let h = model.min_cell_size();
        if !h.is_finite() {
            return Err(WrapperError::refinement(
                level,
                format!("model '{}' has no cells to measure", model.name),
            ));
        }
        if model.level >= level {
            return Ok(h);
        }
        // h scales with sqrt(tolerance) and the tolerance halves per level.
        let steps = i32::try_from(level - model.level).unwrap_or(i32::MAX);
        let minimal_size = refinement
            .remesh
            .get_f64(&["minimal_size"])
            .unwrap_or(DEFAULT_MINIMAL_SIZE);
        Ok((h * 2f64.powf(-0.5 * f64::from(steps))).max(minimal_size))
    }
}
