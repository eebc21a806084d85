//! Contract with the external simulation engine.
//!
//! The wrapper never looks inside a model. It asks the collaborator to build
//! one from parameters, to solve it for a sample, to refine it towards a
//! finer level, and to estimate its mesh size. Everything else is opaque
//! bytes handled by the state store.

pub mod benchmark;

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::engine::Sample;
use crate::error::{WrapperError, WrapperResult};

pub use benchmark::{BenchmarkScenario, RodModel, SAMPLE_COMPONENTS};

/// Input type set in the model import section before serialization.
pub const USE_INPUT_MODEL_PART: &str = "use_input_model_part";

/// JSON parameter document with named sub-section access.
///
/// Serializes as its JSON text so it survives non-self-describing codecs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parameters(Value);

impl Parameters {
    /// Wrap an already parsed JSON value.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    /// Parse from JSON text.
    ///
    /// # Errors
    ///
    /// Returns a configuration error with the parser message.
    pub fn from_json(text: &str) -> WrapperResult<Self> {
        serde_json::from_str(text)
            .map(Self)
            .map_err(|e| WrapperError::config(format!("invalid parameters JSON: {e}")))
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or a configuration
    /// error naming the path if it is not valid JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> WrapperResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| WrapperError::config(format!("{}: {e}", path.display())))
    }

    /// Underlying JSON value.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    /// Value at a key path.
    #[must_use]
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.0, |node, key| node.get(key))
    }

    /// Named sub-section as its own document.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<Self> {
        self.0.get(name).cloned().map(Self)
    }

    /// Number at a key path.
    #[must_use]
    pub fn get_f64(&self, path: &[&str]) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    /// Unsigned integer at a key path.
    #[must_use]
    pub fn get_usize(&self, path: &[&str]) -> Option<usize> {
        self.get(path)
            .and_then(Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
    }

    /// String at a key path.
    #[must_use]
    pub fn get_str(&self, path: &[&str]) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Name of the main model part, if declared.
    #[must_use]
    pub fn model_part_name(&self) -> Option<&str> {
        self.get_str(&["solver_settings", "model_part_name"])
            .or_else(|| self.get_str(&["problem_data", "model_part_name"]))
    }

    /// Set `solver_settings.model_import_settings.input_type` when that
    /// section exists. Returns whether anything changed.
    pub fn set_model_import_input_type(&mut self, input_type: &str) -> bool {
        let Some(settings) = self
            .0
            .get_mut("solver_settings")
            .and_then(|s| s.get_mut("model_import_settings"))
            .and_then(Value::as_object_mut)
        else {
            return false;
        };
        settings.insert("input_type".to_string(), Value::from(input_type));
        true
    }
}

impl Serialize for Parameters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Parameters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text)
            .map(Self)
            .map_err(|e| serde::de::Error::custom(format!("invalid parameters JSON: {e}")))
    }
}

/// Metric and remeshing settings for adaptive refinement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RefinementParameters {
    /// `hessian_metric` section.
    pub metric: Parameters,
    /// `refinement_mmg` section.
    pub remesh: Parameters,
}

impl RefinementParameters {
    /// Extract both sections from a refinement document.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the missing section.
    pub fn from_parameters(parameters: &Parameters) -> WrapperResult<Self> {
        let metric = parameters.section("hessian_metric").ok_or_else(|| {
            WrapperError::config("refinement parameters lack a 'hessian_metric' section")
        })?;
        let remesh = parameters.section("refinement_mmg").ok_or_else(|| {
            WrapperError::config("refinement parameters lack a 'refinement_mmg' section")
        })?;
        Ok(Self { metric, remesh })
    }

    /// Load and split a refinement parameters file.
    ///
    /// # Errors
    ///
    /// Returns an I/O or configuration error.
    pub fn load<P: AsRef<Path>>(path: P) -> WrapperResult<Self> {
        Self::from_parameters(&Parameters::load(path)?)
    }
}

/// Per-solve information passed to the collaborator.
#[derive(Debug)]
pub struct SolveContext<'a, M> {
    /// Level being solved.
    pub level: usize,
    /// Contribution counter within the instance.
    pub contribution: usize,
    /// Reference model to map output quantities onto, if mapping is enabled.
    pub reference: Option<&'a M>,
}

/// External simulation engine reached by the wrapper.
///
/// `Model` must round-trip through bincode, so it cannot rely on
/// self-describing formats (no `serde_json::Value` fields, no
/// `#[serde(untagged)]`).
pub trait SimulationScenario: Send + Sync + 'static {
    /// Engine-side model, opaque to the wrapper.
    type Model: Serialize + DeserializeOwned + Send + 'static;

    /// Build and initialize a model from project parameters.
    ///
    /// # Errors
    ///
    /// Returns error if the parameters do not describe a valid model.
    fn initialize(&self, parameters: &Parameters, sample: &Sample) -> WrapperResult<Self::Model>;

    /// Run one realization and return the raw quantities of interest.
    ///
    /// # Errors
    ///
    /// Returns error if the solve diverges or fails.
    fn solve(
        &self,
        model: &mut Self::Model,
        parameters: &Parameters,
        sample: &Sample,
        context: &SolveContext<'_, Self::Model>,
    ) -> WrapperResult<Vec<f64>>;

    /// Adapt a solved coarser model towards `level`.
    ///
    /// # Errors
    ///
    /// Returns error if remeshing fails.
    fn refine(
        &self,
        model: Self::Model,
        parameters: &Parameters,
        refinement: &RefinementParameters,
        sample: &Sample,
        level: usize,
    ) -> WrapperResult<Self::Model>;

    /// Characteristic mesh size of `model` at `level`.
    ///
    /// # Errors
    ///
    /// Returns error if the size cannot be estimated.
    fn estimate_mesh_size(
        &self,
        model: &Self::Model,
        refinement: &RefinementParameters,
        level: usize,
    ) -> WrapperResult<f64>;
}
