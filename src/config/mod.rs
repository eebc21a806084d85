//! Wrapper configuration with YAML/JSON schema and validation.
//!
//! Mistakes are caught before any state is serialized:
//! - Type-safe configuration structs with camelCase keys
//! - Closed refinement strategy enum, unknown values rejected at parse time
//! - Range validation via `validator`
//! - Semantic validation of output shapes and strategy requirements

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use validator::Validate;

use crate::engine::{Sample, SolverIndex};
use crate::error::{WrapperError, WrapperResult};
use crate::unfold::OutputDimension;

/// How models of finer levels are obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RefinementStrategy {
    /// Refinement depends on the sample and is recomputed per solve.
    #[default]
    StochasticAdaptiveRefinement,
    /// Refinement chain computed once with the fake sample.
    DeterministicAdaptiveRefinement,
    /// One pre-existing model per level, no refinement.
    ReadingFromFile,
}

impl RefinementStrategy {
    /// All recognised strategies.
    pub const ALL: [Self; 3] = [
        Self::StochasticAdaptiveRefinement,
        Self::DeterministicAdaptiveRefinement,
        Self::ReadingFromFile,
    ];

    /// Configuration spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StochasticAdaptiveRefinement => "stochastic_adaptive_refinement",
            Self::DeterministicAdaptiveRefinement => "deterministic_adaptive_refinement",
            Self::ReadingFromFile => "reading_from_file",
        }
    }

    /// Whether the strategy needs a refinement parameters file.
    #[must_use]
    pub const fn is_adaptive(self) -> bool {
        !matches!(self, Self::ReadingFromFile)
    }
}

impl fmt::Display for RefinementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const STRATEGY_NAMES: &[&str] = &[
    "stochastic_adaptive_refinement",
    "deterministic_adaptive_refinement",
    "reading_from_file",
];

impl FromStr for RefinementStrategy {
    type Err = WrapperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| {
                WrapperError::config(format!(
                    "unknown refinementStrategy '{s}', expected one of {}",
                    STRATEGY_NAMES.join(", ")
                ))
            })
    }
}

impl Serialize for RefinementStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RefinementStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| serde::de::Error::unknown_variant(&name, STRATEGY_NAMES))
    }
}

/// Top-level wrapper configuration.
///
/// Loaded from YAML or JSON with full schema validation.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WrapperConfig {
    /// Execute only levels 0 and the target level.
    #[serde(default)]
    pub adaptive_refinement_jump_to_finest_level: bool,

    /// Defer serialization to an explicit call.
    #[serde(default)]
    pub asynchronous: bool,

    /// Run the whole refinement chain in one task.
    #[serde(default)]
    pub task_all_at_once: bool,

    /// Sample used only for pre-solve serialization.
    #[serde(default)]
    pub fake_random_variable: Vec<f64>,

    /// Map output quantities onto the level-0 model.
    #[serde(default)]
    pub mapping_output_quantities: bool,

    /// Independent executions per sample.
    #[validate(range(min = 1))]
    #[serde(default = "default_one")]
    pub number_contributions_per_instance: usize,

    /// Number of plain quantities of interest.
    #[validate(range(min = 1))]
    #[serde(rename = "numberQoI", default = "default_one")]
    pub number_qoi: usize,

    /// Number of combined (power-sum) quantities of interest.
    #[serde(default)]
    pub number_combined_qoi: usize,

    /// Block size used to derive the output dimension.
    #[validate(range(min = 1))]
    #[serde(default = "default_one")]
    pub output_batch_size: usize,

    /// Explicit output partition; derived from the batch size when absent.
    #[serde(default, deserialize_with = "optional_one_or_many")]
    pub output_dimension: Option<Vec<usize>>,

    /// Write each contribution's QoI vector to `output_directory`.
    #[serde(default)]
    pub print_to_file: bool,

    /// Project parameter files, one per level for `reading_from_file`.
    #[serde(deserialize_with = "one_or_many")]
    pub project_parameters_path: Vec<PathBuf>,

    /// Refinement parameter file for the adaptive strategies.
    #[serde(default)]
    pub refinement_parameters_path: Option<PathBuf>,

    /// Refinement strategy.
    pub refinement_strategy: RefinementStrategy,

    /// Level multi-index, negative components mark an inactive level.
    #[serde(default)]
    pub solver_wrapper_index: Vec<i64>,

    /// Directory for `print_to_file` output.
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,

    /// Run identifier stamped into serialized states.
    #[serde(default)]
    pub run_id: u64,

    /// zstd level for serialized states (1-22).
    #[validate(range(min = 1, max = 22))]
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

const fn default_one() -> usize {
    1
}

const fn default_compression_level() -> i32 {
    3
}

fn default_output_directory() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

/// Accept either a scalar or a list.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    OneOrMany::deserialize(deserializer).map(Vec::from)
}

fn optional_one_or_many<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<OneOrMany<T>>::deserialize(deserializer).map(|value| value.map(Vec::from))
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            adaptive_refinement_jump_to_finest_level: false,
            asynchronous: false,
            task_all_at_once: false,
            fake_random_variable: Vec::new(),
            mapping_output_quantities: false,
            number_contributions_per_instance: default_one(),
            number_qoi: default_one(),
            number_combined_qoi: 0,
            output_batch_size: default_one(),
            output_dimension: None,
            print_to_file: false,
            project_parameters_path: Vec::new(),
            refinement_parameters_path: None,
            refinement_strategy: RefinementStrategy::default(),
            solver_wrapper_index: Vec::new(),
            output_directory: default_output_directory(),
            run_id: 0,
            compression_level: default_compression_level(),
        }
    }
}

impl WrapperConfig {
    /// Load configuration from a YAML or JSON file, chosen by extension.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - Parsing fails (including an unknown refinement strategy)
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(path: P) -> WrapperResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let mut config = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_yaml(&content)?
        };
        config.resolve_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails.
    pub fn from_yaml(yaml: &str) -> WrapperResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| WrapperError::config(format!("invalid configuration: {e}")))?;
        config.checked()
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails.
    pub fn from_json(json: &str) -> WrapperResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| WrapperError::config(format!("invalid configuration: {e}")))?;
        config.checked()
    }

    /// Create a builder for configuration.
    #[must_use]
    pub fn builder() -> WrapperConfigBuilder {
        WrapperConfigBuilder::default()
    }

    fn checked(self) -> WrapperResult<Self> {
        self.validate()?;
        self.validate_semantic()?;
        Ok(self)
    }

    /// Make relative parameter paths relative to `base`.
    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &PathBuf| {
            if p.is_relative() {
                base.join(p)
            } else {
                p.clone()
            }
        };
        self.project_parameters_path = self.project_parameters_path.iter().map(resolve).collect();
        self.refinement_parameters_path = self.refinement_parameters_path.as_ref().map(resolve);
    }

    /// Validate semantic constraints beyond schema.
    fn validate_semantic(&self) -> WrapperResult<()> {
        if self.project_parameters_path.is_empty() {
            return Err(WrapperError::config(
                "projectParametersPath must name at least one file",
            ));
        }

        let total = self.number_of_scalar_outputs();
        if total < self.output_batch_size {
            return Err(WrapperError::config(format!(
                "numberQoI + numberCombinedQoi = {total} is smaller than outputBatchSize = {}",
                self.output_batch_size
            )));
        }
        self.output_dimension()?;

        if self.refinement_strategy.is_adaptive() && self.refinement_parameters_path.is_none() {
            return Err(WrapperError::config(format!(
                "refinementStrategy '{}' requires refinementParametersPath",
                self.refinement_strategy
            )));
        }

        if self.refinement_strategy == RefinementStrategy::ReadingFromFile {
            if let Some(level) = self.solver_index().level() {
                if level >= self.project_parameters_path.len() {
                    return Err(WrapperError::config(format!(
                        "solverWrapperIndex level {level} has no project parameters file \
                         ({} given for reading_from_file)",
                        self.project_parameters_path.len()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Whether refinement levels are dispatched as separate tasks.
    #[must_use]
    pub const fn different_tasks(&self) -> bool {
        !self.task_all_at_once
    }

    /// Width of one raw contribution.
    #[must_use]
    pub const fn number_of_scalar_outputs(&self) -> usize {
        self.number_qoi + self.number_combined_qoi
    }

    /// Output partition, explicit or derived from the batch size.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the partition does not fit the
    /// number of scalar outputs.
    pub fn output_dimension(&self) -> WrapperResult<OutputDimension> {
        let total = self.number_of_scalar_outputs();
        match &self.output_dimension {
            Some(sizes) => OutputDimension::explicit(sizes.clone(), total),
            None => OutputDimension::derive(total, self.output_batch_size),
        }
    }

    /// Normalised solver index.
    #[must_use]
    pub fn solver_index(&self) -> SolverIndex {
        SolverIndex::new(self.solver_wrapper_index.clone())
    }

    /// Sample used for pre-solve serialization.
    #[must_use]
    pub fn fake_sample(&self) -> Sample {
        Sample::new(self.fake_random_variable.clone())
    }
}

/// Configuration builder for programmatic construction.
#[derive(Debug, Default)]
pub struct WrapperConfigBuilder {
    config: WrapperConfig,
}

impl WrapperConfigBuilder {
    /// Set the refinement strategy.
    #[must_use]
    pub const fn strategy(mut self, strategy: RefinementStrategy) -> Self {
        self.config.refinement_strategy = strategy;
        self
    }

    /// Add a project parameters file.
    #[must_use]
    pub fn project_parameters(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.project_parameters_path.push(path.into());
        self
    }

    /// Set the refinement parameters file.
    #[must_use]
    pub fn refinement_parameters(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.refinement_parameters_path = Some(path.into());
        self
    }

    /// Set the solver index.
    #[must_use]
    pub fn index(mut self, index: Vec<i64>) -> Self {
        self.config.solver_wrapper_index = index;
        self
    }

    /// Set the number of plain and combined quantities of interest.
    #[must_use]
    pub const fn qoi(mut self, number_qoi: usize, number_combined_qoi: usize) -> Self {
        self.config.number_qoi = number_qoi;
        self.config.number_combined_qoi = number_combined_qoi;
        self
    }

    /// Set the output block size.
    #[must_use]
    pub const fn output_batch_size(mut self, size: usize) -> Self {
        self.config.output_batch_size = size;
        self
    }

    /// Set an explicit output partition.
    #[must_use]
    pub fn output_dimension(mut self, sizes: Vec<usize>) -> Self {
        self.config.output_dimension = Some(sizes);
        self
    }

    /// Set the number of contributions per instance.
    #[must_use]
    pub const fn contributions(mut self, n: usize) -> Self {
        self.config.number_contributions_per_instance = n;
        self
    }

    /// Run the refinement chain in one task.
    #[must_use]
    pub const fn task_all_at_once(mut self, enabled: bool) -> Self {
        self.config.task_all_at_once = enabled;
        self
    }

    /// Execute only levels 0 and the target.
    #[must_use]
    pub const fn jump_to_finest(mut self, enabled: bool) -> Self {
        self.config.adaptive_refinement_jump_to_finest_level = enabled;
        self
    }

    /// Map output quantities onto the level-0 model.
    #[must_use]
    pub const fn mapping(mut self, enabled: bool) -> Self {
        self.config.mapping_output_quantities = enabled;
        self
    }

    /// Defer serialization to an explicit call.
    #[must_use]
    pub const fn asynchronous(mut self, enabled: bool) -> Self {
        self.config.asynchronous = enabled;
        self
    }

    /// Set the fake sample.
    #[must_use]
    pub fn fake_random_variable(mut self, values: Vec<f64>) -> Self {
        self.config.fake_random_variable = values;
        self
    }

    /// Write QoI vectors into `dir`.
    #[must_use]
    pub fn print_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.print_to_file = true;
        self.config.output_directory = dir.into();
        self
    }

    /// Set the run identifier.
    #[must_use]
    pub const fn run_id(mut self, run_id: u64) -> Self {
        self.config.run_id = run_id;
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the assembled configuration is invalid.
    pub fn build(self) -> WrapperResult<WrapperConfig> {
        self.config.checked()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
projectParametersPath: project.json
refinementParametersPath: refinement.json
refinementStrategy: stochastic_adaptive_refinement
";

    #[test]
    fn test_config_defaults() {
        let config = WrapperConfig::from_yaml(MINIMAL).unwrap();

        assert!(!config.adaptive_refinement_jump_to_finest_level);
        assert!(!config.asynchronous);
        assert!(config.different_tasks());
        assert!(!config.mapping_output_quantities);
        assert_eq!(config.number_contributions_per_instance, 1);
        assert_eq!(config.number_qoi, 1);
        assert_eq!(config.number_combined_qoi, 0);
        assert_eq!(config.output_batch_size, 1);
        assert!(config.output_dimension.is_none());
        assert!(!config.print_to_file);
        assert_eq!(config.project_parameters_path, vec![PathBuf::from("project.json")]);
        assert_eq!(config.solver_index(), SolverIndex::coarsest());
        assert_eq!(config.output_directory, PathBuf::from("."));
        assert_eq!(config.compression_level, 3);
    }

    #[test]
    fn test_config_yaml_full() {
        let yaml = r"
adaptiveRefinementJumpToFinestLevel: true
asynchronous: true
taskAllAtOnce: true
fakeRandomVariable: [0.5, -1.0]
mappingOutputQuantities: true
numberContributionsPerInstance: 3
numberQoI: 2
numberCombinedQoi: 1
outputBatchSize: 2
printToFile: true
projectParametersPath: [level0.json, level1.json]
refinementStrategy: reading_from_file
solverWrapperIndex: [1]
outputDirectory: out
runId: 9
";
        let config = WrapperConfig::from_yaml(yaml).unwrap();
        assert!(config.adaptive_refinement_jump_to_finest_level);
        assert!(!config.different_tasks());
        assert_eq!(config.fake_sample().values(), &[0.5, -1.0]);
        assert_eq!(config.number_of_scalar_outputs(), 3);
        assert_eq!(config.output_dimension().unwrap().as_slice(), &[2, 1]);
        assert_eq!(config.project_parameters_path.len(), 2);
        assert_eq!(config.refinement_strategy, RefinementStrategy::ReadingFromFile);
        assert_eq!(config.run_id, 9);
    }

    #[test]
    fn test_config_json() {
        let json = r#"{
            "projectParametersPath": "project.json",
            "refinementParametersPath": "refinement.json",
            "refinementStrategy": "deterministic_adaptive_refinement",
            "numberQoI": 5,
            "outputBatchSize": 2
        }"#;
        let config = WrapperConfig::from_json(json).unwrap();
        assert_eq!(
            config.refinement_strategy,
            RefinementStrategy::DeterministicAdaptiveRefinement
        );
        assert_eq!(config.output_dimension().unwrap().as_slice(), &[2, 2, 1]);
    }

    #[test]
    fn test_unknown_strategy_names_value() {
        let yaml = r"
projectParametersPath: project.json
refinementStrategy: magic_refinement
";
        let err = WrapperConfig::from_yaml(yaml).expect_err("unknown strategy");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("magic_refinement"), "{err}");
    }

    #[test]
    fn test_strategy_from_str() {
        for strategy in RefinementStrategy::ALL {
            assert_eq!(strategy.as_str().parse::<RefinementStrategy>().unwrap(), strategy);
            assert_eq!(strategy.to_string(), strategy.as_str());
        }
        let err = "adaptive".parse::<RefinementStrategy>().expect_err("unknown");
        assert!(err.to_string().contains("'adaptive'"));
    }

    #[test]
    fn test_strategy_spelling_round_trips_through_config() {
        for strategy in RefinementStrategy::ALL {
            let yaml = serde_yaml::to_string(&strategy).unwrap();
            assert_eq!(yaml.trim(), strategy.as_str());
            let back: RefinementStrategy = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(back, strategy);
        }
        let err = serde_json::from_str::<RefinementStrategy>("\"Deterministic\"")
            .expect_err("case sensitive");
        assert!(err.to_string().contains("deterministic_adaptive_refinement"), "{err}");
    }

    #[test]
    fn test_batch_larger_than_outputs_rejected() {
        let yaml = r"
projectParametersPath: project.json
refinementParametersPath: refinement.json
refinementStrategy: stochastic_adaptive_refinement
numberQoI: 2
outputBatchSize: 3
";
        let err = WrapperConfig::from_yaml(yaml).expect_err("batch too large");
        assert!(err.is_fatal());
        let message = err.to_string();
        assert!(message.contains('2') && message.contains('3'), "{message}");
    }

    #[test]
    fn test_explicit_dimension_must_sum() {
        let err = WrapperConfig::builder()
            .project_parameters("p.json")
            .refinement_parameters("r.json")
            .qoi(3, 0)
            .output_dimension(vec![1, 1])
            .build()
            .expect_err("bad sum");
        assert!(err.is_fatal());

        let config = WrapperConfig::builder()
            .project_parameters("p.json")
            .refinement_parameters("r.json")
            .qoi(3, 0)
            .output_dimension(vec![1, 2])
            .build()
            .unwrap();
        assert_eq!(config.output_dimension().unwrap().as_slice(), &[1, 2]);
    }

    #[test]
    fn test_scalar_output_dimension_accepted() {
        let yaml = r"
projectParametersPath: project.json
refinementParametersPath: refinement.json
refinementStrategy: stochastic_adaptive_refinement
numberQoI: 4
outputDimension: 4
";
        let config = WrapperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.output_dimension().unwrap().as_slice(), &[4]);
    }

    #[test]
    fn test_adaptive_requires_refinement_file() {
        let err = WrapperConfig::builder()
            .project_parameters("p.json")
            .build()
            .expect_err("missing refinement file");
        assert!(err.to_string().contains("stochastic_adaptive_refinement"));

        assert!(WrapperConfig::builder()
            .strategy(RefinementStrategy::ReadingFromFile)
            .project_parameters("p.json")
            .build()
            .is_ok());
    }

    #[test]
    fn test_reading_from_file_needs_path_per_level() {
        let err = WrapperConfig::builder()
            .strategy(RefinementStrategy::ReadingFromFile)
            .project_parameters("level0.json")
            .index(vec![2])
            .build()
            .expect_err("level 2 missing");
        assert!(err.to_string().contains("level 2"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let yaml = format!("{MINIMAL}numberOfQoI: 3\n");
        assert!(WrapperConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_range_validation() {
        let err = WrapperConfig::builder()
            .project_parameters("p.json")
            .refinement_parameters("r.json")
            .contributions(0)
            .build()
            .expect_err("zero contributions");
        assert!(matches!(err, WrapperError::Validation(_)));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapper.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = WrapperConfig::load(&path).unwrap();
        assert_eq!(config.project_parameters_path[0], dir.path().join("project.json"));
        assert_eq!(
            config.refinement_parameters_path,
            Some(dir.path().join("refinement.json"))
        );
    }

    #[test]
    fn test_load_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapper.json");
        std::fs::write(
            &path,
            r#"{"projectParametersPath": ["a.json"], "refinementStrategy": "reading_from_file"}"#,
        )
        .unwrap();
        let config = WrapperConfig::load(&path).unwrap();
        assert_eq!(config.refinement_strategy, RefinementStrategy::ReadingFromFile);
    }
}
