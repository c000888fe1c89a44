//! Configuration models for calibrix.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use crate::pool::Location;
use crate::sampling::{AlgorithmSettings, ParameterSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::ConfigError;

/// Top-level configuration for a calibration.
///
/// I^R resolved: All configurable parameters are explicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibConfig {
    /// Calibration identity and loop settings
    pub calibration: CalibrationSettings,

    /// Next-point algorithm and its settings
    pub algorithm: AlgorithmSettings,

    /// One prior per calibrated parameter
    pub parameters: Vec<ParameterSpec>,

    /// Local process-pool backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Reference sites and the analyzers scored at each
    pub sites: Vec<SiteConfig>,
}

/// Calibration identity and driver loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationSettings {
    /// Calibration name (directory name under `root`)
    pub name: String,

    /// Directory holding all calibrations
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Where simulations execute
    #[serde(default)]
    pub location: Location,

    /// Upper bound on iterations, counting iteration 0
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Number of best-ranked samples handed to plotters
    #[serde(default = "default_num_to_plot")]
    pub num_to_plot: usize,

    /// Seed for every random draw of the calibration
    #[serde(default)]
    pub seed: u64,

    /// Seconds between backend status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_root() -> PathBuf {
    PathBuf::from("calibrations")
}

fn default_max_iterations() -> u32 {
    5
}

fn default_num_to_plot() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    10
}

/// Local process-pool backend configuration.
///
/// K_i: One command is run per sample and site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Shell command template; `${param}`, `${site}`, `${sample_index}`,
    /// `${iteration}` and `${output_dir}` are substituted per job.
    /// Any other `${VAR}` is taken from the environment.
    #[serde(default)]
    pub command: String,

    /// Directory for job outputs (default: `<root>/<name>/runs`)
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Maximum number of concurrently running jobs
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// File, relative to each job's output directory, holding analyzer scores
    #[serde(default = "default_score_file")]
    pub score_file: String,
}

fn default_max_parallel() -> usize {
    4
}

fn default_score_file() -> String {
    "scores.json".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            workdir: None,
            max_parallel: default_max_parallel(),
            score_file: default_score_file(),
        }
    }
}

/// A reference site and its analyzers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    pub name: String,

    /// Analyzer names; each contributes one log-likelihood per sample
    pub analyzers: Vec<String>,

    /// How analyzer scores combine into the site score
    #[serde(default)]
    pub combine: Combine,
}

/// Combination of analyzer scores within a site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    /// Sum of analyzer scores (default)
    #[default]
    Sum,
    /// Mean of analyzer scores
    Mean,
}

impl Combine {
    /// Combine analyzer scores; `None` for an empty slice.
    pub fn apply(self, scores: &[f64]) -> Option<f64> {
        if scores.is_empty() {
            return None;
        }
        let sum: f64 = scores.iter().sum();
        Some(match self {
            Self::Sum => sum,
            Self::Mean => sum / scores.len() as f64,
        })
    }
}

impl CalibConfig {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Directory holding this calibration's persisted state.
    pub fn calibration_dir(&self) -> PathBuf {
        self.calibration.root.join(&self.calibration.name)
    }

    /// Directory for local job outputs.
    pub fn run_dir(&self) -> PathBuf {
        self.backend
            .workdir
            .clone()
            .unwrap_or_else(|| self.calibration_dir().join("runs"))
    }

    /// Parameter names in declaration order.
    pub fn param_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    /// Check everything that can be checked without touching disk.
    ///
    /// Prior ranges and algorithm settings are checked again when the
    /// algorithm is built, with their own error variants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = &self.calibration.name;
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(invalid("calibration.name", "must be a non-empty directory name"));
        }
        if self.calibration.max_iterations == 0 {
            return Err(invalid("calibration.max_iterations", "must be at least 1"));
        }
        if self.calibration.poll_interval_secs == 0 {
            return Err(invalid("calibration.poll_interval_secs", "must be at least 1"));
        }

        if self.parameters.is_empty() {
            return Err(invalid("parameters", "at least one parameter is required"));
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(invalid("parameters", format!("duplicate name '{}'", param.name)));
            }
        }

        if self.sites.is_empty() {
            return Err(invalid("sites", "at least one site is required"));
        }
        let mut seen = HashSet::new();
        for site in &self.sites {
            if !seen.insert(site.name.as_str()) {
                return Err(invalid("sites", format!("duplicate site '{}'", site.name)));
            }
            if site.analyzers.is_empty() {
                return Err(invalid(
                    format!("sites.{}.analyzers", site.name),
                    "at least one analyzer is required",
                ));
            }
            let mut analyzers = HashSet::new();
            if let Some(dup) = site.analyzers.iter().find(|a| !analyzers.insert(a.as_str())) {
                return Err(invalid(
                    format!("sites.{}.analyzers", site.name),
                    format!("duplicate analyzer '{dup}'"),
                ));
            }
        }

        if self.backend.max_parallel == 0 {
            return Err(invalid("backend.max_parallel", "must be at least 1"));
        }
        if self.backend.score_file.is_empty() {
            return Err(invalid("backend.score_file", "must not be empty"));
        }

        Ok(())
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    expand_with(s, |name| std::env::var(name).ok())
}

/// Expand `${NAME}` placeholders using `lookup`; unknown names are left as is.
pub fn expand_with(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    placeholder_regex()
        .replace_all(s, |caps: &regex::Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn placeholder_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        // The pattern is a literal; it cannot fail to compile.
        regex::Regex::new(r"\$\{([^}]+)\}").unwrap_or_else(|_| unreachable!())
    })
}

/// Example configuration printed by `calibrix example`.
pub const EXAMPLE_CONFIG: &str = r#"# calibrix configuration file

[calibration]
name = "malaria_prevalence"
root = "calibrations"
location = "local"
max_iterations = 5
num_to_plot = 10
seed = 42
poll_interval_secs = 5

[algorithm]
kind = "imis"
initial_samples = 200
samples_per_iteration = 50
n_resamples = 3000
# Scores are log-likelihoods; use "likelihood" for raw likelihoods
score_scale = "log_likelihood"

[[parameters]]
name = "x_Temporary_Larval_Habitat"
distribution = "log_uniform"
min = 1e-2
max = 1e2

[[parameters]]
name = "Antigen_Switch_Rate"
distribution = "uniform"
min = 1e-10
max = 1e-8

[backend]
# ${param} placeholders receive sample values; ${ENV} reads the environment
command = "${HOME}/bin/simulate --site ${site} --habitat ${x_Temporary_Larval_Habitat} --switch ${Antigen_Switch_Rate} --out ${output_dir}"
max_parallel = 4
score_file = "scores.json"

[[sites]]
name = "Namawala"
analyzers = ["prevalence_by_age"]

[[sites]]
name = "Matsari"
analyzers = ["prevalence_by_age", "incidence"]
combine = "mean"
"#;
