//! Configuration passed into each component at construction time.
//!
//! Every section deserialises with `#[serde(default)]`, so a configuration
//! file only needs to name the values it changes.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Errors raised while reading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("grid size must be at least 2, got {0}")]
    GridTooSmall(usize),
    #[error("`{field}` must be at least 1 agent")]
    NoAgents { field: &'static str },
    #[error("`{field}` = {value} is outside {range}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        range: &'static str,
    },
    #[error("training needs at least one curriculum stage")]
    NoStages,
    #[error("stage `{name}` has invalid step fraction {fraction}")]
    StageFraction { name: String, fraction: f64 },
    #[error("log interval must be positive")]
    ZeroLogInterval,
}

/// Top-level configuration for a training and evaluation run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seed for every random source of the run. `None` draws from the OS.
    pub seed: Option<u64>,
    pub environment: EnvironmentConfig,
    pub rewards: RewardConfig,
    pub policy: PolicyConfig,
    pub training: TrainingConfig,
    pub evaluation: EvaluationConfig,
    pub scoring: ScoringConfig,
}

impl Config {
    /// Reads a JSON configuration file and validates it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Parses a JSON configuration document and validates it.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the parameters that would otherwise only fail deep inside a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.grid_size < 2 {
            return Err(ConfigError::GridTooSmall(self.environment.grid_size));
        }
        if self.environment.num_agents == 0 {
            return Err(ConfigError::NoAgents {
                field: "environment.num_agents",
            });
        }

        let policy = &self.policy;
        check_range("policy.alpha", policy.alpha, "(0, 1]", |v| v > 0.0 && v <= 1.0)?;
        check_range("policy.gamma", policy.gamma, "[0, 1]", |v| (0.0..=1.0).contains(&v))?;
        check_range("policy.epsilon", policy.epsilon, "[0, 1]", |v| {
            (0.0..=1.0).contains(&v)
        })?;
        check_range("policy.epsilon_decay", policy.epsilon_decay, "(0, 1]", |v| {
            v > 0.0 && v <= 1.0
        })?;
        check_range("policy.min_epsilon", policy.min_epsilon, "[0, 1]", |v| {
            (0.0..=1.0).contains(&v)
        })?;

        let training = &self.training;
        if training.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        for stage in &training.stages {
            if stage.num_agents == 0 {
                return Err(ConfigError::NoAgents {
                    field: "training.stages[].num_agents",
                });
            }
            if !stage.step_fraction.is_finite() || stage.step_fraction < 0.0 {
                return Err(ConfigError::StageFraction {
                    name: stage.name.clone(),
                    fraction: stage.step_fraction,
                });
            }
        }
        if training.log_interval == 0 {
            return Err(ConfigError::ZeroLogInterval);
        }
        check_range(
            "training.walltime_budget_secs",
            training.walltime_budget_secs,
            "[0, inf)",
            |v| v >= 0.0,
        )?;

        check_range(
            "evaluation.min_success_rate",
            self.evaluation.min_success_rate,
            "[0, 1]",
            |v| (0.0..=1.0).contains(&v),
        )?;
        Ok(())
    }
}

fn check_range(
    field: &'static str,
    value: f64,
    range: &'static str,
    accept: impl Fn(f64) -> bool,
) -> Result<(), ConfigError> {
    if accept(value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            range,
        })
    }
}

/// Grid geometry and the default population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Side length of the square grid.
    pub grid_size: usize,
    /// Agent count used by evaluation.
    pub num_agents: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            grid_size: 5,
            num_agents: 4,
        }
    }
}

/// Reward terms, combined additively per agent per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub step_penalty: f64,
    pub wall_collision: f64,
    pub yield_penalty: f64,
    pub progress: f64,
    pub pickup: f64,
    pub delivery: f64,
    /// Reserved for head-on collisions. The transition never applies it.
    pub head_on_collision: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            step_penalty: -100.0,
            wall_collision: -50.0,
            yield_penalty: -500.0,
            progress: 50.0,
            pickup: 100.0,
            delivery: 5000.0,
            head_on_collision: -10000.0,
        }
    }
}

/// Learning hyperparameters of the shared policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Learning rate.
    pub alpha: f64,
    /// Discount factor.
    pub gamma: f64,
    /// Initial exploration rate.
    pub epsilon: f64,
    pub epsilon_decay: f64,
    pub min_epsilon: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            gamma: 0.99,
            epsilon: 1.0,
            epsilon_decay: 0.9995,
            min_epsilon: 0.1,
        }
    }
}

/// One phase of the curriculum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurriculumStage {
    pub name: String,
    pub num_agents: usize,
    /// Share of the global step budget allotted to this stage.
    pub step_fraction: f64,
}

impl CurriculumStage {
    pub fn new(name: impl Into<String>, num_agents: usize, step_fraction: f64) -> Self {
        Self {
            name: name.into(),
            num_agents,
            step_fraction,
        }
    }

    /// Step budget of this stage, truncated toward zero.
    pub fn step_budget(&self, total_steps: u64) -> u64 {
        (total_steps as f64 * self.step_fraction) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Global step budget across all stages.
    pub total_steps: u64,
    /// Wall-clock budget in seconds.
    pub walltime_budget_secs: f64,
    /// Global steps between two history snapshots.
    pub log_interval: u64,
    pub stages: Vec<CurriculumStage>,
    /// Where the trained policy is written.
    pub policy_path: PathBuf,
}

impl TrainingConfig {
    pub fn walltime_budget(&self) -> Duration {
        Duration::try_from_secs_f64(self.walltime_budget_secs).unwrap_or(Duration::MAX)
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            total_steps: 1_500_000,
            walltime_budget_secs: 600.0,
            log_interval: 2500,
            stages: vec![
                CurriculumStage::new("Stage 1: Basics", 2, 0.4),
                CurriculumStage::new("Stage 2: Intermediate", 3, 0.3),
                CurriculumStage::new("Stage 3: Full Complexity", 4, 0.3),
            ],
            policy_path: PathBuf::from("shared_q_table.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Number of independent scenarios.
    pub episodes: usize,
    /// Steps rolled forward per scenario.
    pub max_steps: usize,
    /// Success rate (fraction) required to pass.
    pub min_success_rate: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            episodes: 300,
            max_steps: 350,
            min_success_rate: 0.75,
        }
    }
}

/// Constants of the final performance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub sensors_cost: u32,
    pub central_clock_cost: u32,
    pub staged_training_cost: u32,
    /// Success rate (percent) above which two points are awarded.
    pub excellent_rate: f64,
    /// Success rate (percent) above which one point is awarded.
    pub good_rate: f64,
    /// Scaling lost per unpaid option-cost point.
    pub penalty_per_point: f64,
}

impl ScoringConfig {
    /// Total cost of the options the solution uses.
    pub fn option_cost(&self) -> u32 {
        self.sensors_cost + self.central_clock_cost + self.staged_training_cost
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            sensors_cost: 2,
            central_clock_cost: 1,
            staged_training_cost: 3,
            excellent_rate: 95.0,
            good_rate: 85.0,
            penalty_per_point: 33.0 / 200.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scoring.option_cost(), 6);
        assert_eq!(config.training.stages.len(), 3);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config = Config::from_json_str(
            r#"{ "seed": 7, "environment": { "grid_size": 6 }, "policy": { "alpha": 0.5 } }"#,
        )
        .unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.environment.grid_size, 6);
        assert_eq!(config.environment.num_agents, 4);
        assert_eq!(config.policy.alpha, 0.5);
        assert_eq!(config.policy.gamma, 0.99);
    }

    #[test]
    fn stage_budget_truncates() {
        let stage = CurriculumStage::new("s", 2, 0.3);
        assert_eq!(stage.step_budget(1_500_000), 450_000);
        assert_eq!(stage.step_budget(10), 3);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = Config::default();
        config.policy.alpha = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "policy.alpha",
                ..
            })
        ));

        let mut config = Config::default();
        config.training.stages.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoStages)));

        let mut config = Config::default();
        config.environment.grid_size = 1;
        assert!(matches!(config.validate(), Err(ConfigError::GridTooSmall(1))));
    }

    #[test]
    fn walltime_budget_converts_seconds() {
        let training = TrainingConfig::default();
        assert_eq!(training.walltime_budget(), Duration::from_secs(600));
    }
}
