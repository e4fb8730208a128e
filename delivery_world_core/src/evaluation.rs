//! Greedy evaluation of a trained policy.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use rand::{SeedableRng, rngs::StdRng};
use serde::Serialize;

use crate::{
    AgentId,
    config::{Config, EvaluationConfig, ScoringConfig},
    environment::{AgentMap, AgentState, Direction, GridWorld, GridWorldError},
    make_rng,
    policy::{PolicyError, SharedPolicy},
};

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("no trained policy at {}; run training first", path.display())]
    PolicyNotFound { path: PathBuf },
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    World(#[from] GridWorldError),
}

/// Follows which agents hold a load and since when.
#[derive(Debug, Clone, Default)]
pub struct DeliveryTracker {
    picked_up_at: BTreeMap<AgentId, usize>,
    latencies: Vec<usize>,
}

impl DeliveryTracker {
    /// Compares the agents after `step` with what was seen before.
    pub fn observe(&mut self, step: usize, agents: &[AgentState]) {
        for agent in agents {
            match (self.picked_up_at.get(&agent.id).copied(), agent.carrying) {
                (Some(start), false) => {
                    self.picked_up_at.remove(&agent.id);
                    self.latencies.push(step - start);
                }
                (None, true) => {
                    self.picked_up_at.insert(agent.id, step);
                }
                _ => {}
            }
        }
    }

    /// Steps between pickup and dropoff of every completed delivery.
    pub fn latencies(&self) -> &[usize] {
        &self.latencies
    }

    /// Agents still carrying a load.
    pub fn in_flight(&self) -> usize {
        self.picked_up_at.len()
    }
}

/// Outcome of one evaluation scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioStats {
    pub deliveries: u64,
    /// Loads still being carried when the scenario ended.
    pub undelivered: u64,
    pub wall_collisions: u64,
    pub head_on_collisions: u64,
    pub latencies: Vec<usize>,
}

impl ScenarioStats {
    pub fn collisions(&self) -> u64 {
        self.wall_collisions + self.head_on_collisions
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub scenarios: usize,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    /// Percentage of started deliveries that were completed.
    pub success_rate: f64,
    /// Fraction of scenarios without any collision.
    pub collision_free_rate: f64,
    pub total_collisions: u64,
    pub mean_delivery_latency: Option<f64>,
    pub option_cost: u32,
    pub performance_points: u32,
    pub scaling_factor: f64,
    pub passed: bool,
}

impl EvaluationReport {
    pub fn from_scenarios(
        scenarios: &[ScenarioStats],
        evaluation: &EvaluationConfig,
        scoring: &ScoringConfig,
    ) -> Self {
        let successful: u64 = scenarios.iter().map(|s| s.deliveries).sum();
        let failed: u64 = scenarios.iter().map(|s| s.undelivered).sum();
        let attempts = successful + failed;
        let success_rate = if attempts > 0 {
            successful as f64 / attempts as f64 * 100.0
        } else {
            0.0
        };

        let collision_free = scenarios.iter().filter(|s| s.collisions() == 0).count();
        let collision_free_rate = if scenarios.is_empty() {
            0.0
        } else {
            collision_free as f64 / scenarios.len() as f64
        };

        let latencies: Vec<usize> = scenarios
            .iter()
            .flat_map(|s| s.latencies.iter().copied())
            .collect();
        let mean_delivery_latency = (!latencies.is_empty())
            .then(|| latencies.iter().sum::<usize>() as f64 / latencies.len() as f64);

        let points = performance_points(success_rate, scoring);
        EvaluationReport {
            scenarios: scenarios.len(),
            successful_deliveries: successful,
            failed_deliveries: failed,
            success_rate,
            collision_free_rate,
            total_collisions: scenarios.iter().map(ScenarioStats::collisions).sum(),
            mean_delivery_latency,
            option_cost: scoring.option_cost(),
            performance_points: points,
            scaling_factor: scaling_factor(points, scoring),
            passed: success_rate / 100.0 >= evaluation.min_success_rate,
        }
    }
}

/// Points earned for a success rate given in percent.
pub fn performance_points(success_rate: f64, scoring: &ScoringConfig) -> u32 {
    if success_rate > scoring.excellent_rate {
        2
    } else if success_rate > scoring.good_rate {
        1
    } else {
        0
    }
}

/// Share of the score kept once option costs are offset by earned points.
pub fn scaling_factor(points: u32, scoring: &ScoringConfig) -> f64 {
    1.0 - scoring.penalty_per_point * f64::from(scoring.option_cost().saturating_sub(points))
}

/// Runs a frozen policy over independent scenarios.
#[derive(Debug)]
pub struct Evaluator {
    config: Config,
    rng: StdRng,
}

impl Evaluator {
    pub fn new(config: Config) -> Self {
        let rng = make_rng(config.seed);
        Self { config, rng }
    }

    /// Loads the policy stored at `path` with exploration switched off.
    pub fn load_policy(&mut self, path: impl AsRef<Path>) -> Result<SharedPolicy, EvaluationError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EvaluationError::PolicyNotFound {
                path: path.to_path_buf(),
            });
        }
        let mut policy =
            SharedPolicy::from_file(&self.config.policy, StdRng::from_rng(&mut self.rng), path)?;
        policy.freeze();
        Ok(policy)
    }

    /// Loads the policy at `path` and evaluates it.
    pub fn evaluate_file(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<EvaluationReport, EvaluationError> {
        let mut policy = self.load_policy(path)?;
        self.evaluate(&mut policy)
    }

    /// Evaluates `policy` greedily; its epsilon is forced to zero.
    pub fn evaluate(
        &mut self,
        policy: &mut SharedPolicy,
    ) -> Result<EvaluationReport, EvaluationError> {
        policy.freeze();
        let scenarios = (0..self.config.evaluation.episodes)
            .map(|_| self.run_scenario(policy))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EvaluationReport::from_scenarios(
            &scenarios,
            &self.config.evaluation,
            &self.config.scoring,
        ))
    }

    /// Rolls one freshly placed population forward without learning.
    pub fn run_scenario(
        &mut self,
        policy: &mut SharedPolicy,
    ) -> Result<ScenarioStats, EvaluationError> {
        let mut world = GridWorld::new(
            self.config.environment.grid_size,
            self.config.environment.num_agents,
            self.config.rewards.clone(),
            StdRng::from_rng(&mut self.rng),
        )?;
        let mut states = world.states();
        let mut tracker = DeliveryTracker::default();
        tracker.observe(0, world.agents());
        let mut stats = ScenarioStats::default();

        for step in 1..=self.config.evaluation.max_steps {
            let actions: AgentMap<Direction> = states
                .iter()
                .map(|(&id, state)| (id, policy.choose_action(state)))
                .collect();
            let outcome = world.step(&actions)?;
            stats.wall_collisions += u64::from(outcome.info.wall_collisions);
            stats.head_on_collisions += u64::from(outcome.info.head_on_collisions);
            tracker.observe(step, world.agents());
            states = outcome.states;
        }

        stats.deliveries = tracker.latencies().len() as u64;
        stats.undelivered = tracker.in_flight() as u64;
        stats.latencies = tracker.latencies;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::Position;

    fn config(episodes: usize, max_steps: usize) -> Config {
        let mut config = Config {
            seed: Some(21),
            ..Config::default()
        };
        config.evaluation.episodes = episodes;
        config.evaluation.max_steps = max_steps;
        config
    }

    fn agent(id: AgentId, carrying: bool) -> AgentState {
        AgentState {
            id,
            position: Position::new(1, 1),
            carrying,
        }
    }

    #[test]
    fn untrained_policy_evaluates_without_error() {
        let config = config(4, 30);
        let mut policy = SharedPolicy::new(&config.policy, StdRng::seed_from_u64(2));
        let mut evaluator = Evaluator::new(config);

        let report = evaluator.evaluate(&mut policy).unwrap();

        assert_eq!(report.scenarios, 4);
        assert_eq!(policy.epsilon(), 0.0);
        assert!(policy.table().is_empty());
        assert!((0.0..=100.0).contains(&report.success_rate));
    }

    #[test]
    fn missing_policy_names_the_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nothing.json");
        let mut evaluator = Evaluator::new(config(1, 1));

        let err = evaluator.evaluate_file(&path).unwrap_err();
        assert!(matches!(&err, EvaluationError::PolicyNotFound { path: p } if *p == path));
        assert!(err.to_string().contains("nothing.json"));
    }

    #[test]
    fn corrupt_policy_aborts_evaluation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"{ "(0, 0)": {} }"#).unwrap();
        let mut evaluator = Evaluator::new(config(1, 1));

        let err = evaluator.evaluate_file(&path).unwrap_err();
        assert!(matches!(
            err,
            EvaluationError::Policy(PolicyError::CorruptPolicyState { .. })
        ));
    }

    #[test]
    fn loaded_policy_is_frozen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.json");
        let config = config(1, 1);
        SharedPolicy::new(&config.policy, StdRng::seed_from_u64(0))
            .save(&path)
            .unwrap();

        let policy = Evaluator::new(config).load_policy(&path).unwrap();
        assert_eq!(policy.epsilon(), 0.0);
    }

    #[test]
    fn tracker_measures_pickup_to_dropoff() {
        let mut tracker = DeliveryTracker::default();
        tracker.observe(0, &[agent(0, false), agent(1, false)]);
        tracker.observe(3, &[agent(0, true), agent(1, false)]);
        tracker.observe(4, &[agent(0, true), agent(1, true)]);
        tracker.observe(10, &[agent(0, false), agent(1, true)]);

        assert_eq!(tracker.latencies(), &[7]);
        assert_eq!(tracker.in_flight(), 1);
    }

    #[test]
    fn report_aggregates_scenarios() {
        let scenarios = [
            ScenarioStats {
                deliveries: 2,
                undelivered: 1,
                wall_collisions: 0,
                head_on_collisions: 0,
                latencies: vec![4, 6],
            },
            ScenarioStats {
                deliveries: 1,
                undelivered: 0,
                wall_collisions: 3,
                head_on_collisions: 0,
                latencies: vec![8],
            },
        ];
        let report = EvaluationReport::from_scenarios(
            &scenarios,
            &EvaluationConfig::default(),
            &ScoringConfig::default(),
        );

        assert_eq!(report.successful_deliveries, 3);
        assert_eq!(report.failed_deliveries, 1);
        assert_eq!(report.success_rate, 75.0);
        assert!(report.passed);
        assert_eq!(report.collision_free_rate, 0.5);
        assert_eq!(report.total_collisions, 3);
        assert_eq!(report.mean_delivery_latency, Some(6.0));
        assert_eq!(report.performance_points, 0);
        assert!((report.scaling_factor - 0.01).abs() < 1e-12);
    }

    #[test]
    fn no_attempts_means_zero_success() {
        let report = EvaluationReport::from_scenarios(
            &[ScenarioStats::default()],
            &EvaluationConfig::default(),
            &ScoringConfig::default(),
        );
        assert_eq!(report.success_rate, 0.0);
        assert!(!report.passed);
        assert_eq!(report.mean_delivery_latency, None);
    }

    #[test]
    fn points_follow_strict_bands() {
        let scoring = ScoringConfig::default();
        assert_eq!(performance_points(96.0, &scoring), 2);
        assert_eq!(performance_points(95.0, &scoring), 1);
        assert_eq!(performance_points(85.5, &scoring), 1);
        assert_eq!(performance_points(85.0, &scoring), 0);
        assert!((scaling_factor(2, &scoring) - 0.34).abs() < 1e-12);

        let cheap = ScoringConfig {
            sensors_cost: 1,
            central_clock_cost: 0,
            staged_training_cost: 0,
            ..ScoringConfig::default()
        };
        assert_eq!(scaling_factor(2, &cheap), 1.0);
    }
}
