//! Staged curriculum training of the shared policy.
//!
//! Each stage builds a fresh [`GridWorld`] with its own agent count while the
//! single [`SharedPolicy`] carries over, so later stages start from the values
//! learned with fewer agents.

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use rand::{SeedableRng, rngs::StdRng};
use serde::Serialize;

use crate::{
    config::Config,
    environment::{AgentMap, Direction, GridWorld, GridWorldError},
    make_rng,
    policy::{PolicyError, SharedPolicy},
};

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error(transparent)]
    World(#[from] GridWorldError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Source of the elapsed time checked against the wall-clock budget.
pub trait Clock {
    fn elapsed(&mut self) -> Duration;
}

/// Measures real time since construction.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    start: Instant,
}

impl WallClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for WallClock {
    fn elapsed(&mut self) -> Duration {
        self.start.elapsed()
    }
}

/// Name of a series in the training [`History`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Episodes,
    EpisodeDeliveries,
    Epsilon,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSeries {
    pub metric: Metric,
    pub values: Vec<f64>,
}

/// Append-only metric samples, kept in the order metrics first appeared.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct History {
    series: Vec<MetricSeries>,
}

impl History {
    pub fn record(&mut self, metric: Metric, value: f64) {
        match self.series.iter_mut().find(|series| series.metric == metric) {
            Some(series) => series.values.push(value),
            None => self.series.push(MetricSeries {
                metric,
                values: vec![value],
            }),
        }
    }

    pub fn get(&self, metric: Metric) -> Option<&[f64]> {
        self.series
            .iter()
            .find(|series| series.metric == metric)
            .map(|series| series.values.as_slice())
    }

    pub fn series(&self) -> &[MetricSeries] {
        &self.series
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Metrics of one logging interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Snapshot {
    pub episode: u64,
    pub global_step: u64,
    pub deliveries: u64,
    pub epsilon: f64,
}

/// Why a training run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every stage ran its full budget.
    Completed,
    StepBudget,
    WallClock,
}

/// Progress notifications for whoever drives the training loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    StageStarted {
        name: String,
        num_agents: usize,
        step_budget: u64,
    },
    Snapshot(Snapshot),
    BudgetExhausted {
        reason: StopReason,
        global_step: u64,
    },
    PolicySaved {
        path: PathBuf,
    },
}

/// Running totals over the whole curriculum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrainingTotals {
    pub global_steps: u64,
    pub agent_steps: u64,
    pub deliveries: u64,
    pub wall_collisions: u64,
    pub head_on_collisions: u64,
    pub new_state_actions: u64,
}

impl TrainingTotals {
    /// Agent-steps spent per delivery, `None` before the first delivery.
    pub fn agent_steps_per_delivery(&self) -> Option<f64> {
        (self.deliveries > 0).then(|| self.agent_steps as f64 / self.deliveries as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub history: History,
    pub totals: TrainingTotals,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
    pub stages_completed: usize,
    pub policy_path: PathBuf,
}

/// Runs the curriculum against one shared policy.
#[derive(Debug)]
pub struct TrainingDriver {
    config: Config,
    policy: SharedPolicy,
    rng: StdRng,
}

impl TrainingDriver {
    /// Creates a driver with a fresh, untrained policy.
    pub fn new(config: Config) -> Self {
        let mut rng = make_rng(config.seed);
        let policy = SharedPolicy::new(&config.policy, StdRng::from_rng(&mut rng));
        Self::with_policy(config, policy, rng)
    }

    /// Creates a driver that keeps training an existing policy.
    pub fn with_policy(config: Config, policy: SharedPolicy, rng: StdRng) -> Self {
        Self {
            config,
            policy,
            rng,
        }
    }

    pub fn policy(&self) -> &SharedPolicy {
        &self.policy
    }

    pub fn into_policy(self) -> SharedPolicy {
        self.policy
    }

    /// Trains against the real clock without progress notifications.
    pub fn run(&mut self) -> Result<TrainingReport, TrainingError> {
        self.run_with(&mut WallClock::start(), &mut |_| {})
    }

    /// Trains until the curriculum ends or a budget runs out, then saves the policy.
    pub fn run_with(
        &mut self,
        clock: &mut dyn Clock,
        observer: &mut dyn FnMut(&TrainingEvent),
    ) -> Result<TrainingReport, TrainingError> {
        let training = self.config.training.clone();
        let walltime = training.walltime_budget();

        let mut totals = TrainingTotals::default();
        let mut history = History::default();
        let mut interval_deliveries = 0u64;
        let mut stop_reason = StopReason::Completed;
        let mut stages_completed = 0;

        for (index, stage) in training.stages.iter().enumerate() {
            let step_budget = stage.step_budget(training.total_steps);
            observer(&TrainingEvent::StageStarted {
                name: stage.name.clone(),
                num_agents: stage.num_agents,
                step_budget,
            });

            let mut world = GridWorld::new(
                self.config.environment.grid_size,
                stage.num_agents,
                self.config.rewards.clone(),
                StdRng::from_rng(&mut self.rng),
            )?;
            let mut states = world.reset()?;
            let mut exhausted = None;

            for _ in 0..step_budget {
                exhausted =
                    budget_exhausted(totals.global_steps, training.total_steps, clock, walltime);
                if exhausted.is_some() {
                    break;
                }

                totals.global_steps += 1;
                totals.agent_steps += stage.num_agents as u64;

                let actions: AgentMap<Direction> = states
                    .iter()
                    .map(|(&id, state)| (id, self.policy.choose_action(state)))
                    .collect();
                let outcome = world.step(&actions)?;
                for (id, &action) in &actions {
                    self.policy
                        .update(&states[id], action, outcome.rewards[id], &outcome.states[id]);
                }
                states = outcome.states;
                self.policy.decay_epsilon();

                let info = outcome.info;
                totals.deliveries += u64::from(info.deliveries);
                totals.wall_collisions += u64::from(info.wall_collisions);
                totals.head_on_collisions += u64::from(info.head_on_collisions);
                interval_deliveries += u64::from(info.deliveries);

                if totals.global_steps % training.log_interval == 0 {
                    let snapshot = Snapshot {
                        episode: totals.global_steps / training.log_interval,
                        global_step: totals.global_steps,
                        deliveries: interval_deliveries,
                        epsilon: self.policy.epsilon(),
                    };
                    history.record(Metric::Episodes, snapshot.episode as f64);
                    history.record(Metric::EpisodeDeliveries, snapshot.deliveries as f64);
                    history.record(Metric::Epsilon, snapshot.epsilon);
                    observer(&TrainingEvent::Snapshot(snapshot));
                    interval_deliveries = 0;
                }
            }

            if exhausted.is_none() {
                stages_completed += 1;
                let more_stages = index + 1 < training.stages.len();
                if more_stages {
                    exhausted = budget_exhausted(
                        totals.global_steps,
                        training.total_steps,
                        clock,
                        walltime,
                    );
                }
            }
            if let Some(reason) = exhausted {
                stop_reason = reason;
                observer(&TrainingEvent::BudgetExhausted {
                    reason,
                    global_step: totals.global_steps,
                });
                break;
            }
        }

        totals.new_state_actions = self.policy.new_state_actions();
        self.policy.save(&training.policy_path)?;
        observer(&TrainingEvent::PolicySaved {
            path: training.policy_path.clone(),
        });

        Ok(TrainingReport {
            history,
            totals,
            elapsed: clock.elapsed(),
            stop_reason,
            stages_completed,
            policy_path: training.policy_path,
        })
    }
}

fn budget_exhausted(
    global_steps: u64,
    total_steps: u64,
    clock: &mut dyn Clock,
    walltime: Duration,
) -> Option<StopReason> {
    if global_steps >= total_steps {
        Some(StopReason::StepBudget)
    } else if clock.elapsed() > walltime {
        Some(StopReason::WallClock)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::CurriculumStage;

    /// Advances by a fixed tick every time it is read.
    struct ScriptedClock {
        now: Duration,
        tick: Duration,
    }

    impl Clock for ScriptedClock {
        fn elapsed(&mut self) -> Duration {
            self.now += self.tick;
            self.now
        }
    }

    fn frozen_clock() -> ScriptedClock {
        ScriptedClock {
            now: Duration::ZERO,
            tick: Duration::ZERO,
        }
    }

    fn config(dir: &TempDir, total_steps: u64, stages: Vec<CurriculumStage>) -> Config {
        let mut config = Config {
            seed: Some(5),
            ..Config::default()
        };
        config.training.total_steps = total_steps;
        config.training.log_interval = 10;
        config.training.stages = stages;
        config.training.policy_path = dir.path().join("policy.json");
        config
    }

    fn run(
        config: Config,
        clock: &mut dyn Clock,
    ) -> (TrainingReport, Vec<TrainingEvent>, SharedPolicy) {
        let mut events = Vec::new();
        let mut driver = TrainingDriver::new(config);
        let report = driver
            .run_with(clock, &mut |event| events.push(event.clone()))
            .unwrap();
        (report, events, driver.into_policy())
    }

    #[test]
    fn runs_every_stage_and_logs_each_interval() {
        let dir = TempDir::new().unwrap();
        let config = config(
            &dir,
            100,
            vec![
                CurriculumStage::new("two", 2, 0.5),
                CurriculumStage::new("three", 3, 0.5),
            ],
        );

        let (report, events, policy) = run(config, &mut frozen_clock());

        assert_eq!(report.stop_reason, StopReason::Completed);
        assert_eq!(report.stages_completed, 2);
        assert_eq!(report.totals.global_steps, 100);
        assert_eq!(report.totals.agent_steps, 50 * 2 + 50 * 3);
        assert_eq!(report.totals.head_on_collisions, 0);
        assert_eq!(report.totals.new_state_actions, policy.new_state_actions());
        assert!(!policy.table().is_empty());

        let episodes = report.history.get(Metric::Episodes).unwrap();
        assert_eq!(episodes, (1..=10u32).map(f64::from).collect::<Vec<_>>().as_slice());
        let deliveries: f64 = report.history.get(Metric::EpisodeDeliveries).unwrap().iter().sum();
        assert_eq!(deliveries as u64, report.totals.deliveries);
        assert_eq!(
            report.history.series().iter().map(|s| s.metric).collect::<Vec<_>>(),
            vec![Metric::Episodes, Metric::EpisodeDeliveries, Metric::Epsilon]
        );

        let stage_starts = events
            .iter()
            .filter(|event| matches!(event, TrainingEvent::StageStarted { .. }))
            .count();
        assert_eq!(stage_starts, 2);
        assert!(matches!(events.last(), Some(TrainingEvent::PolicySaved { .. })));
        assert!(report.policy_path.exists());
    }

    #[test]
    fn global_step_budget_cuts_the_curriculum_short() {
        let dir = TempDir::new().unwrap();
        let config = config(
            &dir,
            100,
            vec![
                CurriculumStage::new("first", 1, 0.6),
                CurriculumStage::new("second", 2, 0.6),
                CurriculumStage::new("never", 3, 0.6),
            ],
        );

        let (report, events, _) = run(config, &mut frozen_clock());

        assert_eq!(report.stop_reason, StopReason::StepBudget);
        assert_eq!(report.totals.global_steps, 100);
        assert_eq!(report.totals.agent_steps, 60 + 40 * 2);
        assert_eq!(report.stages_completed, 1);
        assert!(events.contains(&TrainingEvent::BudgetExhausted {
            reason: StopReason::StepBudget,
            global_step: 100,
        }));
        assert!(!events.iter().any(|event| matches!(
            event,
            TrainingEvent::StageStarted { name, .. } if name == "never"
        )));
    }

    #[test]
    fn wall_clock_budget_stops_training() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 1_000, vec![CurriculumStage::new("only", 2, 1.0)]);
        config.training.walltime_budget_secs = 5.0;
        let mut clock = ScriptedClock {
            now: Duration::ZERO,
            tick: Duration::from_secs(1),
        };

        let (report, _, _) = run(config, &mut clock);

        assert_eq!(report.stop_reason, StopReason::WallClock);
        assert_eq!(report.totals.global_steps, 5);
        assert_eq!(report.stages_completed, 0);
        assert!(report.policy_path.exists());
    }

    #[test]
    fn epsilon_decays_once_per_global_step() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 3, vec![CurriculumStage::new("only", 3, 1.0)]);
        config.policy.epsilon_decay = 0.5;
        config.policy.min_epsilon = 0.01;

        let (_, _, policy) = run(config, &mut frozen_clock());

        assert_eq!(policy.epsilon(), 0.125);
    }

    #[test]
    fn overcrowded_stage_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 10, vec![CurriculumStage::new("crowd", 3, 1.0)]);
        config.environment.grid_size = 2;

        let mut driver = TrainingDriver::new(config);
        let err = driver
            .run_with(&mut frozen_clock(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            TrainingError::World(GridWorldError::InsufficientCapacity { agents: 3, .. })
        ));
    }

    #[test]
    fn seeded_runs_repeat_exactly() {
        let dir = TempDir::new().unwrap();
        let stages = vec![CurriculumStage::new("a", 2, 0.5), CurriculumStage::new("b", 3, 0.5)];

        let (first, _, first_policy) = run(config(&dir, 400, stages.clone()), &mut frozen_clock());
        let (second, _, second_policy) = run(config(&dir, 400, stages), &mut frozen_clock());

        assert_eq!(first.totals, second.totals);
        assert_eq!(first.history, second.history);
        assert_eq!(first_policy.table(), second_policy.table());
    }
}
