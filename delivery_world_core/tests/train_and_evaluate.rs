use delivery_world_core::{
    config::{Config, CurriculumStage},
    evaluation::Evaluator,
    training::{Metric, StopReason, TrainingDriver},
};
use tempfile::TempDir;

fn small_config(dir: &TempDir) -> Config {
    let mut config = Config {
        seed: Some(1234),
        ..Config::default()
    };
    config.environment.grid_size = 4;
    config.environment.num_agents = 3;
    config.training.total_steps = 6_000;
    config.training.log_interval = 500;
    config.training.stages = vec![
        CurriculumStage::new("warm-up", 1, 0.5),
        CurriculumStage::new("crowded", 3, 0.5),
    ];
    config.training.policy_path = dir.path().join("shared_q_table.json");
    config.policy.epsilon_decay = 0.999;
    config.evaluation.episodes = 10;
    config.evaluation.max_steps = 60;
    config.validate().unwrap();
    config
}

#[test]
fn trained_policy_survives_the_round_trip_to_evaluation() {
    let dir = TempDir::new().unwrap();
    let config = small_config(&dir);

    let mut driver = TrainingDriver::new(config.clone());
    let report = driver.run().unwrap();

    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.totals.global_steps, 6_000);
    assert_eq!(report.history.get(Metric::Episodes).unwrap().len(), 12);
    assert!(report.totals.deliveries > 0);

    let mut evaluator = Evaluator::new(config.clone());
    let loaded = evaluator.load_policy(&report.policy_path).unwrap();
    assert_eq!(loaded.table(), driver.policy().table());

    let evaluation = evaluator.evaluate_file(&report.policy_path).unwrap();
    assert_eq!(evaluation.scenarios, 10);
    assert!((0.0..=100.0).contains(&evaluation.success_rate));
    assert!((0.0..=1.0).contains(&evaluation.collision_free_rate));
    assert_eq!(evaluation.option_cost, 6);
}

#[test]
fn history_serialises_in_append_order() {
    let dir = TempDir::new().unwrap();
    let mut config = small_config(&dir);
    config.training.total_steps = 1_000;

    let report = TrainingDriver::new(config).run().unwrap();
    let json = serde_json::to_value(&report.history).unwrap();

    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|series| series["metric"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["episodes", "episode_deliveries", "epsilon"]);
    assert_eq!(json[0]["values"], serde_json::json!([1.0, 2.0]));
}
