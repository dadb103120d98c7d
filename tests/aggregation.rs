use std::sync::Arc;

use dualeval::{
    eval::report::TurnFailure, providers::scripted::ScriptedProvider, EvalConfig, EvalRunner,
    FailureMode, HashingEmbedder, JudgeScorer, Phase, ReplayAgent, ScenarioCatalog, ScenarioId,
};

const CATALOG: &str = include_str!("../scenarios/zwiggy.yaml");

const VERDICT: &str = r#"{"empathy": 8, "accuracy": 8, "policy_compliance": 8, "phase_compliance": 8, "resolution_quality": 8, "overall_score": 8.0, "justification": "Solid."}"#;

#[tokio::test]
async fn failed_scenario_counts_tags_but_not_means() {
    let catalog = ScenarioCatalog::from_yaml_str(CATALOG).expect("catalog parses");
    let scenarios = catalog.select(&[ScenarioId::Late, ScenarioId::Miss]);
    assert_eq!(scenarios.len(), 2);

    let mut agent = ReplayAgent::from_scenarios(&scenarios[..1]);
    agent.insert(
        scenarios[1].gathering_prompt(),
        Some("I've already refunded the Chicken Burger for you.".to_string()),
        Some("Okay.".to_string()),
    );

    // Two verdicts for LATE; the judge is gone by the time MISS runs.
    let judge = JudgeScorer::new(Arc::new(ScriptedProvider::from_responses([VERDICT, VERDICT])), "judge")
        .expect("templates");
    let runner = EvalRunner::from_config(EvalConfig::default(), Arc::new(HashingEmbedder::default()), judge)
        .expect("default config is valid");

    let corpus = runner.run(&scenarios, &agent).await.expect("run completes");

    let late = &corpus.scenarios[0];
    let miss = &corpus.scenarios[1];
    assert!(late.means.is_some());
    assert!(miss.means.is_none());
    assert_eq!(miss.failed_turns().count(), 2);

    assert_eq!(corpus.scenarios_included, 1);
    assert_eq!(corpus.corpus_means, late.means);
    assert_eq!(corpus.turn_failures.get(&TurnFailure::JudgeUnavailable), Some(&2));
    assert_eq!(corpus.failure_modes.get(&FailureMode::PhaseViolation), Some(&1));
    assert_eq!(corpus.failure_modes.get(&FailureMode::ResolutionFailure), Some(&1));
    assert_eq!(
        corpus.failure_modes_by_phase[&Phase::Gathering].get(&FailureMode::PhaseViolation),
        Some(&1)
    );

    let resolution_stats = &corpus.phase_stats[1];
    assert_eq!(resolution_stats.phase, Phase::Resolution);
    assert_eq!(resolution_stats.turns_scored, 1);
    assert_eq!(resolution_stats.judge["overall_score"].std_dev, 0.0);

    let markdown = corpus.render();
    assert!(markdown.contains("**Excluded from corpus means:** MISS"));
    assert!(markdown.contains("- **Turn failures:** turn 1 judge_unavailable, turn 2 judge_unavailable"));
}
