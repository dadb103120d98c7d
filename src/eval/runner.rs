use std::{collections::BTreeSet, sync::Arc};

use futures_util::future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    agent::{scenario_briefing, AgentUnderTest},
    embedding::Embedder,
    error::{EmbeddingError, EvalError},
    eval::{
        call::bounded_call,
        config::EvalConfig,
        judge::{FailureMode, JudgeScorer},
        phase::{Phase, PhaseClassification, PhaseEvent, PhaseMachine, PhaseState, PhaseTracker, ViolationReason},
        report::{CorpusReport, ScenarioReport, TurnFailure, TurnOutcome, TurnRecord},
        scenario::{ConversationTurn, Scenario},
        semantic::{ScoringContext, SemanticScorer},
    },
    history::ChatHistory,
    types::ChatMessage,
    LLMError,
};

const PREFLIGHT_TEXT: &str = "Is the embedding service reachable?";

const GUARD_PROMPT: &str = "Your previous reply already offered or applied a remedy, but the \
issue has not been confirmed yet. Rewrite it: acknowledge the problem with empathy and ask one \
clarifying question. Do not promise or apply any refund, credit, replacement or other remedy.";

/// Tags a tracker verdict contributes to a turn, independent of the judge.
pub fn tracker_tags(classification: &PhaseClassification) -> BTreeSet<FailureMode> {
    match classification.reason {
        Some(ViolationReason::PhaseViolation | ViolationReason::EmptyResponse) => {
            BTreeSet::from([FailureMode::PhaseViolation])
        }
        Some(ViolationReason::ResolutionMissing) => BTreeSet::from([FailureMode::ResolutionFailure]),
        None => BTreeSet::new(),
    }
}

/// Drives one scenario through both phases and scores every turn.
pub struct ScenarioRunner {
    tracker: PhaseTracker,
    semantic: SemanticScorer,
    judge: JudgeScorer,
    config: EvalConfig,
    cancel: CancellationToken,
}

impl ScenarioRunner {
    pub fn new(config: EvalConfig, embedder: Arc<dyn Embedder>, judge: JudgeScorer) -> Result<Self, EvalError> {
        config.validate()?;
        let tracker = PhaseTracker::new(&config.lexicon)?;
        let semantic = SemanticScorer::new(embedder, config.semantic.clone(), &config.lexicon)?;
        let judge = judge
            .with_thresholds(config.judge)
            .with_timeouts(config.timeouts);

        Ok(Self {
            tracker,
            semantic,
            judge,
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        self.semantic.embedder()
    }

    /// Run both phases of `scenario` against `agent`. Agent and judge
    /// failures end up in the returned report; only a broken embedding
    /// service aborts the scenario.
    pub async fn run(&self, scenario: &Scenario, agent: &dyn AgentUnderTest) -> Result<ScenarioReport, EvalError> {
        let briefing = scenario_briefing(scenario)
            .map_err(|err| EvalError::InvalidConfig(format!("scenario briefing: {err}")))?;
        let mut history = ChatHistory::new();
        history.push_system(briefing);

        let mut machine = PhaseMachine::new();
        let mut turns = Vec::with_capacity(Phase::ALL.len());
        let mut cancelled = false;

        for (index, phase) in Phase::ALL.into_iter().enumerate() {
            let user_message = scenario.user_message(phase);

            if cancelled || self.cancel.is_cancelled() {
                if !cancelled {
                    info!(scenario = %scenario.id, turn = index, "run cancelled, skipping remaining turns");
                    cancelled = true;
                }
                turns.push(TurnRecord::skipped(index, phase, machine.state(), user_message));
                continue;
            }

            if phase == Phase::Resolution {
                machine.apply(PhaseEvent::IssueConfirmed)?;
            }

            let record = self
                .run_turn(scenario, agent, &mut history, index, phase, machine.state(), user_message)
                .await?;
            turns.push(record);
        }

        if !cancelled {
            machine.apply(PhaseEvent::ConversationEnded)?;
        }

        let report = ScenarioReport::new(scenario, turns, machine.state());
        info!(
            scenario = %scenario.id,
            scored = report.scored_turns(),
            failed = report.failed_turns().count(),
            skipped = report.skipped_turns(),
            rubric = report.means.map(|m| m.rubric.aggregate),
            judge = report.means.map(|m| m.judge.overall_score),
            "scenario finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_turn(
        &self,
        scenario: &Scenario,
        agent: &dyn AgentUnderTest,
        history: &mut ChatHistory,
        index: usize,
        phase: Phase,
        state: PhaseState,
        user_message: String,
    ) -> Result<TurnRecord, EvalError> {
        let window = history.window(self.config.memory_window);
        let mut record = TurnRecord {
            index,
            phase,
            state,
            user_message,
            response: None,
            original_response: None,
            outcome: TurnOutcome::Skipped,
            failure_modes: BTreeSet::new(),
        };

        let response = match self.ask_agent(agent, &record.user_message, &window).await {
            Ok(response) => response,
            Err(err) => {
                warn!(scenario = %scenario.id, phase = phase.as_str(), error = %err, "agent unavailable");
                history.push_user(record.user_message.clone());
                record.outcome = TurnOutcome::Failed {
                    reason: TurnFailure::AgentUnavailable,
                    message: err.to_string(),
                    classification: None,
                };
                return Ok(record);
            }
        };

        let rewrite = if self.config.gathering_guard && phase == Phase::Gathering {
            self.guard(scenario, agent, &window, &record.user_message, &response).await
        } else {
            None
        };
        let response = match rewrite {
            Some(rewrite) => {
                record.original_response = Some(response);
                rewrite
            }
            None => response,
        };

        history.push_user(record.user_message.clone());
        history.push_assistant(response.clone());
        record.response = Some(response.clone());

        let turn = ConversationTurn {
            index,
            user_message: record.user_message.clone(),
            agent_response: response,
            phase,
        };
        let ctx = ScoringContext {
            phase,
            resolution: scenario.resolution,
        };

        let (classification, rubric, verdict) = tokio::join!(
            future::ready(self.tracker.classify(&turn, phase)),
            self.semantic.score(
                &turn.agent_response,
                scenario.references(phase),
                &self.config.weights,
                ctx
            ),
            self.judge.judge(&turn, scenario),
        );
        let rubric = rubric?;

        record.failure_modes = tracker_tags(&classification);
        if let Some(reason) = classification.reason {
            debug!(scenario = %scenario.id, phase = phase.as_str(), reason = reason.as_str(), "phase check flagged turn");
        }

        record.outcome = match verdict {
            Ok(verdict) => {
                record.failure_modes.extend(verdict.failure_modes.iter().copied());
                TurnOutcome::Scored {
                    classification,
                    rubric,
                    verdict,
                }
            }
            Err(err) => {
                warn!(scenario = %scenario.id, phase = phase.as_str(), error = %err, "judge unavailable");
                TurnOutcome::Failed {
                    reason: TurnFailure::JudgeUnavailable,
                    message: err.to_string(),
                    classification: Some(classification),
                }
            }
        };
        Ok(record)
    }

    async fn ask_agent(
        &self,
        agent: &dyn AgentUnderTest,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, LLMError> {
        let timeouts = self.config.timeouts;
        bounded_call("agent", timeouts.agent_timeout(), timeouts.retry_backoff(), move || {
            agent.generate(prompt, history)
        })
        .await
    }

    /// One rewrite request for a gathering reply that commits to a remedy.
    /// A failed or still non-compliant rewrite keeps the original reply.
    async fn guard(
        &self,
        scenario: &Scenario,
        agent: &dyn AgentUnderTest,
        window: &[ChatMessage],
        user_message: &str,
        response: &str,
    ) -> Option<String> {
        if !self.tracker.signals(response).definite_commitment {
            return None;
        }

        let mut history = window.to_vec();
        history.push(ChatMessage::user(user_message));
        history.push(ChatMessage::assistant(response));

        match self.ask_agent(agent, GUARD_PROMPT, &history).await {
            Ok(rewrite) if !self.tracker.signals(&rewrite).definite_commitment => {
                info!(scenario = %scenario.id, "gathering reply rewritten by guard");
                Some(rewrite)
            }
            Ok(_) => {
                warn!(scenario = %scenario.id, "guard rewrite still commits to a remedy, keeping original");
                None
            }
            Err(err) => {
                warn!(scenario = %scenario.id, error = %err, "guard rewrite failed, keeping original");
                None
            }
        }
    }
}

/// Runs a set of scenarios one after another and aggregates the result.
pub struct EvalRunner {
    scenarios: ScenarioRunner,
}

impl EvalRunner {
    pub fn new(scenarios: ScenarioRunner) -> Self {
        Self { scenarios }
    }

    pub fn from_config(config: EvalConfig, embedder: Arc<dyn Embedder>, judge: JudgeScorer) -> Result<Self, EvalError> {
        Ok(Self::new(ScenarioRunner::new(config, embedder, judge)?))
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.scenarios = self.scenarios.with_cancellation(cancel);
        self
    }

    pub fn scenario_runner(&self) -> &ScenarioRunner {
        &self.scenarios
    }

    /// Embed one sentence so a dead embedding service fails the run
    /// before any agent call is made.
    pub async fn preflight(&self) -> Result<(), EvalError> {
        let embedder = self.scenarios.embedder();
        let vector = embedder.embed(PREFLIGHT_TEXT).await?;
        if vector.is_empty() {
            return Err(EmbeddingError::InvalidVector("preflight embedding is empty".to_string()).into());
        }
        debug!(embedder = embedder.name(), dimension = vector.len(), "embedding preflight passed");
        Ok(())
    }

    pub async fn run(&self, scenarios: &[Scenario], agent: &dyn AgentUnderTest) -> Result<CorpusReport, EvalError> {
        self.preflight().await?;
        info!(scenarios = scenarios.len(), agent = agent.name(), "evaluation started");

        let mut reports = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            reports.push(self.scenarios.run(scenario, agent).await?);
        }

        let report = CorpusReport::aggregate(reports);
        info!(
            scenarios = report.scenarios.len(),
            included = report.scenarios_included,
            skipped_turns = report.skipped_turns,
            "evaluation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        agent::SupportAgent,
        embedding::HashingEmbedder,
        eval::call::TimeoutConfig,
        eval::scenario::{OrderRecord, ScenarioId},
        providers::scripted::ScriptedProvider,
    };

    const GATHERING_VERDICT: &str = r#"{"empathy": 8, "accuracy": 8, "policy_compliance": 9, "phase_compliance": 9, "overall_score": 8.5, "justification": "Asked one question.", "strengths": ["empathy"], "weaknesses": [], "failure_modes": []}"#;
    const RESOLUTION_VERDICT: &str = r#"{"empathy": 7, "accuracy": 8, "policy_compliance": 8, "phase_compliance": 8, "resolution_quality": 8, "overall_score": 7.8, "justification": "Applied the credit.", "failure_modes": []}"#;

    const GATHERING_REPLY: &str = "I'm so sorry your order is running late. My tracker shows it's out for delivery. Does that match what you're seeing?";
    const RESOLUTION_REPLY: &str = "Thanks for confirming. I've added delivery credits to your account for the delay. Does this resolve your issue?";

    fn scenario() -> Scenario {
        Scenario {
            id: ScenarioId::Late,
            order: OrderRecord {
                order_id: "ORD-482913".into(),
                status: "out_for_delivery".into(),
                items: vec!["Paneer Tikka Bowl".into()],
                eta: "19:40".into(),
            },
            trigger: "my order is late by 50 mins".into(),
            policy: "Confirm the delay first, then add delivery credits.".into(),
            resolution: ScenarioId::Late.default_resolution(),
            gathering_references: vec![GATHERING_REPLY.into()],
            resolution_user_message: "Yes, it's still not here.".into(),
            resolution_references: vec![RESOLUTION_REPLY.into()],
            replay: None,
        }
    }

    fn runner(judge_replies: &[&str], config: EvalConfig) -> ScenarioRunner {
        let judge = JudgeScorer::new(
            Arc::new(ScriptedProvider::from_responses(judge_replies.iter().copied())),
            "judge",
        )
        .expect("templates");
        ScenarioRunner::new(config, Arc::new(HashingEmbedder::default()), judge).expect("valid config")
    }

    fn agent(replies: &[&str]) -> SupportAgent {
        SupportAgent::new(
            Arc::new(ScriptedProvider::from_responses(replies.iter().copied())),
            "agent",
        )
    }

    /// Records the history every call sees.
    struct RecordingAgent {
        replies: Mutex<Vec<String>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl AgentUnderTest for RecordingAgent {
        async fn generate(&self, _prompt: &str, history: &[ChatMessage]) -> Result<String, LLMError> {
            self.seen.lock().expect("lock").push(history.to_vec());
            let mut replies = self.replies.lock().expect("lock");
            if replies.is_empty() {
                return Err(LLMError::Provider("script exhausted".into()));
            }
            Ok(replies.remove(0))
        }
    }

    /// Cancels the run from inside its first reply.
    struct CancellingAgent {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl AgentUnderTest for CancellingAgent {
        async fn generate(&self, _prompt: &str, _history: &[ChatMessage]) -> Result<String, LLMError> {
            self.cancel.cancel();
            Ok(GATHERING_REPLY.to_string())
        }
    }

    struct SlowAgent {
        delay: Duration,
    }

    #[async_trait]
    impl AgentUnderTest for SlowAgent {
        async fn generate(&self, _prompt: &str, _history: &[ChatMessage]) -> Result<String, LLMError> {
            tokio::time::sleep(self.delay).await;
            Ok(GATHERING_REPLY.to_string())
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Unavailable("connection refused".into()))
        }

        fn dimension(&self) -> Option<usize> {
            None
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn scores_both_phases_and_closes_the_conversation() {
        let runner = runner(&[GATHERING_VERDICT, RESOLUTION_VERDICT], EvalConfig::default());
        let report = runner
            .run(&scenario(), &agent(&[GATHERING_REPLY, RESOLUTION_REPLY]))
            .await
            .expect("scenario runs");

        assert_eq!(report.final_state, PhaseState::Closed);
        assert_eq!(report.turns.len(), 2);
        assert_eq!(report.turns[0].state, PhaseState::Gathering);
        assert_eq!(report.turns[1].state, PhaseState::Resolution);
        assert_eq!(report.scored_turns(), 2);

        let (rubric, verdict) = report.turns[1].scored().expect("resolution scored");
        assert_eq!(rubric.resolution, 1.0);
        assert_eq!(verdict.scores.resolution_quality, Some(8));
        assert!(report.turns.iter().all(|turn| turn.failure_modes.is_empty()));
        assert!(report.means.is_some());
    }

    #[tokio::test]
    async fn agent_sees_briefing_and_previous_exchange() {
        let runner = runner(&[GATHERING_VERDICT, RESOLUTION_VERDICT], EvalConfig::default());
        let agent = RecordingAgent {
            replies: Mutex::new(vec![GATHERING_REPLY.into(), RESOLUTION_REPLY.into()]),
            seen: Mutex::new(Vec::new()),
        };
        runner.run(&scenario(), &agent).await.expect("scenario runs");

        let seen = agent.seen.lock().expect("lock");
        assert_eq!(seen[0].len(), 1);
        assert!(seen[0][0].text().unwrap_or_default().contains("ORD-482913"));
        assert_eq!(seen[1].len(), 3);
        assert_eq!(seen[1][2].text(), Some(GATHERING_REPLY));
    }

    #[tokio::test]
    async fn unavailable_agent_is_a_failed_turn() {
        let runner = runner(&[RESOLUTION_VERDICT], EvalConfig::default());
        let report = runner
            .run(&scenario(), &agent(&[]))
            .await
            .expect("turn failures stay in the report");

        assert!(report.turns.iter().all(|turn| turn.failure() == Some(TurnFailure::AgentUnavailable)));
        assert!(report.means.is_none());
        assert_eq!(report.final_state, PhaseState::Closed);
    }

    #[tokio::test]
    async fn unavailable_judge_keeps_tracker_tags() {
        let runner = runner(&[], EvalConfig::default());
        let report = runner
            .run(&scenario(), &agent(&["I've already issued a full refund for you.", RESOLUTION_REPLY]))
            .await
            .expect("scenario runs");

        let gathering = &report.turns[0];
        assert_eq!(gathering.failure(), Some(TurnFailure::JudgeUnavailable));
        assert!(gathering.failure_modes.contains(&FailureMode::PhaseViolation));
        match &gathering.outcome {
            TurnOutcome::Failed { classification, .. } => {
                assert_eq!(
                    classification.and_then(|c| c.reason),
                    Some(ViolationReason::PhaseViolation)
                );
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_run_skips_remaining_turns() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = runner(&[], EvalConfig::default()).with_cancellation(cancel);
        let report = runner
            .run(&scenario(), &agent(&[]))
            .await
            .expect("cancelled scenario still reports");

        assert_eq!(report.skipped_turns(), 2);
        assert_eq!(report.final_state, PhaseState::Gathering);
        assert!(report.means.is_none());
    }

    #[tokio::test]
    async fn cancellation_mid_run_skips_later_scenarios() {
        let cancel = CancellationToken::new();
        let eval = EvalRunner::new(runner(&[GATHERING_VERDICT], EvalConfig::default()))
            .with_cancellation(cancel.clone());
        let agent = CancellingAgent { cancel };
        let scenarios = [
            scenario(),
            Scenario {
                id: ScenarioId::Miss,
                ..scenario()
            },
        ];

        let report = eval.run(&scenarios, &agent).await.expect("cancelled run still reports");

        assert_eq!(report.scenarios.len(), 2);
        let first = &report.scenarios[0];
        assert!(first.turns[0].scored().is_some());
        assert!(first.turns[1].is_skipped());
        assert_eq!(first.final_state, PhaseState::Gathering);

        let second = &report.scenarios[1];
        assert_eq!(second.scenario, ScenarioId::Miss);
        assert_eq!(second.turns.len(), 2);
        assert!(second.turns.iter().all(TurnRecord::is_skipped));
        assert!(second.means.is_none());

        assert_eq!(report.skipped_turns, 3);
        assert_eq!(report.scenarios_included, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_agent_times_out_into_a_failed_turn() {
        let config = EvalConfig {
            timeouts: TimeoutConfig {
                agent_timeout_ms: 1_000,
                retry_backoff_ms: 10,
                ..TimeoutConfig::default()
            },
            ..EvalConfig::default()
        };
        let runner = runner(&[], config);
        let agent = SlowAgent {
            delay: Duration::from_secs(5),
        };

        let report = runner.run(&scenario(), &agent).await.expect("timeouts stay in the report");

        assert_eq!(report.turns.len(), 2);
        for turn in &report.turns {
            assert_eq!(turn.failure(), Some(TurnFailure::AgentUnavailable));
            assert!(turn.response.is_none());
        }
        assert!(report.means.is_none());
        assert_eq!(report.final_state, PhaseState::Closed);
    }

    #[tokio::test]
    async fn guard_rewrites_a_premature_remedy() {
        let config = EvalConfig {
            gathering_guard: true,
            ..EvalConfig::default()
        };
        let runner = runner(&[GATHERING_VERDICT, RESOLUTION_VERDICT], config);
        let premature = "Sorry about that! I've added a credit to your account.";
        let report = runner
            .run(&scenario(), &agent(&[premature, GATHERING_REPLY, RESOLUTION_REPLY]))
            .await
            .expect("scenario runs");

        let gathering = &report.turns[0];
        assert!(gathering.guard_rewritten());
        assert_eq!(gathering.original_response.as_deref(), Some(premature));
        assert_eq!(gathering.response.as_deref(), Some(GATHERING_REPLY));
        assert!(!gathering.failure_modes.contains(&FailureMode::PhaseViolation));
    }

    #[tokio::test]
    async fn broken_embedder_aborts_the_scenario() {
        let judge = JudgeScorer::new(Arc::new(ScriptedProvider::from_responses([GATHERING_VERDICT])), "judge")
            .expect("templates");
        let runner = ScenarioRunner::new(EvalConfig::default(), Arc::new(DownEmbedder), judge).expect("valid config");
        let err = runner
            .run(&scenario(), &agent(&[GATHERING_REPLY]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn preflight_fails_before_any_agent_call() {
        let judge = JudgeScorer::new(Arc::new(ScriptedProvider::new()), "judge").expect("templates");
        let eval = EvalRunner::from_config(EvalConfig::default(), Arc::new(DownEmbedder), judge).expect("valid config");
        let agent = RecordingAgent {
            replies: Mutex::new(vec![GATHERING_REPLY.into()]),
            seen: Mutex::new(Vec::new()),
        };

        let err = eval.run(&[scenario()], &agent).await.unwrap_err();
        assert!(matches!(err, EvalError::EmbeddingUnavailable(_)));
        assert!(agent.seen.lock().expect("lock").is_empty());
    }

    #[test]
    fn tracker_tags_map_violation_reasons() {
        let classification = |reason: Option<ViolationReason>| PhaseClassification {
            state: PhaseState::Gathering,
            violated: reason.is_some(),
            reason,
        };
        assert_eq!(
            tracker_tags(&classification(Some(ViolationReason::EmptyResponse))),
            BTreeSet::from([FailureMode::PhaseViolation])
        );
        assert_eq!(
            tracker_tags(&classification(Some(ViolationReason::ResolutionMissing))),
            BTreeSet::from([FailureMode::ResolutionFailure])
        );
        assert!(tracker_tags(&classification(None)).is_empty());
    }
}
