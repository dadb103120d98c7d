//! Per-turn records, per-scenario means, corpus statistics and the report
//! artifact.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
    fs::{self, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::EvalError,
    eval::{
        judge::{FailureMode, JudgeVerdict},
        phase::{Phase, PhaseClassification, PhaseState},
        scenario::{ResolutionType, Scenario, ScenarioId},
        semantic::RubricScore,
    },
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnFailure {
    AgentUnavailable,
    JudgeUnavailable,
}

impl TurnFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnFailure::AgentUnavailable => "agent_unavailable",
            TurnFailure::JudgeUnavailable => "judge_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Scored {
        classification: PhaseClassification,
        rubric: RubricScore,
        verdict: JudgeVerdict,
    },
    Failed {
        reason: TurnFailure,
        message: String,
        classification: Option<PhaseClassification>,
    },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub index: usize,
    pub phase: Phase,
    /// Machine state the turn happened in.
    pub state: PhaseState,
    pub user_message: String,
    pub response: Option<String>,
    /// Set when the gathering guard replaced the agent's first reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_response: Option<String>,
    pub outcome: TurnOutcome,
    pub failure_modes: BTreeSet<FailureMode>,
}

impl TurnRecord {
    pub fn skipped(index: usize, phase: Phase, state: PhaseState, user_message: String) -> Self {
        Self {
            index,
            phase,
            state,
            user_message,
            response: None,
            original_response: None,
            outcome: TurnOutcome::Skipped,
            failure_modes: BTreeSet::new(),
        }
    }

    pub fn scored(&self) -> Option<(&RubricScore, &JudgeVerdict)> {
        match &self.outcome {
            TurnOutcome::Scored { rubric, verdict, .. } => Some((rubric, verdict)),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<TurnFailure> {
        match &self.outcome {
            TurnOutcome::Failed { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Skipped)
    }

    pub fn guard_rewritten(&self) -> bool {
        self.original_response.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RubricMeans {
    pub accuracy: f64,
    pub empathy: f64,
    pub resolution: f64,
    pub clarity_tone: f64,
    pub aggregate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JudgeMeans {
    pub empathy: f64,
    pub accuracy: f64,
    pub policy_compliance: f64,
    pub phase_compliance: f64,
    pub resolution_quality: Option<f64>,
    pub overall_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Means {
    pub rubric: RubricMeans,
    pub judge: JudgeMeans,
}

impl Means {
    fn from_turns<'a>(scored: impl Iterator<Item = (&'a RubricScore, &'a JudgeVerdict)>) -> Option<Self> {
        let scored: Vec<_> = scored.collect();
        let rubric = |f: fn(&RubricScore) -> f64| mean(scored.iter().map(|(r, _)| f(r)));
        let judge = |f: fn(&JudgeVerdict) -> f64| mean(scored.iter().map(|(_, v)| f(v)));

        Some(Self {
            rubric: RubricMeans {
                accuracy: rubric(|r| r.accuracy)?,
                empathy: rubric(|r| r.empathy)?,
                resolution: rubric(|r| r.resolution)?,
                clarity_tone: rubric(|r| r.clarity_tone)?,
                aggregate: rubric(|r| r.aggregate)?,
            },
            judge: JudgeMeans {
                empathy: judge(|v| f64::from(v.scores.empathy))?,
                accuracy: judge(|v| f64::from(v.scores.accuracy))?,
                policy_compliance: judge(|v| f64::from(v.scores.policy_compliance))?,
                phase_compliance: judge(|v| f64::from(v.scores.phase_compliance))?,
                resolution_quality: mean(
                    scored
                        .iter()
                        .filter_map(|(_, v)| v.scores.resolution_quality.map(f64::from)),
                ),
                overall_score: judge(|v| v.overall_score)?,
            },
        })
    }

    fn mean_of(all: &[Means]) -> Option<Self> {
        let rubric = |f: fn(&Means) -> f64| mean(all.iter().map(f));

        Some(Self {
            rubric: RubricMeans {
                accuracy: rubric(|m| m.rubric.accuracy)?,
                empathy: rubric(|m| m.rubric.empathy)?,
                resolution: rubric(|m| m.rubric.resolution)?,
                clarity_tone: rubric(|m| m.rubric.clarity_tone)?,
                aggregate: rubric(|m| m.rubric.aggregate)?,
            },
            judge: JudgeMeans {
                empathy: rubric(|m| m.judge.empathy)?,
                accuracy: rubric(|m| m.judge.accuracy)?,
                policy_compliance: rubric(|m| m.judge.policy_compliance)?,
                phase_compliance: rubric(|m| m.judge.phase_compliance)?,
                resolution_quality: mean(all.iter().filter_map(|m| m.judge.resolution_quality)),
                overall_score: rubric(|m| m.judge.overall_score)?,
            },
        })
    }
}

/// Outcome of one scenario. Frozen once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: ScenarioId,
    pub user_input: String,
    pub order_id: String,
    pub resolution: ResolutionType,
    pub final_state: PhaseState,
    pub turns: Vec<TurnRecord>,
    /// Means over scored turns; `None` when no turn was scored.
    pub means: Option<Means>,
}

impl ScenarioReport {
    pub fn new(scenario: &Scenario, turns: Vec<TurnRecord>, final_state: PhaseState) -> Self {
        let means = Means::from_turns(turns.iter().filter_map(TurnRecord::scored));
        Self {
            scenario: scenario.id,
            user_input: scenario.gathering_prompt(),
            order_id: scenario.order.order_id.clone(),
            resolution: scenario.resolution,
            final_state,
            turns,
            means,
        }
    }

    pub fn scored_turns(&self) -> usize {
        self.turns.iter().filter(|turn| turn.scored().is_some()).count()
    }

    pub fn failed_turns(&self) -> impl Iterator<Item = &TurnRecord> {
        self.turns.iter().filter(|turn| turn.failure().is_some())
    }

    pub fn skipped_turns(&self) -> usize {
        self.turns.iter().filter(|turn| turn.is_skipped()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub mean: f64,
    pub std_dev: f64,
    pub count: usize,
}

impl Stat {
    /// Mean and population standard deviation; `None` for no samples.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mean = mean(values.iter().copied())?;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        Some(Self {
            mean,
            std_dev: variance.sqrt(),
            count: values.len(),
        })
    }
}

const RUBRIC_DIMENSIONS: [&str; 5] = ["accuracy", "empathy", "resolution", "clarity_tone", "aggregate"];
const JUDGE_DIMENSIONS: [&str; 6] = [
    "empathy",
    "accuracy",
    "policy_compliance",
    "phase_compliance",
    "resolution_quality",
    "overall_score",
];

fn rubric_value(rubric: &RubricScore, name: &str) -> Option<f64> {
    match name {
        "accuracy" => Some(rubric.accuracy),
        "empathy" => Some(rubric.empathy),
        "resolution" => Some(rubric.resolution),
        "clarity_tone" => Some(rubric.clarity_tone),
        "aggregate" => Some(rubric.aggregate),
        _ => None,
    }
}

fn judge_value(verdict: &JudgeVerdict, name: &str) -> Option<f64> {
    let scores = &verdict.scores;
    match name {
        "empathy" => Some(f64::from(scores.empathy)),
        "accuracy" => Some(f64::from(scores.accuracy)),
        "policy_compliance" => Some(f64::from(scores.policy_compliance)),
        "phase_compliance" => Some(f64::from(scores.phase_compliance)),
        "resolution_quality" => scores.resolution_quality.map(f64::from),
        "overall_score" => Some(verdict.overall_score),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub phase: Phase,
    pub turns_scored: usize,
    pub rubric: BTreeMap<String, Stat>,
    pub judge: BTreeMap<String, Stat>,
}

impl PhaseStats {
    fn collect(phase: Phase, reports: &[ScenarioReport]) -> Self {
        let scored: Vec<(&RubricScore, &JudgeVerdict)> = reports
            .iter()
            .flat_map(|report| report.turns.iter())
            .filter(|turn| turn.phase == phase)
            .filter_map(TurnRecord::scored)
            .collect();

        let mut rubric = BTreeMap::new();
        for name in RUBRIC_DIMENSIONS {
            let values: Vec<f64> = scored.iter().filter_map(|(r, _)| rubric_value(r, name)).collect();
            if let Some(stat) = Stat::from_values(&values) {
                rubric.insert(name.to_string(), stat);
            }
        }

        let mut judge = BTreeMap::new();
        for name in JUDGE_DIMENSIONS {
            let values: Vec<f64> = scored.iter().filter_map(|(_, v)| judge_value(v, name)).collect();
            if let Some(stat) = Stat::from_values(&values) {
                judge.insert(name.to_string(), stat);
            }
        }

        Self {
            phase,
            turns_scored: scored.len(),
            rubric,
            judge,
        }
    }
}

/// Aggregate of a whole run. Built once, then only rendered and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusReport {
    pub generated_at: DateTime<Local>,
    pub scenarios: Vec<ScenarioReport>,
    /// Mean of the defined scenario means; scenarios without a scored turn
    /// do not contribute.
    pub corpus_means: Option<Means>,
    pub scenarios_included: usize,
    pub phase_stats: Vec<PhaseStats>,
    pub failure_modes: BTreeMap<FailureMode, usize>,
    pub failure_modes_by_phase: BTreeMap<Phase, BTreeMap<FailureMode, usize>>,
    pub turn_failures: BTreeMap<TurnFailure, usize>,
    pub skipped_turns: usize,
}

impl CorpusReport {
    pub fn aggregate(scenarios: Vec<ScenarioReport>) -> Self {
        Self::aggregate_at(scenarios, Local::now())
    }

    pub fn aggregate_at(scenarios: Vec<ScenarioReport>, generated_at: DateTime<Local>) -> Self {
        let defined: Vec<Means> = scenarios.iter().filter_map(|report| report.means).collect();

        let mut failure_modes = BTreeMap::new();
        let mut failure_modes_by_phase: BTreeMap<Phase, BTreeMap<FailureMode, usize>> = BTreeMap::new();
        let mut turn_failures = BTreeMap::new();
        let mut skipped_turns = 0;

        for turn in scenarios.iter().flat_map(|report| report.turns.iter()) {
            for mode in &turn.failure_modes {
                *failure_modes.entry(*mode).or_insert(0) += 1;
                *failure_modes_by_phase
                    .entry(turn.phase)
                    .or_default()
                    .entry(*mode)
                    .or_insert(0) += 1;
            }
            if let Some(reason) = turn.failure() {
                *turn_failures.entry(reason).or_insert(0) += 1;
            }
            if turn.is_skipped() {
                skipped_turns += 1;
            }
        }

        let phase_stats = Phase::ALL
            .iter()
            .map(|phase| PhaseStats::collect(*phase, &scenarios))
            .collect();

        Self {
            generated_at,
            corpus_means: Means::mean_of(&defined),
            scenarios_included: defined.len(),
            scenarios,
            phase_stats,
            failure_modes,
            failure_modes_by_phase,
            turn_failures,
            skipped_turns,
        }
    }

    pub fn timestamp(&self) -> String {
        self.generated_at.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Markdown rendering. The `Generated:` line is the only part that
    /// depends on when the run happened.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Agent Evaluation Report (Dual Evaluation Mode)");
        let _ = writeln!(out, "**Generated:** {}\n", self.timestamp());
        out.push_str(&self.render_body());
        out
    }

    fn render_body(&self) -> String {
        let mut out = String::new();
        out.push_str("This report includes **two evaluation methods**:\n");
        out.push_str("1. **Semantic Similarity**: Reference-based comparison against ideal responses\n");
        out.push_str("2. **LLM-as-Judge**: Model-based evaluation across multiple dimensions\n\n");

        self.render_summary(&mut out);
        for report in &self.scenarios {
            render_scenario(&mut out, report);
        }
        out
    }

    fn render_summary(&self, out: &mut String) {
        let _ = writeln!(out, "## Summary\n");
        let _ = writeln!(
            out,
            "- **Scenarios:** {} ({} with scored turns)",
            self.scenarios.len(),
            self.scenarios_included
        );
        match &self.corpus_means {
            Some(means) => {
                let _ = writeln!(
                    out,
                    "- **Corpus Rubric Score:** {}",
                    percent(means.rubric.aggregate)
                );
                let _ = writeln!(
                    out,
                    "- **Corpus Judge Overall:** {:.1}/10",
                    means.judge.overall_score
                );
            }
            None => {
                let _ = writeln!(out, "- **Corpus Scores:** undefined (no turn was scored)");
            }
        }
        let excluded: Vec<&str> = self
            .scenarios
            .iter()
            .filter(|report| report.means.is_none())
            .map(|report| report.scenario.as_str())
            .collect();
        if !excluded.is_empty() {
            let _ = writeln!(out, "- **Excluded from corpus means:** {}", excluded.join(", "));
        }
        let _ = writeln!(out);

        for stats in &self.phase_stats {
            let _ = writeln!(
                out,
                "### Phase {}: {} ({} scored turns)\n",
                stats.phase.number(),
                stats.phase.title(),
                stats.turns_scored
            );
            if stats.turns_scored == 0 {
                let _ = writeln!(out, "_No scored turns._\n");
                continue;
            }
            let _ = writeln!(out, "| Metric | Mean | Std Dev |");
            let _ = writeln!(out, "|---|---|---|");
            for name in RUBRIC_DIMENSIONS {
                if let Some(stat) = stats.rubric.get(name) {
                    let _ = writeln!(
                        out,
                        "| semantic.{name} | {} | {} |",
                        percent(stat.mean),
                        percent(stat.std_dev)
                    );
                }
            }
            for name in JUDGE_DIMENSIONS {
                if let Some(stat) = stats.judge.get(name) {
                    let _ = writeln!(out, "| judge.{name} | {:.2} | {:.2} |", stat.mean, stat.std_dev);
                }
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "### Failure Modes\n");
        if self.failure_modes.is_empty() {
            let _ = writeln!(out, "_None detected._\n");
        } else {
            let _ = writeln!(out, "| Failure Mode | Total | Phase 1 | Phase 2 |");
            let _ = writeln!(out, "|---|---|---|---|");
            for (mode, total) in &self.failure_modes {
                let per_phase = |phase: Phase| {
                    self.failure_modes_by_phase
                        .get(&phase)
                        .and_then(|counts| counts.get(mode))
                        .copied()
                        .unwrap_or(0)
                };
                let _ = writeln!(
                    out,
                    "| {mode} | {total} | {} | {} |",
                    per_phase(Phase::Gathering),
                    per_phase(Phase::Resolution)
                );
            }
            let _ = writeln!(out);
        }

        if !self.turn_failures.is_empty() || self.skipped_turns > 0 {
            let _ = writeln!(out, "### Turn Failures\n");
            for (reason, count) in &self.turn_failures {
                let _ = writeln!(out, "- {}: {count}", reason.as_str());
            }
            if self.skipped_turns > 0 {
                let _ = writeln!(out, "- skipped: {}", self.skipped_turns);
            }
            let _ = writeln!(out);
        }
        let _ = writeln!(out, "---\n");
    }
}

fn percent(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

fn quote(text: &str) -> String {
    if text.trim().is_empty() {
        return "> _(empty response)_".to_string();
    }
    text.lines()
        .map(|line| format!("> {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_scenario(out: &mut String, report: &ScenarioReport) {
    let _ = writeln!(out, "## Scenario: {}\n", report.scenario);
    let _ = writeln!(out, "### User Input\n`{}`\n", report.user_input);
    let _ = writeln!(
        out,
        "- **Order:** {} (expected resolution: {})",
        report.order_id,
        report.resolution.as_str()
    );
    let failed: Vec<String> = report
        .failed_turns()
        .filter_map(|turn| {
            turn.failure()
                .map(|reason| format!("turn {} {}", turn.index + 1, reason.as_str()))
        })
        .collect();
    if failed.is_empty() {
        let _ = writeln!(out, "- **Turn failures:** none");
    } else {
        let _ = writeln!(out, "- **Turn failures:** {}", failed.join(", "));
    }
    match &report.means {
        Some(means) => {
            let _ = writeln!(
                out,
                "- **Scenario means:** rubric {}, judge overall {:.1}/10\n",
                percent(means.rubric.aggregate),
                means.judge.overall_score
            );
        }
        None => {
            let _ = writeln!(out, "- **Scenario means:** undefined (no scored turns)\n");
        }
    }

    for turn in &report.turns {
        render_turn(out, turn);
    }
    let _ = writeln!(out, "---\n");
}

fn render_turn(out: &mut String, turn: &TurnRecord) {
    let _ = writeln!(out, "### Phase {}: {}\n", turn.phase.number(), turn.phase.title());
    if turn.phase == Phase::Resolution {
        let _ = writeln!(out, "**User:** `{}`\n", turn.user_message);
    }

    match &turn.outcome {
        TurnOutcome::Skipped => {
            let _ = writeln!(out, "_Skipped: the run was cancelled before this turn._\n");
            return;
        }
        TurnOutcome::Failed { reason, message, .. } => {
            if let Some(response) = &turn.response {
                let _ = writeln!(out, "**Agent Response:**\n{}\n", quote(response));
            }
            let _ = writeln!(out, "**Turn failed:** {} ({message})", reason.as_str());
        }
        TurnOutcome::Scored {
            classification,
            rubric,
            verdict,
        } => {
            let _ = writeln!(out, "**Agent Response:**\n{}\n", quote(turn.response.as_deref().unwrap_or_default()));
            if let Some(original) = &turn.original_response {
                let _ = writeln!(out, "**Original Response (rewritten by guard):**\n{}\n", quote(original));
            }
            let phase_check = match classification.reason {
                Some(reason) => format!("violated ({})", reason.as_str()),
                None => "ok".to_string(),
            };
            let _ = writeln!(out, "**Phase Check:** {phase_check}\n");

            let _ = writeln!(out, "**Semantic Evaluation:**");
            let _ = writeln!(
                out,
                "- `Accuracy: {}, Empathy: {}, Resolution: {}, Clarity/Tone: {} | Rubric: {}`\n",
                percent(rubric.accuracy),
                percent(rubric.empathy),
                percent(rubric.resolution),
                percent(rubric.clarity_tone),
                percent(rubric.aggregate)
            );

            let scores = &verdict.scores;
            let _ = writeln!(out, "**LLM-as-Judge Evaluation:**");
            let _ = writeln!(out, "- **Overall Score:** {:.1}/10", verdict.overall_score);
            let _ = writeln!(out, "- **Empathy:** {}/10", scores.empathy);
            if let Some(quality) = scores.resolution_quality {
                let _ = writeln!(out, "- **Resolution Quality:** {quality}/10");
            }
            let _ = writeln!(out, "- **Accuracy:** {}/10", scores.accuracy);
            let _ = writeln!(out, "- **Phase Compliance:** {}/10", scores.phase_compliance);
            let _ = writeln!(out, "- **Policy Compliance:** {}/10", scores.policy_compliance);
            if !verdict.justification.is_empty() {
                let _ = writeln!(out, "- **Justification:** {}", verdict.justification);
            }
            if !verdict.strengths.is_empty() {
                let _ = writeln!(out, "- **Strengths:** {}", verdict.strengths.join(", "));
            }
            if !verdict.weaknesses.is_empty() {
                let _ = writeln!(out, "- **Weaknesses:** {}", verdict.weaknesses.join(", "));
            }
        }
    }

    if !turn.failure_modes.is_empty() {
        let modes: Vec<&str> = turn.failure_modes.iter().map(|mode| mode.as_str()).collect();
        let _ = writeln!(out, "- **Failure Modes:** {}", modes.join(", "));
    }
    let _ = writeln!(out);
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Paths of the two files written for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub markdown: PathBuf,
    pub json: PathBuf,
}

/// Persist `report` as `evaluation_report_<timestamp>.md` and `.json` under
/// `dir`. Existing files are never overwritten; a `-N` suffix is appended
/// instead.
pub fn write_artifacts(dir: impl AsRef<Path>, report: &CorpusReport) -> Result<ArtifactPaths, EvalError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let stem = format!("evaluation_report_{}", report.timestamp());
    let markdown = report.render();
    let json = serde_json::to_string_pretty(report)?;

    for attempt in 0u32.. {
        let name = if attempt == 0 {
            stem.clone()
        } else {
            format!("{stem}-{attempt}")
        };
        let md_path = dir.join(format!("{name}.md"));
        let json_path = dir.join(format!("{name}.json"));

        let mut md_file = match OpenOptions::new().write(true).create_new(true).open(&md_path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        };
        let mut json_file = match OpenOptions::new().write(true).create_new(true).open(&json_path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                drop(md_file);
                fs::remove_file(&md_path)?;
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        md_file.write_all(markdown.as_bytes())?;
        json_file.write_all(json.as_bytes())?;
        info!(markdown = %md_path.display(), json = %json_path.display(), "report written");
        return Ok(ArtifactPaths {
            markdown: md_path,
            json: json_path,
        });
    }

    Err(EvalError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free report file name",
    )))
}
