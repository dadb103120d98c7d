//! Structured judgment by an external reasoning model.
//!
//! The judge model reasons; this module only builds the rubric prompt, parses
//! the reply, keeps every score inside `[0, 10]` and derives failure-mode tags
//! from low scores so that a flag is never lost because the judge forgot it.

use std::{collections::BTreeSet, fmt, sync::Arc};

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    error::EvalError,
    eval::{
        call::{bounded_call, TimeoutConfig},
        phase::Phase,
        scenario::{ConversationTurn, Scenario},
    },
    types::{ChatMessage, CompletionRequest},
    LLMError, LLMProvider,
};

const SYSTEM_PROMPT: &str =
    "You are an expert evaluator of customer support chatbot quality. Reply with a single JSON object and nothing else.";

const RUBRIC_TEMPLATE: &str = r#"**Context:**
- Scenario Type: {{scenario}}
- Conversation Phase: {{phase_number}} ({{phase_title}})
- Order on file: {{order_id}}, status {{order_status}}, ETA {{order_eta}}, items: {{#each order_items}}{{#if @index}}, {{/if}}{{this}}{{/each}}
- Support policy: {{policy}}
- User Query: "{{user_message}}"
- Agent Response: "{{agent_response}}"

**Evaluation Task:**
Rate the agent's response on each dimension below (integer, 0-10 scale):
{{#each dimensions}}
- **{{this.name}}**: {{this.description}}
{{/each}}

**Phase-Specific Requirements:**
{{#if gathering}}- Phase 1: Start with empathy, gather information, ask ONE clarifying question. DO NOT offer solutions, credits, or resolutions.{{else}}- Phase 2: Provide a clear solution based on the confirmed details, then ask for final confirmation.{{/if}}

**Output Format (JSON only, no other text):**
{
{{#each dimensions}}    "{{this.name}}": <score 0-10>,
{{/each}}    "overall_score": <average of the scores above>,
    "justification": "<2-3 sentence explanation of the scores>",
    "strengths": ["<strength>"],
    "weaknesses": ["<weakness>"],
    "failure_modes": [<zero or more of {{#each failure_modes}}{{#if @index}}, {{/if}}"{{this}}"{{/each}}>]
}"#;

const PAIRWISE_TEMPLATE: &str = r#"You are comparing two customer support chatbot responses.

**User Query**: "{{user_message}}"

**Response A**: "{{response_a}}"

**Response B**: "{{response_b}}"

**Task**: Determine which response is better for customer support.

**Output Format (JSON only):**
{
    "winner": "A" or "B" or "tie",
    "confidence": <0.0-1.0, how confident you are>,
    "reasoning": "<2-3 sentences explaining your choice>",
    "dimension_comparison": {
        "empathy": "A" or "B" or "tie",
        "accuracy": "A" or "B" or "tie",
        "clarity": "A" or "B" or "tie",
        "professionalism": "A" or "B" or "tie"
    }
}"#;

/// Closed set of conversational defects a turn can be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    PhaseViolation,
    EmpathyFailure,
    ResolutionQualityFailure,
    ResolutionFailure,
    AccuracyFailure,
    JudgeParseError,
}

impl FailureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureMode::PhaseViolation => "phase_violation",
            FailureMode::EmpathyFailure => "empathy_failure",
            FailureMode::ResolutionQualityFailure => "resolution_quality_failure",
            FailureMode::ResolutionFailure => "resolution_failure",
            FailureMode::AccuracyFailure => "accuracy_failure",
            FailureMode::JudgeParseError => "judge_parse_error",
        }
    }

    /// Map a free-form judge tag onto the closed set. Parse errors are never
    /// accepted from the judge itself.
    pub fn from_judge_tag(tag: &str) -> Option<FailureMode> {
        let key = tag.trim().to_lowercase().replace([' ', '-'], "_");
        let mode = match key.as_str() {
            "phase_violation" | "premature_resolution" | "early_resolution" => {
                FailureMode::PhaseViolation
            }
            "empathy_failure" | "lack_of_empathy" | "no_empathy" => FailureMode::EmpathyFailure,
            "resolution_quality_failure" | "poor_resolution" | "weak_resolution" => {
                FailureMode::ResolutionQualityFailure
            }
            "resolution_failure" | "no_resolution" | "missing_resolution" => {
                FailureMode::ResolutionFailure
            }
            "accuracy_failure" | "hallucination" | "inaccuracy" | "factual_error" => {
                FailureMode::AccuracyFailure
            }
            _ => return None,
        };
        Some(mode)
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub empathy: u8,
    pub accuracy: u8,
    pub policy_compliance: u8,
    pub phase_compliance: u8,
    /// Only judged in RESOLUTION.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_quality: Option<u8>,
}

impl DimensionScores {
    pub fn zero(phase: Phase) -> Self {
        Self {
            empathy: 0,
            accuracy: 0,
            policy_compliance: 0,
            phase_compliance: 0,
            resolution_quality: (phase == Phase::Resolution).then_some(0),
        }
    }

    pub fn mean(&self) -> f64 {
        let mut values = vec![
            self.empathy,
            self.accuracy,
            self.policy_compliance,
            self.phase_compliance,
        ];
        values.extend(self.resolution_quality);
        values.iter().map(|v| f64::from(*v)).sum::<f64>() / values.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub scores: DimensionScores,
    pub overall_score: f64,
    pub justification: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub failure_modes: BTreeSet<FailureMode>,
}

impl JudgeVerdict {
    /// All-zero verdict for a reply that could not be parsed.
    pub fn parse_failure(phase: Phase, error: &JudgeParseError) -> Self {
        Self {
            scores: DimensionScores::zero(phase),
            overall_score: 0.0,
            justification: format!("judge reply could not be parsed: {error}"),
            strengths: Vec::new(),
            weaknesses: vec!["Evaluation failed".to_string()],
            failure_modes: BTreeSet::from([FailureMode::JudgeParseError]),
        }
    }

    /// All-zero verdict for an empty agent reply, tagged by the thresholds.
    pub fn empty_response(phase: Phase, thresholds: &JudgeThresholds) -> Self {
        let scores = DimensionScores::zero(phase);
        Self {
            failure_modes: thresholds.derive_tags(&scores, phase),
            scores,
            overall_score: 0.0,
            justification: "The agent returned an empty response.".to_string(),
            strengths: Vec::new(),
            weaknesses: vec!["No response was given".to_string()],
        }
    }
}

/// Scores below these values raise the matching failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeThresholds {
    pub phase_compliance: u8,
    pub empathy: u8,
    pub accuracy: u8,
    pub resolution_failure: u8,
    pub resolution_quality: u8,
}

impl Default for JudgeThresholds {
    fn default() -> Self {
        Self {
            phase_compliance: 5,
            empathy: 5,
            accuracy: 5,
            resolution_failure: 3,
            resolution_quality: 5,
        }
    }
}

impl JudgeThresholds {
    pub fn validate(&self) -> Result<(), EvalError> {
        let values = [
            self.phase_compliance,
            self.empathy,
            self.accuracy,
            self.resolution_failure,
            self.resolution_quality,
        ];
        if values.iter().any(|value| *value > 10) {
            return Err(EvalError::InvalidConfig(
                "judge thresholds must be within [0, 10]".to_string(),
            ));
        }
        if self.resolution_failure > self.resolution_quality {
            return Err(EvalError::InvalidConfig(
                "judge.resolution_failure must not exceed judge.resolution_quality".to_string(),
            ));
        }
        Ok(())
    }

    pub fn derive_tags(&self, scores: &DimensionScores, phase: Phase) -> BTreeSet<FailureMode> {
        let mut tags = BTreeSet::new();
        if scores.phase_compliance < self.phase_compliance {
            tags.insert(FailureMode::PhaseViolation);
        }
        if scores.empathy < self.empathy {
            tags.insert(FailureMode::EmpathyFailure);
        }
        if scores.accuracy < self.accuracy {
            tags.insert(FailureMode::AccuracyFailure);
        }
        if phase == Phase::Resolution {
            if let Some(quality) = scores.resolution_quality {
                if quality < self.resolution_failure {
                    tags.insert(FailureMode::ResolutionFailure);
                } else if quality < self.resolution_quality {
                    tags.insert(FailureMode::ResolutionQualityFailure);
                }
            }
        }
        tags
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JudgeParseError {
    #[error("reply contains no JSON object")]
    NoJson,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing dimension `{0}`")]
    MissingDimension(&'static str),
    #[error("dimension `{dimension}` is not numeric: {value}")]
    NonNumeric { dimension: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("judge unavailable: {0}")]
    Unavailable(#[from] LLMError),
    #[error("judge prompt could not be rendered: {0}")]
    Prompt(#[from] handlebars::RenderError),
}

const BASE_DIMENSIONS: [(&str, &str); 4] = [
    (
        "empathy",
        "Does the agent acknowledge the customer's frustration with genuine care? 0-3 robotic or dismissive, 4-6 scripted acknowledgment, 7-8 genuine, 9-10 exceptional.",
    ),
    (
        "accuracy",
        "Does the agent use correct information consistent with the order on file? 0-3 hallucinated or wrong facts, 4-6 vague, 7-8 accurate with specifics, 9-10 precise and verified.",
    ),
    (
        "policy_compliance",
        "Does the response follow the support policy above? 0-3 major violations, 4-6 minor deviations, 7-8 follows policy, 9-10 perfect adherence with good judgment.",
    ),
    (
        "phase_compliance",
        "Does the response follow the phase rules below? 0-3 major violations such as offering credits in Phase 1, 4-6 partial compliance, 7-8 correct, 9-10 exemplary.",
    ),
];

const RESOLUTION_DIMENSION: (&str, &str) = (
    "resolution_quality",
    "Is the proposed solution appropriate and effective? 0-3 none or inappropriate, 4-6 partial or unclear next steps, 7-8 good and clearly communicated, 9-10 optimal with clear confirmation.",
);

/// Dimension names sent to the judge for `phase`.
pub fn dimensions_for(phase: Phase) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = BASE_DIMENSIONS.iter().map(|(name, _)| *name).collect();
    if phase == Phase::Resolution {
        names.push(RESOLUTION_DIMENSION.0);
    }
    names
}

/// Pull a JSON object out of a judge reply: the whole body, a fenced
/// `json` block, or the last balanced object in surrounding prose.
pub fn extract_json_object(content: &str) -> Result<Map<String, Value>, JudgeParseError> {
    let trimmed = content.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(map);
    }

    let candidate = extract_json_from_fenced_block(trimmed)
        .filter(|block| block.starts_with('{'))
        .or_else(|| extract_json_from_mixed_content(trimmed))
        .ok_or(JudgeParseError::NoJson)?;

    match serde_json::from_str::<Value>(&candidate) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(JudgeParseError::NoJson),
        Err(err) => Err(JudgeParseError::InvalidJson(err.to_string())),
    }
}

fn extract_json_from_fenced_block(content: &str) -> Option<String> {
    let start = content.find("```json").or_else(|| content.find("```"))?;
    let remainder = &content[start..];
    let after_language = remainder.find('\n')?;
    let body = &remainder[after_language + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

// Quote/escape-aware scan for the last complete top-level object.
fn extract_json_from_mixed_content(content: &str) -> Option<String> {
    let mut start_pos = None;
    let mut last = None;
    let mut depth: i32 = 0;
    let mut in_str = false;
    let mut escaped = false;

    for (i, b) in content.bytes().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }

        match b {
            b'"' if depth > 0 => in_str = true,
            b'{' => {
                if depth == 0 {
                    start_pos = Some(i);
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    last = start_pos.map(|start| (start, i + 1));
                }
            }
            _ => {}
        }
    }

    last.map(|(start, end)| content[start..end].to_string())
}

fn coerce_score(dimension: &'static str, value: Option<&Value>) -> Result<u8, JudgeParseError> {
    let raw = match value {
        None | Some(Value::Null) => return Err(JudgeParseError::MissingDimension(dimension)),
        Some(value) => number_of(value).ok_or_else(|| JudgeParseError::NonNumeric {
            dimension,
            value: value.to_string(),
        })?,
    };

    let rounded = raw.round();
    if !(0.0..=10.0).contains(&rounded) {
        warn!(dimension, value = raw, "judge score out of range, clamping");
    }
    Ok(rounded.clamp(0.0, 10.0) as u8)
}

fn number_of(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number
            .as_i64()
            .map(|v| v as f64)
            .or_else(|| number.as_f64()),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        Some(Value::String(item)) if !item.trim().is_empty() => vec![item.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Parse a judge reply into a verdict for a turn in `phase`.
pub fn parse_verdict(
    reply: &str,
    phase: Phase,
    thresholds: &JudgeThresholds,
) -> Result<JudgeVerdict, JudgeParseError> {
    let object = extract_json_object(reply)?;

    let scores = DimensionScores {
        empathy: coerce_score("empathy", object.get("empathy"))?,
        accuracy: coerce_score("accuracy", object.get("accuracy"))?,
        policy_compliance: coerce_score("policy_compliance", object.get("policy_compliance"))?,
        phase_compliance: coerce_score("phase_compliance", object.get("phase_compliance"))?,
        resolution_quality: match phase {
            Phase::Resolution => Some(coerce_score(
                "resolution_quality",
                object.get("resolution_quality"),
            )?),
            Phase::Gathering => None,
        },
    };

    let overall_score = match object.get("overall_score").and_then(number_of) {
        Some(overall) => {
            if !(0.0..=10.0).contains(&overall) {
                warn!(value = overall, "judge overall_score out of range, clamping");
            }
            overall.clamp(0.0, 10.0)
        }
        None => scores.mean(),
    };

    let mut failure_modes = BTreeSet::new();
    for tag in string_list(object.get("failure_modes")) {
        match FailureMode::from_judge_tag(&tag) {
            Some(mode) => {
                failure_modes.insert(mode);
            }
            None => debug!(tag = %tag, "dropping unknown judge failure mode"),
        }
    }
    failure_modes.extend(thresholds.derive_tags(&scores, phase));

    Ok(JudgeVerdict {
        scores,
        overall_score,
        justification: object
            .get("justification")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        strengths: string_list(object.get("strengths")),
        weaknesses: string_list(object.get("weaknesses")),
        failure_modes,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preference {
    A,
    B,
    Tie,
}

impl Preference {
    fn parse(value: Option<&Value>) -> Preference {
        let choice = value
            .and_then(Value::as_str)
            .map(|v| v.trim().to_ascii_lowercase());
        match choice.as_deref() {
            Some("a") => Preference::A,
            Some("b") => Preference::B,
            _ => Preference::Tie,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionPreferences {
    pub empathy: Preference,
    pub accuracy: Preference,
    pub clarity: Preference,
    pub professionalism: Preference,
}

impl DimensionPreferences {
    fn tie() -> Self {
        Self {
            empathy: Preference::Tie,
            accuracy: Preference::Tie,
            clarity: Preference::Tie,
            professionalism: Preference::Tie,
        }
    }
}

/// Outcome of an A/B comparison between two candidate replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseVerdict {
    pub winner: Preference,
    pub confidence: f64,
    pub reasoning: String,
    pub dimensions: DimensionPreferences,
}

impl PairwiseVerdict {
    pub fn undecided(reasoning: impl Into<String>) -> Self {
        Self {
            winner: Preference::Tie,
            confidence: 0.0,
            reasoning: reasoning.into(),
            dimensions: DimensionPreferences::tie(),
        }
    }

    /// Malformed replies fall back to an undecided tie.
    pub fn parse(reply: &str) -> Self {
        let object = match extract_json_object(reply) {
            Ok(object) => object,
            Err(err) => return Self::undecided(format!("Error in comparison: {err}")),
        };
        let dimensions = object.get("dimension_comparison");
        let dimension = |name: &str| Preference::parse(dimensions.and_then(|d| d.get(name)));

        Self {
            winner: Preference::parse(object.get("winner")),
            confidence: object
                .get("confidence")
                .and_then(number_of)
                .map_or(0.0, |c| c.clamp(0.0, 1.0)),
            reasoning: object
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            dimensions: DimensionPreferences {
                empathy: dimension("empathy"),
                accuracy: dimension("accuracy"),
                clarity: dimension("clarity"),
                professionalism: dimension("professionalism"),
            },
        }
    }
}

/// Judge backed by any chat-completion provider.
pub struct JudgeScorer {
    provider: Arc<dyn LLMProvider>,
    model: String,
    thresholds: JudgeThresholds,
    timeouts: TimeoutConfig,
    templates: Handlebars<'static>,
}

impl fmt::Debug for JudgeScorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JudgeScorer")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

impl JudgeScorer {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Result<Self, EvalError> {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        templates.register_escape_fn(handlebars::no_escape);
        templates
            .register_template_string("rubric", RUBRIC_TEMPLATE)
            .map_err(|err| EvalError::InvalidConfig(format!("rubric template: {err}")))?;
        templates
            .register_template_string("pairwise", PAIRWISE_TEMPLATE)
            .map_err(|err| EvalError::InvalidConfig(format!("pairwise template: {err}")))?;

        Ok(Self {
            provider,
            model: model.into(),
            thresholds: JudgeThresholds::default(),
            timeouts: TimeoutConfig::default(),
            templates,
        })
    }

    pub fn with_thresholds(mut self, thresholds: JudgeThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn thresholds(&self) -> &JudgeThresholds {
        &self.thresholds
    }

    /// Render the rubric query for one turn.
    pub fn render_prompt(
        &self,
        turn: &ConversationTurn,
        scenario: &Scenario,
    ) -> Result<String, handlebars::RenderError> {
        let mut dimensions: Vec<Value> = BASE_DIMENSIONS
            .iter()
            .map(|(name, description)| json!({ "name": name, "description": description }))
            .collect();
        if turn.phase == Phase::Resolution {
            let (name, description) = RESOLUTION_DIMENSION;
            dimensions.push(json!({ "name": name, "description": description }));
        }
        let failure_modes: Vec<&str> = [
            FailureMode::PhaseViolation,
            FailureMode::EmpathyFailure,
            FailureMode::ResolutionQualityFailure,
            FailureMode::ResolutionFailure,
            FailureMode::AccuracyFailure,
        ]
        .iter()
        .map(|mode| mode.as_str())
        .collect();

        self.templates.render(
            "rubric",
            &json!({
                "scenario": scenario.id.as_str(),
                "phase_number": turn.phase.number(),
                "phase_title": turn.phase.title(),
                "gathering": turn.phase == Phase::Gathering,
                "order_id": scenario.order.order_id,
                "order_status": scenario.order.status,
                "order_eta": scenario.order.eta,
                "order_items": scenario.order.items,
                "policy": scenario.policy,
                "user_message": turn.user_message,
                "agent_response": turn.agent_response,
                "dimensions": dimensions,
                "failure_modes": failure_modes,
            }),
        )
    }

    /// Judge one turn. Unparseable replies become a zero verdict tagged
    /// `judge_parse_error`; only an unreachable judge is an error.
    pub async fn judge(
        &self,
        turn: &ConversationTurn,
        scenario: &Scenario,
    ) -> Result<JudgeVerdict, JudgeError> {
        if turn.agent_response.trim().is_empty() {
            debug!(scenario = %scenario.id, phase = turn.phase.as_str(), "empty response, skipping judge call");
            return Ok(JudgeVerdict::empty_response(turn.phase, &self.thresholds));
        }

        let prompt = self.render_prompt(turn, scenario)?;
        let reply = self.ask(prompt, "judge").await?;

        match parse_verdict(&reply, turn.phase, &self.thresholds) {
            Ok(verdict) => {
                debug!(
                    scenario = %scenario.id,
                    phase = turn.phase.as_str(),
                    overall = verdict.overall_score,
                    tags = verdict.failure_modes.len(),
                    "judge verdict"
                );
                Ok(verdict)
            }
            Err(err) => {
                warn!(scenario = %scenario.id, phase = turn.phase.as_str(), error = %err, "judge reply unparseable");
                Ok(JudgeVerdict::parse_failure(turn.phase, &err))
            }
        }
    }

    /// Ask the judge which of two replies to the same message is better.
    pub async fn compare(
        &self,
        user_message: &str,
        response_a: &str,
        response_b: &str,
    ) -> Result<PairwiseVerdict, JudgeError> {
        let prompt = self.templates.render(
            "pairwise",
            &json!({
                "user_message": user_message,
                "response_a": response_a,
                "response_b": response_b,
            }),
        )?;
        let reply = self.ask(prompt, "judge_compare").await?;
        Ok(PairwiseVerdict::parse(&reply))
    }

    async fn ask(&self, prompt: String, label: &'static str) -> Result<String, LLMError> {
        let mut request = CompletionRequest::new(
            self.model.clone(),
            vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)],
        )
        .with_temperature(0.0);
        if self.provider.capabilities().supports_json_mode {
            request = request.with_response_format(json!({ "type": "json_object" }));
        }

        let response = bounded_call(
            label,
            self.timeouts.judge_timeout(),
            self.timeouts.retry_backoff(),
            || self.provider.complete(request.clone()),
        )
        .await?;
        Ok(response.message.content.unwrap_or_default())
    }
}
