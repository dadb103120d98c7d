//! Two-phase conversational protocol.
//!
//! Every scripted conversation walks GATHERING (empathy + one clarifying
//! question, no remedy yet) and then RESOLUTION (a concrete fix + a request
//! for confirmation). [`PhaseMachine`] tracks where a conversation is;
//! [`PhaseTracker`] grades a single reply against the phase the script expected.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{error::EvalError, eval::scenario::ConversationTurn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Gathering,
    Resolution,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Gathering, Phase::Resolution];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Gathering => "gathering",
            Phase::Resolution => "resolution",
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Phase::Gathering => 1,
            Phase::Resolution => 2,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Phase::Gathering => "Information Gathering",
            Phase::Resolution => "Resolution",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    Gathering,
    Resolution,
    Closed,
}

impl From<Phase> for PhaseState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Gathering => PhaseState::Gathering,
            Phase::Resolution => PhaseState::Resolution,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// The user answered the clarifying question.
    IssueConfirmed,
    /// The user accepted the proposed fix.
    FixConfirmed,
    ConversationEnded,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid phase transition: {event:?} in state {state:?}")]
pub struct InvalidTransition {
    pub state: PhaseState,
    pub event: PhaseEvent,
}

#[derive(Debug, Clone)]
pub struct PhaseMachine {
    state: PhaseState,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            state: PhaseState::Gathering,
        }
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn apply(&mut self, event: PhaseEvent) -> Result<PhaseState, InvalidTransition> {
        let next = match (self.state, event) {
            (PhaseState::Gathering, PhaseEvent::IssueConfirmed) => PhaseState::Resolution,
            (PhaseState::Resolution, PhaseEvent::FixConfirmed)
            | (PhaseState::Resolution, PhaseEvent::ConversationEnded) => PhaseState::Closed,
            (state, event) => return Err(InvalidTransition { state, event }),
        };
        self.state = next;
        Ok(next)
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    PhaseViolation,
    ResolutionMissing,
    EmptyResponse,
}

impl ViolationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationReason::PhaseViolation => "phase_violation",
            ViolationReason::ResolutionMissing => "resolution_missing",
            ViolationReason::EmptyResponse => "empty_response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseClassification {
    pub state: PhaseState,
    pub violated: bool,
    pub reason: Option<ViolationReason>,
}

/// Phrase lists driving the tense/keyword heuristic. Matching is
/// case-insensitive and anchored at word starts, so `refund` also hits
/// `refunded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseLexicon {
    pub actions: Vec<String>,
    pub definite: Vec<String>,
    pub hypothetical: Vec<String>,
    pub negations: Vec<String>,
    pub confirmation: Vec<String>,
}

impl Default for PhaseLexicon {
    fn default() -> Self {
        fn owned(items: &[&str]) -> Vec<String> {
            items.iter().map(|item| item.to_string()).collect()
        }

        Self {
            actions: owned(&[
                "refund", "credit", "replacement", "replace", "reship", "resend", "escalat",
                "voucher", "compensat", "discount", "reroute", "complaint",
            ]),
            definite: owned(&[
                "i have", "i've", "we have", "we've", "has been", "have been",
                "is being processed", "i just", "already", "i went ahead", "is on its way",
            ]),
            hypothetical: owned(&[
                "i can", "i could", "we can", "would you like", "would you prefer", "shall i",
                "do you want", "if you", "i'd be happy to", "can offer", "may i",
                "once you confirm",
            ]),
            negations: owned(&[
                "not", "cannot", "can't", "unable to", "won't", "don't", "didn't", "haven't",
                "hasn't", "no longer",
            ]),
            confirmation: owned(&[
                "please confirm", "does this resolve", "does that work", "is that okay",
                "let me know if", "would you like",
            ]),
        }
    }
}

/// Compiled alternation over a phrase list. An empty list never matches.
#[derive(Debug, Clone)]
pub(crate) struct KeywordSet {
    regex: Option<Regex>,
}

impl KeywordSet {
    pub(crate) fn new(phrases: &[String], whole_words: bool) -> Result<Self, EvalError> {
        let alternatives: Vec<String> = phrases
            .iter()
            .map(|phrase| normalize(phrase))
            .filter(|phrase| !phrase.is_empty())
            .map(|phrase| regex::escape(&phrase))
            .collect();
        if alternatives.is_empty() {
            return Ok(Self { regex: None });
        }

        let tail = if whole_words { r"\b" } else { "" };
        let pattern = format!(r"\b(?:{}){}", alternatives.join("|"), tail);
        let regex = Regex::new(&pattern)
            .map_err(|err| EvalError::InvalidConfig(format!("lexicon pattern: {err}")))?;
        Ok(Self { regex: Some(regex) })
    }

    /// `text` must already be normalised.
    pub(crate) fn is_match(&self, text: &str) -> bool {
        self.regex.as_ref().is_some_and(|regex| regex.is_match(text))
    }

    /// Byte offset of the leftmost match.
    pub(crate) fn find(&self, text: &str) -> Option<usize> {
        self.regex
            .as_ref()
            .and_then(|regex| regex.find(text))
            .map(|found| found.start())
    }

    pub(crate) fn count(&self, text: &str) -> usize {
        self.regex
            .as_ref()
            .map_or(0, |regex| regex.find_iter(text).count())
    }
}

static RE_SENTENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^.!?\n]+[.!?]*").unwrap());
static RE_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,;:]").unwrap());
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Lower-case, straighten typographic quotes and collapse whitespace.
pub(crate) fn normalize(text: &str) -> String {
    let lowered = text
        .to_lowercase()
        .replace(['\u{2019}', '\u{2018}'], "'")
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace('\u{2013}', "-");
    RE_WHITESPACE.replace_all(lowered.trim(), " ").into_owned()
}

pub(crate) fn split_sentences(text: &str) -> Vec<&str> {
    RE_SENTENCE
        .find_iter(text)
        .map(|m| m.as_str().trim())
        .filter(|sentence| !sentence.is_empty())
        .collect()
}

fn split_clauses(sentence: &str) -> impl Iterator<Item = &str> {
    RE_CLAUSE
        .split(sentence)
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
}

/// Sentences ending in `?`; a doubled `??` is still one question.
pub(crate) fn count_questions(normalized: &str) -> usize {
    split_sentences(normalized)
        .iter()
        .filter(|sentence| sentence.ends_with('?'))
        .count()
}

/// Decides whether a reply states an action as already done.
#[derive(Debug, Clone)]
pub(crate) struct CommitmentMatcher {
    definite: KeywordSet,
    hypothetical: KeywordSet,
    negations: KeywordSet,
}

impl CommitmentMatcher {
    pub(crate) fn new(lexicon: &PhaseLexicon) -> Result<Self, EvalError> {
        Ok(Self {
            definite: KeywordSet::new(&lexicon.definite, true)?,
            hypothetical: KeywordSet::new(&lexicon.hypothetical, true)?,
            negations: KeywordSet::new(&lexicon.negations, true)?,
        })
    }

    /// A clause commits when it carries an action keyword and a definite
    /// marker, and no hypothetical or negating phrase comes before the action.
    /// `normalized` must come from [`normalize`].
    pub(crate) fn commits_to(&self, actions: &KeywordSet, normalized: &str) -> bool {
        split_sentences(normalized)
            .into_iter()
            .flat_map(split_clauses)
            .any(|clause| {
                let Some(action_at) = actions.find(clause) else {
                    return false;
                };
                let precedes = |set: &KeywordSet| set.find(clause).is_some_and(|at| at < action_at);
                self.definite.is_match(clause)
                    && !precedes(&self.hypothetical)
                    && !precedes(&self.negations)
            })
    }
}

/// Surface features of a reply that both the tracker and the rubric use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseSignals {
    pub has_action: bool,
    pub definite_commitment: bool,
    pub confirmation_request: bool,
    pub question_count: usize,
    pub ends_with_question: bool,
}

#[derive(Debug, Clone)]
pub struct PhaseTracker {
    actions: KeywordSet,
    commitment: CommitmentMatcher,
    confirmation: KeywordSet,
}

impl PhaseTracker {
    pub fn new(lexicon: &PhaseLexicon) -> Result<Self, EvalError> {
        Ok(Self {
            actions: KeywordSet::new(&lexicon.actions, false)?,
            commitment: CommitmentMatcher::new(lexicon)?,
            confirmation: KeywordSet::new(&lexicon.confirmation, true)?,
        })
    }

    pub fn signals(&self, response: &str) -> ResponseSignals {
        let normalized = normalize(response);
        let question_count = count_questions(&normalized);

        ResponseSignals {
            has_action: self.actions.is_match(&normalized),
            definite_commitment: self.commitment.commits_to(&self.actions, &normalized),
            confirmation_request: question_count > 0 || self.confirmation.is_match(&normalized),
            question_count,
            ends_with_question: normalized.ends_with('?'),
        }
    }

    pub fn classify(&self, turn: &ConversationTurn, expected: Phase) -> PhaseClassification {
        let state = PhaseState::from(expected);
        let response = turn.agent_response.trim();

        let reason = match expected {
            Phase::Gathering if response.is_empty() => Some(ViolationReason::EmptyResponse),
            Phase::Gathering => self
                .signals(response)
                .definite_commitment
                .then_some(ViolationReason::PhaseViolation),
            Phase::Resolution => {
                let signals = self.signals(response);
                (!signals.definite_commitment && !signals.confirmation_request)
                    .then_some(ViolationReason::ResolutionMissing)
            }
        };

        PhaseClassification {
            state,
            violated: reason.is_some(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PhaseTracker {
        PhaseTracker::new(&PhaseLexicon::default()).expect("default lexicon compiles")
    }

    fn turn(response: &str, phase: Phase) -> ConversationTurn {
        ConversationTurn {
            index: 0,
            user_message: "my order is late by 50 mins".to_string(),
            agent_response: response.to_string(),
            phase,
        }
    }

    #[test]
    fn definite_refund_in_gathering_is_a_violation() {
        let result = tracker().classify(
            &turn("I've already refunded the order", Phase::Gathering),
            Phase::Gathering,
        );
        assert!(result.violated);
        assert_eq!(result.reason, Some(ViolationReason::PhaseViolation));
        assert_eq!(result.state, PhaseState::Gathering);
    }

    #[test]
    fn credit_added_early_is_a_violation() {
        let response = "I'm sorry for the delay. I've just added a credit to your account for the inconvenience. Is there anything else I can help with?";
        let result = tracker().classify(&turn(response, Phase::Gathering), Phase::Gathering);
        assert_eq!(result.reason, Some(ViolationReason::PhaseViolation));
    }

    #[test]
    fn hypothetical_offer_is_not_a_commitment() {
        let response = "I'm so sorry. Once you confirm, I can add a credit to your account. Could you confirm the delay?";
        let result = tracker().classify(&turn(response, Phase::Gathering), Phase::Gathering);
        assert!(!result.violated);
        assert_eq!(result.reason, None);
    }

    #[test]
    fn empathetic_question_passes_gathering() {
        let response = "I'm so sorry to hear your order is running this late. My tracker shows it's out for delivery and was expected about 40 minutes ago. Does that match what you're seeing?";
        assert!(!tracker().classify(&turn(response, Phase::Gathering), Phase::Gathering).violated);
    }

    #[test]
    fn empty_gathering_reply_has_dedicated_reason() {
        for response in ["", "   \n\t"] {
            let result = tracker().classify(&turn(response, Phase::Gathering), Phase::Gathering);
            assert!(result.violated);
            assert_eq!(result.reason, Some(ViolationReason::EmptyResponse));
        }
    }

    #[test]
    fn resolution_without_action_or_question_is_missing() {
        let result = tracker().classify(
            &turn("Thanks for letting us know.", Phase::Resolution),
            Phase::Resolution,
        );
        assert_eq!(result.reason, Some(ViolationReason::ResolutionMissing));
        assert_eq!(result.state, PhaseState::Resolution);
    }

    #[test]
    fn resolution_with_credit_passes() {
        let response = "Thanks for confirming. I've added delivery credits to your account for the inconvenience. Does this resolve your issue?";
        let result = tracker().classify(&turn(response, Phase::Resolution), Phase::Resolution);
        assert!(!result.violated);
    }

    #[test]
    fn curly_apostrophes_are_normalised() {
        let result = tracker().classify(
            &turn("I\u{2019}ve issued a full refund.", Phase::Gathering),
            Phase::Gathering,
        );
        assert_eq!(result.reason, Some(ViolationReason::PhaseViolation));
    }

    #[test]
    fn signals_count_questions() {
        let signals = tracker().signals("Is it late? Or missing? Let me know.");
        assert_eq!(signals.question_count, 2);
        assert!(!signals.ends_with_question);
        assert!(signals.confirmation_request);
    }

    #[test]
    fn trailing_offer_does_not_hide_an_applied_remedy() {
        for response in [
            "I've already refunded your order in full, so if you want you can reorder now.",
            "I have issued a credit that you can use if you like.",
            "We've processed a full refund, and I can help with anything else.",
        ] {
            let result = tracker().classify(&turn(response, Phase::Gathering), Phase::Gathering);
            assert_eq!(result.reason, Some(ViolationReason::PhaseViolation), "{response}");
        }
    }

    #[test]
    fn offer_before_the_action_stays_hypothetical() {
        for response in [
            "I've noted the delay and I can add a credit once it's confirmed. Is it still missing?",
            "Would you like me to refund it? I have your order details here.",
            "I have not refunded anything yet. Which item was missing?",
        ] {
            let result = tracker().classify(&turn(response, Phase::Gathering), Phase::Gathering);
            assert!(!result.violated, "{response}");
        }
    }

    #[test]
    fn refusal_in_resolution_is_missing() {
        let result = tracker().classify(
            &turn("I cannot refund this order.", Phase::Resolution),
            Phase::Resolution,
        );
        assert!(result.violated);
        assert_eq!(result.reason, Some(ViolationReason::ResolutionMissing));
    }

    #[test]
    fn doubled_question_marks_count_once() {
        let signals = tracker().signals("Really?? Does this resolve it?");
        assert_eq!(signals.question_count, 2);
        assert!(signals.ends_with_question);
        assert_eq!(tracker().signals("Does this resolve it??").question_count, 1);
    }

    #[test]
    fn empty_lexicon_never_matches() {
        let set = KeywordSet::new(&[], true).expect("empty set builds");
        assert!(!set.is_match("anything at all"));
        assert_eq!(set.count("anything"), 0);
    }

    #[test]
    fn machine_walks_both_phases_then_closes() {
        let mut machine = PhaseMachine::new();
        assert_eq!(machine.state(), PhaseState::Gathering);
        assert_eq!(machine.apply(PhaseEvent::IssueConfirmed), Ok(PhaseState::Resolution));
        assert_eq!(machine.apply(PhaseEvent::ConversationEnded), Ok(PhaseState::Closed));
    }

    #[test]
    fn machine_rejects_skipping_gathering() {
        let mut machine = PhaseMachine::new();
        let err = machine.apply(PhaseEvent::FixConfirmed).unwrap_err();
        assert_eq!(err.state, PhaseState::Gathering);
        assert_eq!(machine.state(), PhaseState::Gathering);

        machine.apply(PhaseEvent::IssueConfirmed).expect("gathering -> resolution");
        machine.apply(PhaseEvent::FixConfirmed).expect("resolution -> closed");
        assert!(machine.apply(PhaseEvent::IssueConfirmed).is_err());
    }
}
