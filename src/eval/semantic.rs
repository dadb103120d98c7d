//! Reference-based rubric scoring.
//!
//! Four sub-scores in `[0, 1]` combined with fixed weights:
//!
//! * **accuracy**: best cosine similarity between the reply and any ideal reference.
//! * **empathy**: empathy-marker lexicon blended with similarity to apology archetypes.
//! * **resolution**: whether the reply commits, in definite tense, to the scenario's remedy.
//!   Always zero in GATHERING.
//! * **clarity_tone**: length bounds, hedging, and the confirmation question.
//!
//! Scoring is a pure function of its inputs as long as the [`Embedder`] is
//! deterministic.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    embedding::{cosine_similarity, Embedder},
    error::{EmbeddingError, EvalError},
    eval::{
        phase::{
            count_questions, normalize, split_sentences, CommitmentMatcher, KeywordSet, Phase,
            PhaseLexicon,
        },
        scenario::ResolutionType,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RubricWeights {
    pub accuracy: f64,
    pub empathy: f64,
    pub resolution: f64,
    pub clarity_tone: f64,
}

impl Default for RubricWeights {
    fn default() -> Self {
        Self {
            accuracy: 0.30,
            empathy: 0.30,
            resolution: 0.25,
            clarity_tone: 0.15,
        }
    }
}

impl RubricWeights {
    pub fn sum(&self) -> f64 {
        self.accuracy + self.empathy + self.resolution + self.clarity_tone
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        let weights = [self.accuracy, self.empathy, self.resolution, self.clarity_tone];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EvalError::InvalidConfig(
                "rubric weights must be finite and non-negative".to_string(),
            ));
        }
        if (self.sum() - 1.0).abs() > 1e-9 {
            return Err(EvalError::InvalidConfig(format!(
                "rubric weights must sum to 1.0, got {}",
                self.sum()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RubricScore {
    pub accuracy: f64,
    pub empathy: f64,
    pub resolution: f64,
    pub clarity_tone: f64,
    pub aggregate: f64,
}

impl RubricScore {
    pub fn new(
        accuracy: f64,
        empathy: f64,
        resolution: f64,
        clarity_tone: f64,
        weights: &RubricWeights,
    ) -> Self {
        let mut score = Self {
            accuracy: clamp_unit(accuracy),
            empathy: clamp_unit(empathy),
            resolution: clamp_unit(resolution),
            clarity_tone: clamp_unit(clarity_tone),
            aggregate: 0.0,
        };
        score.aggregate = score.weighted_sum(weights);
        score
    }

    pub fn zero() -> Self {
        Self {
            accuracy: 0.0,
            empathy: 0.0,
            resolution: 0.0,
            clarity_tone: 0.0,
            aggregate: 0.0,
        }
    }

    /// Σ wᵢ·sᵢ, always summed in the same order.
    pub fn weighted_sum(&self, weights: &RubricWeights) -> f64 {
        weights.accuracy * self.accuracy
            + weights.empathy * self.empathy
            + weights.resolution * self.resolution
            + weights.clarity_tone * self.clarity_tone
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    /// Word-start stems counted as empathy markers.
    pub empathy_lexicon: Vec<String>,
    pub empathy_archetypes: Vec<String>,
    pub hedges: Vec<String>,
    pub empathy_lexicon_weight: f64,
    pub empathy_marker_target: usize,
    pub partial_resolution_cap: f64,
    pub min_words: usize,
    pub max_words: usize,
    pub hedge_penalty: f64,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        fn owned(items: &[&str]) -> Vec<String> {
            items.iter().map(|item| item.to_string()).collect()
        }

        Self {
            empathy_lexicon: owned(&[
                "sorry", "apolog", "understand", "frustrat", "patience", "disappoint",
                "inconvenien", "that must be", "i hear you",
            ]),
            empathy_archetypes: owned(&[
                "I'm so sorry to hear that.",
                "I understand how frustrating this must be.",
                "I apologize for the inconvenience.",
                "Thank you for your patience.",
                "That sounds really disappointing.",
                "I know this is frustrating, and I'm here to help.",
            ]),
            hedges: owned(&[
                "maybe", "perhaps", "possibly", "i think", "i guess", "not sure", "probably",
                "it seems", "hopefully", "might",
            ]),
            empathy_lexicon_weight: 0.5,
            empathy_marker_target: 2,
            partial_resolution_cap: 0.75,
            min_words: 8,
            max_words: 120,
            hedge_penalty: 0.25,
        }
    }
}

impl SemanticConfig {
    pub fn validate(&self) -> Result<(), EvalError> {
        let invalid = |message: &str| Err(EvalError::InvalidConfig(message.to_string()));
        if !(0.0..=1.0).contains(&self.empathy_lexicon_weight) {
            return invalid("semantic.empathy_lexicon_weight must be within [0, 1]");
        }
        if self.empathy_marker_target == 0 {
            return invalid("semantic.empathy_marker_target must be positive");
        }
        if !(0.0..=1.0).contains(&self.partial_resolution_cap) {
            return invalid("semantic.partial_resolution_cap must be within [0, 1]");
        }
        if self.min_words == 0 || self.min_words > self.max_words {
            return invalid("semantic.min_words must be positive and not exceed max_words");
        }
        if !(0.0..=1.0).contains(&self.hedge_penalty) {
            return invalid("semantic.hedge_penalty must be within [0, 1]");
        }
        if self.empathy_lexicon.is_empty() || self.empathy_archetypes.is_empty() {
            return invalid("semantic empathy lexicon and archetypes must not be empty");
        }
        Ok(())
    }
}

/// What the scorer needs to know about the turn besides its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringContext {
    pub phase: Phase,
    pub resolution: ResolutionType,
}

pub struct SemanticScorer {
    embedder: Arc<dyn Embedder>,
    config: SemanticConfig,
    empathy_markers: KeywordSet,
    hedges: KeywordSet,
    actions: KeywordSet,
    commitment: CommitmentMatcher,
    remedies: HashMap<ResolutionType, KeywordSet>,
    archetypes: Mutex<Option<Arc<Vec<Vec<f32>>>>>,
}

impl SemanticScorer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        config: SemanticConfig,
        lexicon: &PhaseLexicon,
    ) -> Result<Self, EvalError> {
        let mut remedies = HashMap::new();
        for resolution in ResolutionType::ALL {
            let keywords: Vec<String> = resolution.keywords().iter().map(|k| k.to_string()).collect();
            remedies.insert(resolution, KeywordSet::new(&keywords, false)?);
        }

        Ok(Self {
            embedder,
            empathy_markers: KeywordSet::new(&config.empathy_lexicon, false)?,
            hedges: KeywordSet::new(&config.hedges, true)?,
            actions: KeywordSet::new(&lexicon.actions, false)?,
            commitment: CommitmentMatcher::new(lexicon)?,
            remedies,
            config,
            archetypes: Mutex::new(None),
        })
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub async fn score(
        &self,
        candidate: &str,
        references: &[String],
        weights: &RubricWeights,
        ctx: ScoringContext,
    ) -> Result<RubricScore, EmbeddingError> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return Ok(RubricScore::zero());
        }

        let accuracy = self.accuracy(candidate, references).await?;
        let empathy = self.empathy(candidate).await?;
        let normalized = normalize(candidate);
        let resolution = self.resolution(&normalized, accuracy, ctx);
        let clarity_tone = self.clarity_tone(&normalized, ctx.phase);

        let score = RubricScore::new(accuracy, empathy, resolution, clarity_tone, weights);
        debug!(
            phase = ctx.phase.as_str(),
            accuracy = score.accuracy,
            empathy = score.empathy,
            resolution = score.resolution,
            clarity_tone = score.clarity_tone,
            aggregate = score.aggregate,
            "semantic score"
        );
        Ok(score)
    }

    async fn accuracy(&self, candidate: &str, references: &[String]) -> Result<f64, EmbeddingError> {
        if references.is_empty() {
            return Ok(0.0);
        }

        let candidate_vec = self.embedder.embed(candidate).await?;
        let mut best = 0.0f64;
        for reference in references {
            let reference_vec = self.embedder.embed(reference).await?;
            best = best.max(cosine_similarity(&candidate_vec, &reference_vec));
        }
        Ok(clamp_unit(best))
    }

    async fn empathy(&self, candidate: &str) -> Result<f64, EmbeddingError> {
        let target = self.config.empathy_marker_target.max(1);
        let markers = self.empathy_markers.count(&normalize(candidate)).min(target);
        let lexicon = markers as f64 / target as f64;

        let archetypes = self.archetype_vectors().await?;
        let mut archetype = 0.0f64;
        for sentence in split_sentences(candidate) {
            let sentence_vec = self.embedder.embed(sentence).await?;
            for fragment in archetypes.iter() {
                archetype = archetype.max(cosine_similarity(&sentence_vec, fragment));
            }
        }

        let weight = self.config.empathy_lexicon_weight;
        Ok(weight * lexicon + (1.0 - weight) * clamp_unit(archetype))
    }

    fn resolution(&self, normalized: &str, accuracy: f64, ctx: ScoringContext) -> f64 {
        if ctx.phase == Phase::Gathering {
            return 0.0;
        }

        let delivers_remedy = self
            .remedies
            .get(&ctx.resolution)
            .is_some_and(|keywords| self.commitment.commits_to(keywords, normalized));
        if delivers_remedy {
            return 1.0;
        }

        let action = if self.actions.is_match(normalized) { 1.0 } else { 0.0 };
        (0.5 * action + 0.5 * accuracy).min(self.config.partial_resolution_cap)
    }

    fn clarity_tone(&self, normalized: &str, phase: Phase) -> f64 {
        let words = normalized.split_whitespace().count();
        let (min_words, max_words) = (self.config.min_words.max(1), self.config.max_words.max(1));
        let length = if words < min_words {
            words as f64 / min_words as f64
        } else if words > max_words {
            max_words as f64 / words as f64
        } else {
            1.0
        };

        let hedges = self.hedges.count(normalized) as f64;
        let hedging = (1.0 - self.config.hedge_penalty * hedges).max(0.0);

        let questions = count_questions(normalized);
        let question = match phase {
            Phase::Resolution => match questions {
                1 if normalized.ends_with('?') => 1.0,
                1 => 0.5,
                _ => 0.0,
            },
            Phase::Gathering => {
                if questions == 1 {
                    1.0
                } else {
                    0.5
                }
            }
        };

        (length + hedging + question) / 3.0
    }

    async fn archetype_vectors(&self) -> Result<Arc<Vec<Vec<f32>>>, EmbeddingError> {
        if let Some(cached) = self.archetypes.lock().ok().and_then(|guard| guard.clone()) {
            return Ok(cached);
        }

        let mut vectors = Vec::with_capacity(self.config.empathy_archetypes.len());
        for fragment in &self.config.empathy_archetypes {
            vectors.push(self.embedder.embed(fragment).await?);
        }
        let vectors = Arc::new(vectors);
        if let Ok(mut guard) = self.archetypes.lock() {
            *guard = Some(vectors.clone());
        }
        Ok(vectors)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::embedding::HashingEmbedder;

    struct CountingEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }

        fn dimension(&self) -> Option<usize> {
            self.inner.dimension()
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Unavailable("offline".to_string()))
        }

        fn dimension(&self) -> Option<usize> {
            None
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn scorer() -> SemanticScorer {
        SemanticScorer::new(
            Arc::new(HashingEmbedder::default()),
            SemanticConfig::default(),
            &PhaseLexicon::default(),
        )
        .expect("default config compiles")
    }

    fn ctx(phase: Phase) -> ScoringContext {
        ScoringContext {
            phase,
            resolution: ResolutionType::Credit,
        }
    }

    fn refs(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    const SAMPLES: [&str; 6] = [
        "I've already refunded the order",
        "I'm so sorry to hear that. Could you confirm your order ID?",
        "Thanks for confirming. I've added delivery credits to your account. Does this resolve your issue?",
        "maybe perhaps possibly",
        "???",
        "ok",
    ];

    #[test]
    fn default_weights_sum_to_one() {
        let weights = RubricWeights::default();
        assert!((weights.sum() - 1.0).abs() < 1e-12);
        assert!(weights.validate().is_ok());
    }

    #[test]
    fn rejects_weights_that_do_not_sum_to_one() {
        let weights = RubricWeights {
            accuracy: 0.5,
            ..RubricWeights::default()
        };
        assert!(matches!(weights.validate(), Err(EvalError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn aggregate_matches_weighted_sum() {
        let scorer = scorer();
        let weights = RubricWeights::default();
        let references = refs(&["I'm so sorry your order is late. Does that match what you see?"]);
        for phase in Phase::ALL {
            for sample in SAMPLES {
                let score = scorer.score(sample, &references, &weights, ctx(phase)).await.unwrap();
                let expected = weights.accuracy * score.accuracy
                    + weights.empathy * score.empathy
                    + weights.resolution * score.resolution
                    + weights.clarity_tone * score.clarity_tone;
                assert!((expected - score.aggregate).abs() < 1e-9, "{sample}");
                for sub in [score.accuracy, score.empathy, score.resolution, score.clarity_tone] {
                    assert!((0.0..=1.0).contains(&sub));
                }
            }
        }
    }

    #[tokio::test]
    async fn scoring_is_deterministic() {
        let scorer = scorer();
        let weights = RubricWeights::default();
        let references = refs(&["I've added delivery credits to your account."]);
        for sample in SAMPLES {
            let first = scorer.score(sample, &references, &weights, ctx(Phase::Resolution)).await.unwrap();
            let second = scorer.score(sample, &references, &weights, ctx(Phase::Resolution)).await.unwrap();
            assert_eq!(first.aggregate.to_bits(), second.aggregate.to_bits());
            assert_eq!(first, second);
        }
    }

    #[tokio::test]
    async fn resolution_is_zero_in_gathering() {
        let scorer = scorer();
        let weights = RubricWeights::default();
        let references = refs(&["I've added delivery credits to your account."]);
        for sample in SAMPLES.iter().chain(["I have credited, refunded and replaced everything."].iter()) {
            let score = scorer.score(sample, &references, &weights, ctx(Phase::Gathering)).await.unwrap();
            assert_eq!(score.resolution, 0.0, "{sample}");
        }
    }

    #[tokio::test]
    async fn empty_candidate_scores_zero_without_embedding() {
        let embedder = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::default(),
            calls: AtomicUsize::new(0),
        });
        let scorer = SemanticScorer::new(embedder.clone(), SemanticConfig::default(), &PhaseLexicon::default())
            .expect("compiles");

        let score = scorer
            .score("   ", &refs(&["anything"]), &RubricWeights::default(), ctx(Phase::Gathering))
            .await
            .unwrap();
        assert_eq!(score, RubricScore::zero());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remedy_keyword_earns_full_resolution() {
        let scorer = scorer();
        let score = scorer
            .score(
                "Thanks for confirming. I've added delivery credits to your account. Does this resolve your issue?",
                &refs(&["I've added delivery credits to your account."]),
                &RubricWeights::default(),
                ctx(Phase::Resolution),
            )
            .await
            .unwrap();
        assert_eq!(score.resolution, 1.0);
    }

    #[tokio::test]
    async fn other_remedy_is_only_partial() {
        let scorer = scorer();
        let score = scorer
            .score(
                "I've escalated this to our team. Does this resolve your issue?",
                &refs(&["I've added delivery credits to your account."]),
                &RubricWeights::default(),
                ctx(Phase::Resolution),
            )
            .await
            .unwrap();
        assert!(score.resolution >= 0.5);
        assert!(score.resolution <= 0.75);
    }

    #[tokio::test]
    async fn refusal_and_open_offer_are_only_partial() {
        let scorer = scorer();
        let references = refs(&["I've added delivery credits to your account."]);
        for reply in [
            "Unfortunately we cannot offer any credit for this delay. Does that help?",
            "Would you like me to add a credit to your account?",
            "I have not added a credit to your account yet. Does that work?",
        ] {
            let score = scorer
                .score(reply, &references, &RubricWeights::default(), ctx(Phase::Resolution))
                .await
                .unwrap();
            assert!(score.resolution < 1.0, "{reply}");
            assert!(score.resolution <= 0.75, "{reply}");
        }
    }

    #[test]
    fn doubled_question_mark_keeps_trailing_question_credit() {
        let scorer = scorer();
        let doubled = normalize("I have added a credit to your account for this. Does this resolve your issue??");
        let two = normalize("Really?? I have added a credit to your account. Does this resolve it?");
        assert!((scorer.clarity_tone(&doubled, Phase::Resolution) - 1.0).abs() < 1e-12);
        let none = normalize("I have added a credit to your account for this delay today.");
        assert!(
            (scorer.clarity_tone(&two, Phase::Resolution) - scorer.clarity_tone(&none, Phase::Resolution)).abs()
                < 1e-12
        );
    }

    #[tokio::test]
    async fn empathetic_reply_beats_flat_reply() {
        let scorer = scorer();
        let weights = RubricWeights::default();
        let warm = scorer
            .score("I'm so sorry, I understand how frustrating this is.", &[], &weights, ctx(Phase::Gathering))
            .await
            .unwrap();
        let flat = scorer
            .score("Order status is out for delivery.", &[], &weights, ctx(Phase::Gathering))
            .await
            .unwrap();
        assert!(warm.empathy > flat.empathy);
        assert_eq!(warm.accuracy, 0.0);
    }

    #[test]
    fn clarity_rewards_single_trailing_question_in_resolution() {
        let scorer = scorer();
        let trailing = normalize("I have added a credit to your account for this. Does this resolve your issue?");
        let leading = normalize("Does this resolve it? I have added a credit to your account for this.");
        let none = normalize("I have added a credit to your account for this delay today.");
        let several = normalize("Is it okay? I have added a credit to your account. Does this resolve it?");

        let t = scorer.clarity_tone(&trailing, Phase::Resolution);
        let l = scorer.clarity_tone(&leading, Phase::Resolution);
        let n = scorer.clarity_tone(&none, Phase::Resolution);
        let s = scorer.clarity_tone(&several, Phase::Resolution);
        assert!((t - 1.0).abs() < 1e-12);
        assert!(t > l && l > n);
        assert!((n - s).abs() < 1e-12);
    }

    #[test]
    fn hedging_lowers_clarity() {
        let scorer = scorer();
        let plain = normalize("Your order is out for delivery and should arrive soon. Is that okay?");
        let hedged = normalize("Maybe your order is out for delivery and might arrive soon. Is that okay?");
        assert!(scorer.clarity_tone(&plain, Phase::Gathering) > scorer.clarity_tone(&hedged, Phase::Gathering));
    }

    #[tokio::test]
    async fn embedding_failure_propagates() {
        let scorer = SemanticScorer::new(
            Arc::new(FailingEmbedder),
            SemanticConfig::default(),
            &PhaseLexicon::default(),
        )
        .expect("compiles");
        let result = scorer
            .score("hello there", &refs(&["hi"]), &RubricWeights::default(), ctx(Phase::Gathering))
            .await;
        assert!(matches!(result, Err(EmbeddingError::Unavailable(_))));
    }
}
