use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::EvalError,
    eval::{
        call::TimeoutConfig, judge::JudgeThresholds, phase::PhaseLexicon,
        semantic::{RubricWeights, SemanticConfig},
    },
};

/// Every empirical constant of an evaluation run. All fields default, so a
/// YAML file only needs the values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub weights: RubricWeights,
    pub judge: JudgeThresholds,
    pub lexicon: PhaseLexicon,
    pub semantic: SemanticConfig,
    pub timeouts: TimeoutConfig,
    /// Ask the agent to rewrite a GATHERING reply that already commits to a remedy.
    pub gathering_guard: bool,
    /// Number of past user/agent exchanges the agent gets to see.
    pub memory_window: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            weights: RubricWeights::default(),
            judge: JudgeThresholds::default(),
            lexicon: PhaseLexicon::default(),
            semantic: SemanticConfig::default(),
            timeouts: TimeoutConfig::default(),
            gathering_guard: false,
            memory_window: 5,
        }
    }
}

impl EvalConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, EvalError> {
        let config: EvalConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        self.weights.validate()?;
        self.judge.validate()?;
        self.semantic.validate()?;
        self.timeouts.validate()?;

        let lexicon = &self.lexicon;
        for (name, list) in [
            ("actions", &lexicon.actions),
            ("definite", &lexicon.definite),
            ("hypothetical", &lexicon.hypothetical),
            ("confirmation", &lexicon.confirmation),
        ] {
            if list.iter().all(|phrase| phrase.trim().is_empty()) {
                return Err(EvalError::InvalidConfig(format!(
                    "lexicon.{name} must contain at least one phrase"
                )));
            }
        }
        if self.memory_window == 0 {
            return Err(EvalError::InvalidConfig(
                "memory_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
