pub mod agent;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod history;
pub mod providers;
pub mod types;

pub use agent::{AgentUnderTest, ReplayAgent, SupportAgent};
pub use embedding::{cosine_similarity, Embedder, HashingEmbedder, ProviderEmbedder};
pub use error::{EmbeddingError, EvalError, LLMError};
pub use eval::{
    config::EvalConfig,
    judge::{FailureMode, JudgeScorer, JudgeVerdict, PairwiseVerdict},
    phase::{Phase, PhaseClassification, PhaseMachine, PhaseState, PhaseTracker, ViolationReason},
    report::{write_artifacts, CorpusReport, ScenarioReport, TurnFailure, TurnOutcome, TurnRecord},
    runner::{EvalRunner, ScenarioRunner},
    scenario::{ConversationTurn, Scenario, ScenarioCatalog, ScenarioId},
    semantic::{RubricScore, RubricWeights, SemanticScorer},
};
pub use history::ChatHistory;
pub use providers::LLMProvider;
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, MessageRole, ProviderCapabilities,
    TokenUsage,
};
