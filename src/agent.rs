use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use handlebars::Handlebars;
use serde_json::json;

use crate::{
    eval::scenario::Scenario,
    types::{ChatMessage, CompletionRequest, MessageRole},
    LLMError, LLMProvider,
};

/// Instructions given to [`SupportAgent`] unless the caller supplies its own.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a customer support agent for a food delivery app. \
Every conversation has two phases.\n\
Phase 1 (information gathering): acknowledge the customer's problem with empathy and ask exactly \
one clarifying question. Do not offer, promise or apply any refund, credit, replacement or other \
remedy yet.\n\
Phase 2 (resolution): once the customer has confirmed the details, apply the remedy the policy \
allows, state clearly what you did, and end with a single question asking whether this resolves \
the issue.\n\
Keep replies short, friendly and factual. Never invent order details.";

const BRIEFING_TEMPLATE: &str = "Order on file for this conversation:\n\
- Order ID: {{order_id}}\n\
- Status: {{status}}\n\
- Items: {{#each items}}{{#if @index}}, {{/if}}{{this}}{{/each}}\n\
- ETA: {{eta}}\n\
Policy for this issue: {{policy}}";

/// The system under evaluation: a black box that turns a user prompt plus
/// prior conversation into a reply. An empty reply is valid and gets scored.
#[async_trait]
pub trait AgentUnderTest: Send + Sync {
    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, LLMError>;

    fn name(&self) -> &str {
        "agent"
    }
}

/// Render the system message that carries a scenario's order data.
pub fn scenario_briefing(scenario: &Scenario) -> Result<String, handlebars::RenderError> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    let order = &scenario.order;
    hb.render_template(
        BRIEFING_TEMPLATE,
        &json!({
            "order_id": order.order_id,
            "status": order.status,
            "items": order.items,
            "eta": order.eta,
            "policy": scenario.policy,
        }),
    )
}

/// Support bot backed by any [`LLMProvider`].
#[derive(Clone)]
pub struct SupportAgent {
    name: String,
    instructions: String,
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl fmt::Debug for SupportAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupportAgent")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl SupportAgent {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            name: "support".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            provider,
            model: model.into(),
            temperature: Some(0.0),
            max_tokens: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    fn build_messages(&self, prompt: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.instructions.clone()));
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(prompt));
        messages
    }
}

#[async_trait]
impl AgentUnderTest for SupportAgent {
    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, LLMError> {
        let mut request = CompletionRequest::new(self.model.clone(), self.build_messages(prompt, history));
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let response = self.provider.complete(request).await?;
        Ok(response.message.content.unwrap_or_default())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Canned replies recorded per scenario, keyed by the scenario's opening
/// prompt. The first user message in the history tells which scenario a
/// follow-up belongs to.
#[derive(Debug, Clone, Default)]
pub struct ReplayAgent {
    replies: HashMap<String, (Option<String>, Option<String>)>,
}

impl ReplayAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_scenarios<'a>(scenarios: impl IntoIterator<Item = &'a Scenario>) -> Self {
        let mut agent = Self::new();
        for scenario in scenarios {
            if let Some(replay) = &scenario.replay {
                agent.insert(
                    scenario.gathering_prompt(),
                    replay.gathering.clone(),
                    replay.resolution.clone(),
                );
            }
        }
        agent
    }

    pub fn insert(
        &mut self,
        opening_prompt: impl Into<String>,
        gathering: Option<String>,
        resolution: Option<String>,
    ) {
        self.replies.insert(opening_prompt.into(), (gathering, resolution));
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}

#[async_trait]
impl AgentUnderTest for ReplayAgent {
    async fn generate(&self, prompt: &str, history: &[ChatMessage]) -> Result<String, LLMError> {
        let opening = history
            .iter()
            .find(|message| message.role == MessageRole::User)
            .and_then(ChatMessage::text);

        let reply = match opening {
            None => self.replies.get(prompt).and_then(|(gathering, _)| gathering.clone()),
            Some(opening) => self
                .replies
                .get(opening)
                .and_then(|(_, resolution)| resolution.clone()),
        };

        reply.ok_or_else(|| LLMError::Provider(format!("no recorded reply for prompt: {prompt}")))
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::types::{CompletionResponse, ProviderCapabilities};

    #[derive(Default)]
    struct RecordingProvider {
        requests: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl LLMProvider for RecordingProvider {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
            self.requests.lock().unwrap().push(request);
            Ok(CompletionResponse {
                message: ChatMessage::assistant("I'm sorry to hear that. Could you confirm the order ID?"),
                usage: None,
            })
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::new(false, false)
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[tokio::test]
    async fn support_agent_sends_instructions_history_and_prompt() {
        let provider = Arc::new(RecordingProvider::default());
        let agent = SupportAgent::new(provider.clone(), "test-model").with_max_tokens(256);
        let history = vec![ChatMessage::system("briefing")];

        let reply = agent.generate("my order is late", &history).await.expect("reply");
        assert!(reply.contains("confirm"));

        let requests = provider.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.model, "test-model");
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.max_tokens, Some(256));
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[0].text(), Some(DEFAULT_INSTRUCTIONS));
        assert_eq!(request.messages[1].text(), Some("briefing"));
        assert_eq!(request.messages[2].text(), Some("my order is late"));
    }

    #[tokio::test]
    async fn replay_agent_picks_reply_by_opening_prompt() {
        let mut agent = ReplayAgent::new();
        agent.insert("late order", Some("sorry, is it late?".into()), Some("credit added".into()));

        let first = agent.generate("late order", &[]).await.expect("gathering reply");
        assert_eq!(first, "sorry, is it late?");

        let history = vec![
            ChatMessage::system("briefing"),
            ChatMessage::user("late order"),
            ChatMessage::assistant("sorry, is it late?"),
        ];
        let second = agent.generate("yes", &history).await.expect("resolution reply");
        assert_eq!(second, "credit added");

        assert!(agent.generate("unknown", &[]).await.is_err());
    }
}
