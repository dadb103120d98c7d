use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// Replays canned assistant replies in order. Once the script runs dry every
/// further call fails, which the evaluation treats like an unavailable agent.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    pub fn push(&self, response: impl Into<String>) {
        if let Ok(mut guard) = self.responses.lock() {
            guard.push_back(response.into());
        }
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    fn next_response(&self) -> Option<String> {
        self.responses.lock().ok()?.pop_front()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        match self.next_response() {
            Some(response) => Ok(CompletionResponse {
                message: ChatMessage::assistant(response),
                usage: None,
            }),
            None => Err(LLMError::Provider("no more scripted responses".to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
