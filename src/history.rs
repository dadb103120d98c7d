use crate::types::{ChatMessage, MessageRole};

#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self { messages: Vec::new() }
    }

    pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::assistant(content));
    }

    pub fn push_system(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::system(content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Leading system messages plus the last `exchanges` user/assistant pairs,
    /// the buffer-window memory the agent under test is given.
    pub fn window(&self, exchanges: usize) -> Vec<ChatMessage> {
        let system_len = self
            .messages
            .iter()
            .take_while(|message| message.role == MessageRole::System)
            .count();
        let (system, rest) = self.messages.split_at(system_len);
        let keep = rest.len().min(exchanges.saturating_mul(2));

        let mut window = Vec::with_capacity(system_len + keep);
        window.extend(system.iter().cloned());
        window.extend(rest[rest.len() - keep..].iter().cloned());
        window
    }
}
