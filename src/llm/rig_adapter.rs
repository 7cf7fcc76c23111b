//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel};
use rig::message::Message;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (history, prompt) = split_conversation(&request.messages).ok_or_else(|| {
            LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: "request has no user message".to_string(),
            }
        })?;

        let mut builder = self
            .model
            .completion_request(Message::user(prompt.content.clone()))
            .messages(history.iter().map(to_rig_message).collect());
        if let Some(preamble) = request.system_prompt() {
            builder = builder.preamble(preamble);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "no text content in response".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Split non-system messages into history and the final user prompt.
fn split_conversation(messages: &[ChatMessage]) -> Option<(Vec<&ChatMessage>, &ChatMessage)> {
    let mut turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();
    match turns.last() {
        Some(last) if last.role == Role::User => {
            let prompt = turns.pop()?;
            Some((turns, prompt))
        }
        _ => None,
    }
}

fn to_rig_message(message: &&ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content.clone()),
        _ => Message::user(message.content.clone()),
    }
}
