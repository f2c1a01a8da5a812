//! OpenAI Model Provider
//!
//! Integration with OpenAI's API using the async-openai crate.

use anyhow::{anyhow, Result};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;

use super::{
    parse_thinking_tokens, GenerationConfig, ModelProvider, ModelResponse, ProviderKind, TokenUsage,
};

const SYSTEM_MESSAGE: &str =
    "You label customer support conversations. Answer with a single JSON object and nothing else.";

/// OpenAI provider that wraps the async-openai crate
#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    client: Client<OpenAIConfig>,
    model: String,
    system_message: Option<String>,
}

impl OpenAIProvider {
    /// Uses the OPENAI_API_KEY environment variable for authentication.
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            model: "gpt-4o".to_string(),
            system_message: Some(SYSTEM_MESSAGE.to_string()),
        }
    }

    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self {
            client: Client::with_config(config),
            ..Self::new()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = Some(message.into());
        self
    }

    fn build_messages(&self, prompt: &str) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages = Vec::new();

        if let Some(system_msg) = &self.system_message {
            let system_message = ChatCompletionRequestSystemMessageArgs::default()
                .content(system_msg.clone())
                .build()
                .map_err(|e| anyhow!("Failed to build system message: {}", e))?;
            messages.push(ChatCompletionRequestMessage::System(system_message));
        }

        let user_message = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(|e| anyhow!("Failed to build user message: {}", e))?;
        messages.push(ChatCompletionRequestMessage::User(user_message));

        Ok(messages)
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<ModelResponse> {
        let messages = self.build_messages(prompt)?;

        let mut request_builder = CreateChatCompletionRequestArgs::default();
        request_builder.model(&self.model).messages(messages);

        if let Some(temp) = config.temperature {
            request_builder.temperature(temp);
        }
        if let Some(max_tokens) = config.max_tokens {
            request_builder.max_tokens(max_tokens);
        }
        if config.json_response {
            request_builder.response_format(ResponseFormat::JsonObject);
        }

        let request = request_builder
            .build()
            .map_err(|e| anyhow!("Failed to build request: {}", e))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| anyhow!("OpenAI API error: {}", e))?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| anyhow!("No response choices returned"))?;

        let raw = choice
            .message
            .content
            .clone()
            .ok_or_else(|| anyhow!("No content in response"))?;
        let (reasoning, content) = parse_thinking_tokens(&raw);

        let usage = response.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ModelResponse {
            content,
            model: response.model,
            usage,
            finish_reason: choice.finish_reason.as_ref().map(|r| format!("{:?}", r)),
            reasoning,
        })
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_provider_with_model() {
        let provider = OpenAIProvider::with_api_key("sk-test").with_model("gpt-4o-mini");
        assert_eq!(provider.model_name(), "gpt-4o-mini");
        assert_eq!(provider.kind(), ProviderKind::OpenAI);
    }

    #[test]
    fn test_build_messages_includes_system() {
        let provider = OpenAIProvider::with_api_key("sk-test");
        let messages = provider.build_messages("transcript").unwrap();
        assert_eq!(messages.len(), 2);

        let custom = provider.with_system_message("Be terse.");
        assert_eq!(custom.system_message.as_deref(), Some("Be terse."));
    }
}
