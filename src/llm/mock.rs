//! Mock Model Provider
//!
//! Returns canned responses in order and records every prompt it was given.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::{GenerationConfig, ModelProvider, ModelResponse, ProviderKind, TokenUsage};

/// Reply used by the `mock` provider setting. Valid for both the category and
/// the resolution call against the default taxonomy.
pub const DEFAULT_CLASSIFICATION: &str = r#"{"category": "Other", "sub_category": "General", "resolution": "Resolved", "reasoning": "mock classifier"}"#;

/// Mock provider that returns predefined responses
#[derive(Debug, Clone)]
pub struct MockProvider {
    /// Canned responses to cycle through
    responses: Vec<String>,
    current_index: Arc<Mutex<usize>>,
    prompts: Arc<Mutex<Vec<String>>>,
    model_name: String,
}

impl MockProvider {
    pub fn new(response: impl Into<String>) -> Self {
        Self::with_responses(vec![response.into()])
    }

    /// Responses are handed out in order and cycle once exhausted.
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses,
            current_index: Arc::new(Mutex::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
            model_name: "mock-model".to_string(),
        }
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Every prompt received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or_default()
    }

    fn next_response(&self) -> Result<String> {
        if self.responses.is_empty() {
            return Err(anyhow!("mock provider has no responses configured"));
        }
        let mut index = self
            .current_index
            .lock()
            .map_err(|_| anyhow!("mock provider lock poisoned"))?;
        let response = self.responses[*index % self.responses.len()].clone();
        *index += 1;
        Ok(response)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new(DEFAULT_CLASSIFICATION)
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn generate(&self, prompt: &str, _config: &GenerationConfig) -> Result<ModelResponse> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let content = self.next_response()?;
        let prompt_tokens = prompt.split_whitespace().count() as u32;
        let completion_tokens = content.split_whitespace().count() as u32;

        Ok(ModelResponse {
            content,
            model: self.model_name.clone(),
            usage: Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
            finish_reason: Some("stop".to_string()),
            reasoning: None,
        })
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
