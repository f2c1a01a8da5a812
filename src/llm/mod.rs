//! Generative model provider abstraction.
//!
//! The classifier only needs single-shot completions, so providers expose a
//! plain `generate` call. Structured output is requested through the prompt
//! and parsed by the caller.

pub mod mock;
#[cfg(feature = "openai")]
pub mod openai;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ClassifierConfig;

pub use mock::MockProvider;
#[cfg(feature = "openai")]
pub use openai::OpenAIProvider;

/// Configuration for model generation requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object response when it supports that
    pub json_response: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: Some(0.0),
            max_tokens: Some(1024),
            json_response: true,
        }
    }
}

/// Response from a model generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Generated content (with thinking tokens removed if present)
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    /// Reasoning extracted from `<think>` tags, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Types of model providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Mock,
    #[cfg(feature = "openai")]
    OpenAI,
}

impl ProviderKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mock" => Some(ProviderKind::Mock),
            #[cfg(feature = "openai")]
            "openai" => Some(ProviderKind::OpenAI),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Mock => "mock",
            #[cfg(feature = "openai")]
            ProviderKind::OpenAI => "openai",
        }
    }
}

/// Core trait that all model providers must implement
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Generate a response to the given prompt
    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<ModelResponse>;

    fn kind(&self) -> ProviderKind;

    fn model_name(&self) -> &str;
}

/// Build the provider named in the classifier config.
pub fn create_provider(config: &ClassifierConfig) -> Result<Arc<dyn ModelProvider>> {
    let kind = ProviderKind::from_str(&config.provider).ok_or_else(|| {
        anyhow!(
            "Unknown or disabled classifier provider '{}'",
            config.provider
        )
    })?;

    match kind {
        ProviderKind::Mock => Ok(Arc::new(
            MockProvider::new(mock::DEFAULT_CLASSIFICATION).with_model_name(config.model.clone()),
        )),
        #[cfg(feature = "openai")]
        ProviderKind::OpenAI => {
            let api_key = std::env::var(&config.api_key_env)
                .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
            Ok(Arc::new(
                OpenAIProvider::with_api_key(api_key).with_model(config.model.clone()),
            ))
        }
    }
}

/// Parse thinking/reasoning tokens from model response
///
/// Returns `(reasoning, content)`: the text between `<think>` and `</think>`
/// when both tags are present, and whatever follows `</think>` (or the whole
/// response when there are no tags).
pub fn parse_thinking_tokens(response: &str) -> (Option<String>, String) {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    match (response.find(OPEN), response.find(CLOSE)) {
        (Some(start), Some(end)) if start < end => {
            let reasoning = response[start + OPEN.len()..end].trim().to_string();
            let content = response[end + CLOSE.len()..].trim().to_string();
            (Some(reasoning), content)
        }
        _ => (None, response.to_string()),
    }
}

/// Pull the outermost JSON object out of a model reply, tolerating code
/// fences and surrounding prose.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (start < end).then(|| &content[start..=end])
}
