//! LLM integration.
//!
//! Supports:
//! - **Anthropic** via rig-core
//! - **OpenAI** via rig-core
//!
//! `RigAdapter` bridges rig's `CompletionModel` to `LlmProvider`, so the
//! decision service and company researcher never see a concrete backend.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, LlmError};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    /// Build config from environment variables.
    ///
    /// `ANTHROPIC_API_KEY` wins over `OPENAI_API_KEY` when both are set.
    /// `TRIAGE_MODEL` overrides the backend's default model.
    pub fn from_env() -> Result<Self, ConfigError> {
        let (backend, api_key, default_model) = if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
        {
            (LlmBackend::Anthropic, key, "claude-sonnet-4-20250514")
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            (LlmBackend::OpenAi, key, "gpt-4o")
        } else {
            return Err(ConfigError::MissingEnvVar(
                "ANTHROPIC_API_KEY or OPENAI_API_KEY".into(),
            ));
        };

        let model = std::env::var("TRIAGE_MODEL").unwrap_or_else(|_| default_model.to_string());

        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
    }
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}
