//! Provider interface for story generation
//!
//! Abstracts the external language-model backend behind a capability trait
//! with health probing. Concrete wire clients live in [`http`]; tests use
//! the deterministic [`scripted`] provider.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod http;
pub mod scripted;

pub use http::HttpProvider;
pub use scripted::ScriptedProvider;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Options for a chat call.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the model for a JSON object response where the backend supports it.
    pub json: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.3,
            json: false,
        }
    }
}

/// A story-generation request: retrieved context plus the user prompt.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub context: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerateRequest {
    pub fn new(context: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            prompt: prompt.into(),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Token usage reported by the backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A completed provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub tokens: TokenUsage,
}

/// Health probe result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub available: bool,
    pub reason: Option<String>,
}

impl ProviderHealth {
    pub fn available() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Errors produced by a provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Network trouble, 5xx responses: worth retrying.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// 429 responses. Retryable after the hinted delay.
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// The call exceeded its per-attempt timeout.
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    /// Auth failures and other 4xx: retrying will not help.
    #[error("Permanent provider error: {0}")]
    Permanent(String),

    /// The health probe reported the backend down.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::Timeout(_)
        )
    }
}

/// Capability surface of a story-generation backend.
///
/// All calls are cancellable by dropping the returned future; deadlines are
/// enforced by the request queue wrapping each attempt.
#[async_trait]
pub trait StoryProvider: Send + Sync {
    /// Generate narrative content from retrieved context and a prompt.
    async fn generate_story(&self, request: GenerateRequest) -> Result<Completion, ProviderError>;

    /// Condense a text into a short summary.
    async fn summarize(&self, text: &str) -> Result<String, ProviderError>;

    /// Free-form chat, used for todo generation, feedback verdicts, and
    /// story-machine replies.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<Completion, ProviderError>;

    /// Probe backend availability.
    async fn health_check(&self) -> ProviderHealth;

    /// Short backend name for logs.
    fn name(&self) -> &str;
}

/// Process-wide provider slot.
///
/// Constructed once at startup and injected into the engine; `reload` swaps
/// the active provider on explicit configuration reload only. Reads are
/// lock-free.
#[derive(Clone)]
pub struct ProviderHandle {
    slot: Arc<ArcSwap<Arc<dyn StoryProvider>>>,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn StoryProvider>) -> Self {
        tracing::info!(provider = provider.name(), "provider initialized");
        Self {
            slot: Arc::new(ArcSwap::from_pointee(provider)),
        }
    }

    /// The currently active provider.
    pub fn get(&self) -> Arc<dyn StoryProvider> {
        self.slot.load_full().as_ref().clone()
    }

    /// Swap in a new provider. Outstanding calls on the old provider run to
    /// completion; new submissions see the replacement.
    pub fn reload(&self, provider: Arc<dyn StoryProvider>) {
        tracing::info!(provider = provider.name(), "provider reloaded");
        self.slot.store(Arc::new(provider));
    }
}
