//! Deterministic scripted provider for tests
//!
//! Serves queued responses in FIFO order, falls back to a labeled default,
//! records every call, and lets tests flip health and inject failures.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::{
    ChatMessage, ChatOptions, Completion, GenerateRequest, ProviderError, ProviderHealth,
    StoryProvider, TokenUsage,
};

/// What kind of provider call was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Generate { prompt: String },
    Summarize { text: String },
    Chat { last_user: String },
}

enum Scripted {
    Content(String),
    Failure(ProviderError),
}

/// A provider whose behavior is fully determined by the test.
pub struct ScriptedProvider {
    name: String,
    queue: Mutex<VecDeque<Scripted>>,
    health: Mutex<ProviderHealth>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::named("scripted")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            health: Mutex::new(ProviderHealth::available()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a canned response for the next call.
    pub fn push_response(&self, content: impl Into<String>) {
        self.queue.lock().push_back(Scripted::Content(content.into()));
    }

    /// Queue a failure for the next call.
    pub fn push_failure(&self, error: ProviderError) {
        self.queue.lock().push_back(Scripted::Failure(error));
    }

    /// Flip the health probe result.
    pub fn set_health(&self, health: ProviderHealth) {
        *self.health.lock() = health;
    }

    /// Calls observed so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next(&self, default_label: &str) -> Result<String, ProviderError> {
        match self.queue.lock().pop_front() {
            Some(Scripted::Content(content)) => Ok(content),
            Some(Scripted::Failure(error)) => Err(error),
            None => Ok(format!("[{default_label}] generated content")),
        }
    }

    fn completion(&self, content: String) -> Completion {
        Completion {
            content,
            model: self.name.clone(),
            tokens: TokenUsage::default(),
        }
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoryProvider for ScriptedProvider {
    async fn generate_story(&self, request: GenerateRequest) -> Result<Completion, ProviderError> {
        self.calls.lock().push(RecordedCall::Generate {
            prompt: request.prompt.clone(),
        });
        self.next("story").map(|c| self.completion(c))
    }

    async fn summarize(&self, text: &str) -> Result<String, ProviderError> {
        self.calls.lock().push(RecordedCall::Summarize {
            text: text.to_string(),
        });
        self.next("summary")
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<Completion, ProviderError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == super::ChatRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.calls.lock().push(RecordedCall::Chat { last_user });
        self.next("chat").map(|c| self.completion(c))
    }

    async fn health_check(&self) -> ProviderHealth {
        self.health.lock().clone()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_responses_served_in_order() {
        let provider = ScriptedProvider::new();
        provider.push_response("first");
        provider.push_response("second");

        let a = provider
            .generate_story(GenerateRequest::new("", "go"))
            .await
            .unwrap();
        let b = provider.summarize("text").await.unwrap();
        assert_eq!(a.content, "first");
        assert_eq!(b, "second");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_default_response_when_queue_empty() {
        let provider = ScriptedProvider::new();
        let c = provider
            .chat(&[ChatMessage::user("hello")], &ChatOptions::default())
            .await
            .unwrap();
        assert!(c.content.contains("chat"));
    }

    #[tokio::test]
    async fn test_injected_failure_surfaces() {
        let provider = ScriptedProvider::new();
        provider.push_failure(ProviderError::Transient("boom".into()));
        let err = provider.summarize("x").await.unwrap_err();
        assert!(matches!(err, ProviderError::Transient(_)));
    }

    #[tokio::test]
    async fn test_health_flip() {
        let provider = ScriptedProvider::new();
        assert!(provider.health_check().await.available);
        provider.set_health(ProviderHealth::unavailable("maintenance"));
        let health = provider.health_check().await;
        assert!(!health.available);
        assert_eq!(health.reason.as_deref(), Some("maintenance"));
    }
}
