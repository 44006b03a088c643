//! HTTP provider speaking OpenAI-compatible and Anthropic wire formats
//!
//! The concrete transport for production deployments. The wire format and
//! credentials come from [`ProviderConfig`]; status codes are mapped onto
//! the provider error taxonomy so the request queue can decide what to
//! retry.

use async_trait::async_trait;
use std::time::Duration;

use super::{
    ChatMessage, ChatOptions, ChatRole, Completion, GenerateRequest, ProviderError,
    ProviderHealth, StoryProvider, TokenUsage,
};
use crate::config::{ProviderConfig, ProviderWire};

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// HTTP-backed story provider.
#[derive(Debug)]
pub struct HttpProvider {
    client: reqwest::Client,
    wire: ProviderWire,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl HttpProvider {
    /// Build from configuration, reading the API key from the configured
    /// environment variable.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ProviderError::Unavailable(format!("{} not set", config.api_key_env))
        })?;
        let base_url = config.base_url.clone().unwrap_or_else(|| {
            match config.wire {
                ProviderWire::OpenAi => DEFAULT_OPENAI_BASE,
                ProviderWire::Anthropic => DEFAULT_ANTHROPIC_BASE,
            }
            .to_string()
        });
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Permanent(format!("HTTP client error: {e}")))?;

        tracing::info!(
            wire = ?config.wire,
            model = %config.model,
            "HTTP provider initialized"
        );

        Ok(Self {
            client,
            wire: config.wire,
            base_url,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
        json: bool,
    ) -> Result<Completion, ProviderError> {
        match self.wire {
            ProviderWire::OpenAi => {
                self.openai_completion(messages, max_tokens, temperature, json)
                    .await
            }
            ProviderWire::Anthropic => {
                self.anthropic_completion(messages, max_tokens, temperature)
                    .await
            }
        }
    }

    async fn openai_completion(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
        json: bool,
    ) -> Result<Completion, ProviderError> {
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": role_name(m.role),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        if json {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let start = std::time::Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let resp_json = check_status(response).await?;
        let latency = start.elapsed();

        let content = resp_json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::Transient("No content in completion choices".to_string())
            })?;

        let tokens = parse_openai_usage(&resp_json);
        let model = resp_json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&self.model)
            .to_string();

        tracing::debug!(
            model = %model,
            total_tokens = tokens.total_tokens,
            ?latency,
            "completion finished"
        );

        Ok(Completion {
            content,
            model,
            tokens,
        })
    }

    async fn anthropic_completion(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Completion, ProviderError> {
        // Anthropic carries the system prompt in a top-level field.
        let system: String = messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| {
                serde_json::json!({
                    "role": role_name(m.role),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system);
        }

        let start = std::time::Instant::now();
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let resp_json = check_status(response).await?;
        let latency = start.elapsed();

        // Content arrives as an array of blocks; take the text blocks.
        let content = resp_json
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::Transient("No text content in response".to_string()))?;

        let tokens = parse_anthropic_usage(&resp_json);
        let model = resp_json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&self.model)
            .to_string();

        tracing::debug!(
            model = %model,
            total_tokens = tokens.total_tokens,
            ?latency,
            "completion finished"
        );

        Ok(Completion {
            content,
            model,
            tokens,
        })
    }
}

#[async_trait]
impl StoryProvider for HttpProvider {
    async fn generate_story(&self, request: GenerateRequest) -> Result<Completion, ProviderError> {
        let messages = [
            ChatMessage::system(request.context),
            ChatMessage::user(request.prompt),
        ];
        self.chat_completion(&messages, request.max_tokens, request.temperature, false)
            .await
    }

    async fn summarize(&self, text: &str) -> Result<String, ProviderError> {
        let messages = [
            ChatMessage::system(
                "Summarize the following narrative passage in at most two sentences. \
                 Reply with the summary only.",
            ),
            ChatMessage::user(text),
        ];
        let completion = self.chat_completion(&messages, 256, 0.2, false).await?;
        Ok(completion.content)
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<Completion, ProviderError> {
        self.chat_completion(messages, options.max_tokens, options.temperature, options.json)
            .await
    }

    async fn health_check(&self) -> ProviderHealth {
        let request = match self.wire {
            ProviderWire::OpenAi => self
                .client
                .get(format!("{}/models", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key)),
            ProviderWire::Anthropic => self
                .client
                .get(format!("{}/models", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };

        match request.timeout(Duration::from_secs(5)).send().await {
            Ok(resp) if resp.status().is_success() => ProviderHealth::available(),
            Ok(resp) => ProviderHealth::unavailable(format!("health probe status {}", resp.status())),
            Err(e) => ProviderHealth::unavailable(format!("health probe failed: {e}")),
        }
    }

    fn name(&self) -> &str {
        match self.wire {
            ProviderWire::OpenAi => "openai-compatible",
            ProviderWire::Anthropic => "anthropic",
        }
    }
}

fn role_name(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(Duration::from_secs(120))
    } else {
        ProviderError::Transient(format!("request failed: {e}"))
    }
}

/// Map a non-success status onto the error taxonomy and parse the body of a
/// successful response.
async fn check_status(response: reqwest::Response) -> Result<serde_json::Value, ProviderError> {
    let status = response.status();
    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ProviderError::RateLimited { retry_after });
    }
    if status.is_server_error() {
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::Transient(format!("{status}: {text}")));
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::Permanent(format!("{status}: {text}")));
    }
    response
        .json()
        .await
        .map_err(|e| ProviderError::Transient(format!("response parse error: {e}")))
}

fn parse_openai_usage(resp: &serde_json::Value) -> TokenUsage {
    resp.get("usage")
        .map(|u| TokenUsage {
            prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            completion_tokens: u
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        })
        .unwrap_or_default()
}

fn parse_anthropic_usage(resp: &serde_json::Value) -> TokenUsage {
    resp.get("usage")
        .map(|u| {
            let prompt = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let completion = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            TokenUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            }
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_usage_parsing() {
        let resp = serde_json::json!({
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let usage = parse_openai_usage(&resp);
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn test_anthropic_usage_parsing_sums_total() {
        let resp = serde_json::json!({
            "usage": {"input_tokens": 7, "output_tokens": 3}
        });
        let usage = parse_anthropic_usage(&resp);
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn test_missing_usage_defaults_to_zero() {
        let usage = parse_openai_usage(&serde_json::json!({}));
        assert_eq!(usage.total_tokens, 0);
    }

    #[test]
    fn test_from_config_without_key_is_unavailable() {
        let config = ProviderConfig {
            api_key_env: "STORYHOST_TEST_KEY_THAT_DOES_NOT_EXIST".to_string(),
            ..Default::default()
        };
        let err = HttpProvider::from_config(&config).unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
