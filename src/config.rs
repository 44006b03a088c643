//! Configuration for the coordination engine
//!
//! Centralized serde-backed configuration with validated defaults, loadable
//! from TOML. Every tunable the engine recognizes lives here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {0}")]
    Io(String),

    #[error("Configuration parsing error: {0}")]
    Parse(String),
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub chapter: ChapterTriggerConfig,
    pub story_trigger: StoryTriggerConfig,
    pub queue: QueueConfig,
    pub provider: ProviderConfig,
    pub memory: MemoryConfig,
    pub repository: RepositoryConfig,
}

impl Config {
    /// Parse a TOML document. Missing sections and fields fall back to
    /// defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file on disk.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.engine.progression_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "engine.progression_threshold".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue.max_concurrent".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.memory.short_term_min_size > self.memory.short_term_max_size {
            return Err(ConfigError::InvalidValue {
                key: "memory.short_term_min_size".to_string(),
                reason: "must not exceed short_term_max_size".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.chapter.random_event_probability) {
            return Err(ConfigError::InvalidValue {
                key: "chapter.random_event_probability".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

/// Room-engine level knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Duration after which a per-chapter feedback window force-completes.
    #[serde(with = "humantime_serde")]
    pub feedback_timeout: Duration,
    /// Per-player completion fraction needed to progress a chapter.
    pub progression_threshold: f32,
    /// Delay before deleting a room with zero members.
    #[serde(with = "humantime_serde")]
    pub empty_room_grace_period: Duration,
    /// Maximum room name length accepted by create_room.
    pub max_room_name_len: usize,
    /// Maximum message length accepted by send_message.
    pub max_message_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feedback_timeout: Duration::from_secs(10 * 60),
            progression_threshold: 0.8,
            empty_room_grace_period: Duration::from_secs(5 * 60),
            max_room_name_len: 50,
            max_message_len: 1000,
        }
    }
}

/// Per-trigger thresholds for auto-progression of long chapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChapterTriggerConfig {
    pub word_count: usize,
    pub key_events: usize,
    pub message_count: usize,
    #[serde(with = "humantime_serde")]
    pub time_elapsed: Duration,
    #[serde(with = "humantime_serde")]
    pub player_inactivity: Duration,
    /// Probability that a chapter transition injects a random event.
    pub random_event_probability: f64,
}

impl Default for ChapterTriggerConfig {
    fn default() -> Self {
        Self {
            word_count: 2500,
            key_events: 3,
            message_count: 15,
            time_elapsed: Duration::from_secs(30 * 60),
            player_inactivity: Duration::from_secs(10 * 60),
            random_event_probability: 0.15,
        }
    }
}

/// Per-message rules deciding whether a global message triggers story
/// generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryTriggerConfig {
    /// Generate whenever the count of messages since the last AI output is a
    /// multiple of this.
    pub message_threshold: u32,
    /// Messages longer than this always trigger.
    pub long_message_threshold: usize,
    /// Generate when this long has passed since the last AI output.
    #[serde(with = "humantime_serde")]
    pub time_threshold: Duration,
    pub action_keywords: Vec<String>,
    pub high_priority_keywords: Vec<String>,
    pub question_triggers: Vec<String>,
    pub dramatic_keywords: Vec<String>,
    pub emotion_keywords: Vec<String>,
}

impl Default for StoryTriggerConfig {
    fn default() -> Self {
        Self {
            message_threshold: 3,
            long_message_threshold: 80,
            time_threshold: Duration::from_secs(2 * 60),
            action_keywords: to_strings(&[
                "open", "search", "examine", "follow", "unlock", "enter", "take", "attack",
                "hide", "run",
            ]),
            high_priority_keywords: to_strings(&[
                "murder", "body", "weapon", "blood", "poison", "alibi", "confess",
            ]),
            question_triggers: to_strings(&["?", "or", "if", "shall we", "should we", "what if"]),
            dramatic_keywords: to_strings(&[
                "scream", "dead", "vanish", "betray", "reveal", "threat", "accuse",
            ]),
            emotion_keywords: to_strings(&[
                "afraid", "angry", "nervous", "suspicious", "shocked", "panic",
            ]),
        }
    }
}

/// Request-queue knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_retries: u32,
    /// Base retry delay; actual backoff is linear (`retry_delay × attempt`).
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Per-attempt provider call timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Which wire format the HTTP provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderWire {
    #[default]
    OpenAi,
    Anthropic,
}

/// Provider selection and availability caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub wire: ProviderWire,
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// How long a health-check result is trusted before re-probing.
    #[serde(with = "humantime_serde")]
    pub availability_ttl: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            wire: ProviderWire::OpenAi,
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            availability_ttl: Duration::from_secs(60),
        }
    }
}

/// Memory-subsystem bounds and retrieval budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub short_term_max_size: usize,
    pub short_term_min_size: usize,
    /// Salience keywords used for importance scoring and compression
    /// (localizable).
    pub salience_keywords: Vec<String>,
    /// Character budget for retrieved context.
    pub context_char_budget: usize,
    /// Characters per token, used to map a token budget to characters.
    pub chars_per_token: usize,
    /// Maximum stored chapter-summary length.
    pub summary_max_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_max_size: 30,
            short_term_min_size: 10,
            salience_keywords: to_strings(&[
                "discover", "decide", "secret", "relationship", "setting", "clue", "motive",
                "suspect",
            ]),
            context_char_budget: 4000,
            chars_per_token: 4,
            summary_max_chars: 200,
        }
    }
}

/// Embedded-store location and checkpoint cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Database file path. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// WAL checkpoint interval.
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            checkpoint_interval: Duration::from_secs(5 * 60),
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_concurrent, 3);
        assert_eq!(config.chapter.word_count, 2500);
        assert_eq!(config.engine.feedback_timeout, Duration::from_secs(600));
        assert!((config.engine.progression_threshold - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let config = Config::from_toml_str(
            r#"
            [engine]
            feedback_timeout = "200ms"
            progression_threshold = 0.5

            [queue]
            max_concurrent = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.feedback_timeout, Duration::from_millis(200));
        assert!((config.engine.progression_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.queue.max_concurrent, 5);
        // untouched sections keep defaults
        assert_eq!(config.chapter.message_count, 15);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let err = Config::from_toml_str(
            r#"
            [engine]
            progression_threshold = 1.5
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let err = Config::from_toml_str(
            r#"
            [memory]
            short_term_min_size = 50
            short_term_max_size = 10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
