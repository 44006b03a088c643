//! Story-generation trigger rules for global messages
//!
//! Evaluated in order over the current chapter's global traffic; the first
//! firing rule wins. The rule set errs toward liveness: a quiet room still
//! gets narrative pushes through the cadence and time rules.

use chrono::{DateTime, Utc};

use crate::config::StoryTriggerConfig;

/// Which rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoryTriggerReason {
    FirstMessage,
    MessageCadence,
    ActionKeyword,
    QuestionTrigger,
    DramaticKeyword,
    LongMessage,
    TimeInterval,
}

impl std::fmt::Display for StoryTriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StoryTriggerReason::FirstMessage => "first_message",
            StoryTriggerReason::MessageCadence => "message_cadence",
            StoryTriggerReason::ActionKeyword => "action_keyword",
            StoryTriggerReason::QuestionTrigger => "question_trigger",
            StoryTriggerReason::DramaticKeyword => "dramatic_keyword",
            StoryTriggerReason::LongMessage => "long_message",
            StoryTriggerReason::TimeInterval => "time_interval",
        };
        write!(f, "{name}")
    }
}

/// Chapter-scoped counters the rules consult. Counts include the message
/// under evaluation.
#[derive(Debug, Clone)]
pub(crate) struct TriggerCounters {
    pub global_messages_this_chapter: u32,
    pub messages_since_ai_output: u32,
    pub last_ai_output: DateTime<Utc>,
}

/// Evaluate the rule list for one inbound global message.
pub(crate) fn evaluate(
    config: &StoryTriggerConfig,
    message: &str,
    counters: &TriggerCounters,
    now: DateTime<Utc>,
) -> Option<StoryTriggerReason> {
    if counters.global_messages_this_chapter <= 1 {
        return Some(StoryTriggerReason::FirstMessage);
    }
    if config.message_threshold > 0
        && counters.messages_since_ai_output > 0
        && counters.messages_since_ai_output % config.message_threshold == 0
    {
        return Some(StoryTriggerReason::MessageCadence);
    }
    if contains_any(message, &config.action_keywords)
        || contains_any(message, &config.high_priority_keywords)
    {
        return Some(StoryTriggerReason::ActionKeyword);
    }
    if contains_any(message, &config.question_triggers) {
        return Some(StoryTriggerReason::QuestionTrigger);
    }
    if contains_any(message, &config.dramatic_keywords)
        || contains_any(message, &config.emotion_keywords)
    {
        return Some(StoryTriggerReason::DramaticKeyword);
    }
    if message.chars().count() > config.long_message_threshold {
        return Some(StoryTriggerReason::LongMessage);
    }
    let since_ai = (now - counters.last_ai_output).to_std().unwrap_or_default();
    if since_ai > config.time_threshold {
        return Some(StoryTriggerReason::TimeInterval);
    }
    None
}

/// Keyword match: whole-token equality for single words, substring match for
/// phrases and punctuation triggers like `?`.
fn contains_any(message: &str, keywords: &[String]) -> bool {
    let lower = message.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    keywords.iter().any(|keyword| {
        let keyword = keyword.to_lowercase();
        if keyword.chars().all(|c| c.is_alphanumeric()) && !keyword.is_empty() {
            tokens.iter().any(|t| *t == keyword)
        } else {
            lower.contains(&keyword)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(global: u32, since_ai: u32) -> TriggerCounters {
        TriggerCounters {
            global_messages_this_chapter: global,
            messages_since_ai_output: since_ai,
            last_ai_output: Utc::now(),
        }
    }

    #[test]
    fn test_first_message_always_fires() {
        let config = StoryTriggerConfig::default();
        assert_eq!(
            evaluate(&config, "hello", &counters(1, 1), Utc::now()),
            Some(StoryTriggerReason::FirstMessage)
        );
    }

    #[test]
    fn test_cadence_fires_on_multiple() {
        let config = StoryTriggerConfig::default();
        assert_eq!(
            evaluate(&config, "plain chatter", &counters(5, 3), Utc::now()),
            Some(StoryTriggerReason::MessageCadence)
        );
        assert_eq!(
            evaluate(&config, "plain chatter", &counters(5, 4), Utc::now()),
            None
        );
    }

    #[test]
    fn test_action_keyword_token_match() {
        let config = StoryTriggerConfig::default();
        assert_eq!(
            evaluate(&config, "let us search the study", &counters(5, 1), Utc::now()),
            Some(StoryTriggerReason::ActionKeyword)
        );
        // "research" must not match the token "search"
        assert_eq!(
            evaluate(&config, "research takes time", &counters(5, 1), Utc::now()),
            None
        );
    }

    #[test]
    fn test_question_mark_substring_match() {
        let config = StoryTriggerConfig::default();
        assert_eq!(
            evaluate(&config, "was it the butler?", &counters(5, 1), Utc::now()),
            Some(StoryTriggerReason::QuestionTrigger)
        );
        assert_eq!(
            evaluate(&config, "shall we split up", &counters(5, 1), Utc::now()),
            Some(StoryTriggerReason::QuestionTrigger)
        );
    }

    #[test]
    fn test_dramatic_keyword() {
        let config = StoryTriggerConfig::default();
        assert_eq!(
            evaluate(&config, "I heard a scream upstairs", &counters(5, 1), Utc::now()),
            Some(StoryTriggerReason::DramaticKeyword)
        );
    }

    #[test]
    fn test_long_message() {
        let config = StoryTriggerConfig::default();
        let long = "a plain line of text without any trigger words repeated over and over again \
                    until it is quite long";
        assert_eq!(
            evaluate(&config, long, &counters(5, 1), Utc::now()),
            Some(StoryTriggerReason::LongMessage)
        );
    }

    #[test]
    fn test_time_interval() {
        let config = StoryTriggerConfig::default();
        let stale = TriggerCounters {
            global_messages_this_chapter: 5,
            messages_since_ai_output: 1,
            last_ai_output: Utc::now() - chrono::Duration::minutes(3),
        };
        assert_eq!(
            evaluate(&config, "quiet words", &stale, Utc::now()),
            Some(StoryTriggerReason::TimeInterval)
        );
    }

    #[test]
    fn test_nothing_fires() {
        let config = StoryTriggerConfig::default();
        assert_eq!(
            evaluate(&config, "quiet words", &counters(5, 1), Utc::now()),
            None
        );
    }
}
