//! Auto-progression trigger policy for long-running chapters
//!
//! Evaluated in priority order; the first firing rule wins.

use chrono::{DateTime, Utc};

use crate::config::ChapterTriggerConfig;

/// Why a chapter should advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterTrigger {
    WordCount,
    KeyEvents,
    MessageCount,
    Elapsed,
    Inactivity,
}

impl std::fmt::Display for ChapterTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChapterTrigger::WordCount => write!(f, "word_count"),
            ChapterTrigger::KeyEvents => write!(f, "key_events"),
            ChapterTrigger::MessageCount => write!(f, "message_count"),
            ChapterTrigger::Elapsed => write!(f, "time_elapsed"),
            ChapterTrigger::Inactivity => write!(f, "player_inactivity"),
        }
    }
}

/// Rolling observations about the active chapter.
#[derive(Debug, Clone)]
pub struct TriggerObservations {
    pub word_count: usize,
    pub key_events: usize,
    pub message_count: usize,
    pub started_at: DateTime<Utc>,
    pub last_player_activity: DateTime<Utc>,
}

/// Return the highest-priority firing trigger, or `None`.
pub fn evaluate(
    config: &ChapterTriggerConfig,
    observations: &TriggerObservations,
    now: DateTime<Utc>,
) -> Option<ChapterTrigger> {
    if observations.word_count >= config.word_count {
        return Some(ChapterTrigger::WordCount);
    }
    if observations.key_events >= config.key_events {
        return Some(ChapterTrigger::KeyEvents);
    }
    if observations.message_count >= config.message_count {
        return Some(ChapterTrigger::MessageCount);
    }
    let elapsed = (now - observations.started_at).to_std().unwrap_or_default();
    if elapsed >= config.time_elapsed {
        return Some(ChapterTrigger::Elapsed);
    }
    let idle = (now - observations.last_player_activity)
        .to_std()
        .unwrap_or_default();
    if idle >= config.player_inactivity {
        return Some(ChapterTrigger::Inactivity);
    }
    None
}
