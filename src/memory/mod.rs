//! Layered story memory
//!
//! Three sub-stores per story: a bounded short-term interaction buffer that
//! compresses on overflow, per-chapter summaries, and a long-term store of
//! key events, mined character relations, themes, and world settings.
//! Retrieval blends keyword relevance with a caller-provided character
//! budget.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub mod long_term;
pub mod retrieval;
pub mod short_term;

pub use long_term::{CharacterRelation, KeyEvent, LongTermStore, RelationMiner};
pub use retrieval::{MemoryBundle, RetrievalLimits};
pub use short_term::{Interaction, ShortTermBuffer};

use crate::config::MemoryConfig;
use crate::types::PlayerId;

/// One stored chapter summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterDigest {
    pub number: u32,
    pub summary: String,
}

/// The full layered memory for one story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryMemory {
    pub short_term: ShortTermBuffer,
    pub chapters: Vec<ChapterDigest>,
    pub long_term: LongTermStore,
    #[serde(skip, default)]
    miner: RelationMiner,
}

impl StoryMemory {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            short_term: ShortTermBuffer::new(
                config.short_term_min_size,
                config.short_term_max_size,
                config.salience_keywords.clone(),
            ),
            chapters: Vec::new(),
            long_term: LongTermStore::default(),
            miner: RelationMiner::default(),
        }
    }

    /// Record one player/engine exchange in the short-term buffer.
    pub fn record_interaction(&mut self, player_id: PlayerId, input: &str, response: &str) {
        self.short_term.push(player_id, input, response);
    }

    /// Store the summary of a completed chapter.
    pub fn add_chapter_digest(&mut self, number: u32, summary: impl Into<String>) {
        let summary = summary.into();
        match self.chapters.iter_mut().find(|d| d.number == number) {
            Some(existing) => existing.summary = summary,
            None => {
                self.chapters.push(ChapterDigest { number, summary });
                self.chapters.sort_by_key(|d| d.number);
            }
        }
    }

    /// Mine key events and character relations out of finished chapter text.
    /// Returns how many key events were extracted.
    pub fn absorb_chapter(&mut self, content: &str) -> usize {
        let relations = self.miner.mine(content);
        for relation in relations {
            self.long_term.upsert_relation(relation);
        }
        let events = long_term::extract_key_events(content, &self.short_term.salience_keywords);
        let count = events.len();
        for event in events {
            self.long_term.add_key_event(event);
        }
        count
    }

    /// Relevance-ranked retrieval over every layer, bounded by `limits`.
    pub fn relevant_memories(&self, topic: &str, limits: &RetrievalLimits) -> MemoryBundle {
        retrieval::retrieve(self, topic, limits)
    }

    /// Serialize for repository persistence.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Restore from a repository snapshot, keeping `config` bounds.
    pub fn restore(config: &MemoryConfig, snapshot: &serde_json::Value) -> Option<Self> {
        let mut memory: StoryMemory = serde_json::from_value(snapshot.clone()).ok()?;
        memory
            .short_term
            .rebound(config.short_term_min_size, config.short_term_max_size);
        Some(memory)
    }
}

/// Lowercased alphanumeric tokens of a text.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// The first `limit` non-stopword tokens, deduplicated, order preserved.
pub(crate) fn keywords_of(text: &str, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .filter(|t| seen.insert(t.clone()))
        .take(limit)
        .collect()
}

/// Split a text into sentences on terminal punctuation.
pub(crate) fn split_sentences(text: &str) -> Vec<&str> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "of", "to", "in", "on", "at", "by", "for",
    "with", "is", "are", "was", "were", "be", "been", "it", "its", "this", "that", "these",
    "those", "i", "you", "he", "she", "we", "they", "my", "your", "his", "her", "our", "their",
    "do", "does", "did", "have", "has", "had", "not", "no", "so", "as", "from", "into", "than",
];

pub(crate) fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}
