//! Short-term interaction buffer
//!
//! Insertion-ordered and capacity-bounded. When an insert overflows
//! `max_size`, the buffer keeps the `min_size` most important items and folds
//! the rest into a single synthetic interaction built from their salient
//! sentences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::{keywords_of, split_sentences, tokenize};
use crate::types::PlayerId;

const KEYWORD_LIMIT: usize = 10;

/// One recorded exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub player_id: PlayerId,
    pub input: String,
    pub response: String,
    pub importance: f32,
    pub keywords: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded recent-interaction queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermBuffer {
    items: VecDeque<Interaction>,
    min_size: usize,
    max_size: usize,
    pub(crate) salience_keywords: Vec<String>,
}

impl ShortTermBuffer {
    pub fn new(min_size: usize, max_size: usize, salience_keywords: Vec<String>) -> Self {
        Self {
            items: VecDeque::new(),
            min_size,
            max_size: max_size.max(min_size.max(1)),
            salience_keywords,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interaction> {
        self.items.iter()
    }

    /// Re-apply size bounds after restoring from persistence.
    pub fn rebound(&mut self, min_size: usize, max_size: usize) {
        self.min_size = min_size;
        self.max_size = max_size.max(min_size.max(1));
        if self.items.len() > self.max_size {
            self.compress();
        }
    }

    /// Insert an exchange, scoring importance and extracting keywords at
    /// insert time. Compresses on overflow.
    pub fn push(&mut self, player_id: PlayerId, input: &str, response: &str) {
        let importance = self.score_importance(input, response);
        let combined = format!("{input} {response}");
        let interaction = Interaction {
            player_id,
            input: input.to_string(),
            response: response.to_string(),
            importance,
            keywords: keywords_of(&combined, KEYWORD_LIMIT),
            timestamp: Utc::now(),
        };
        self.items.push_back(interaction);
        if self.items.len() > self.max_size {
            self.compress();
        }
    }

    /// Importance: base 0.5, +0.1 per matched salience keyword, +0.1 when
    /// the exchange exceeds 500 chars and again past 1000, +0.1 on an
    /// interrogative input, capped at 1.0.
    fn score_importance(&self, input: &str, response: &str) -> f32 {
        let combined = format!("{input} {response}");
        let tokens = tokenize(&combined);
        let mut score = 0.5_f32;
        for keyword in &self.salience_keywords {
            if tokens.iter().any(|t| t == &keyword.to_lowercase()) {
                score += 0.1;
            }
        }
        let total_len = combined.chars().count();
        if total_len > 500 {
            score += 0.1;
        }
        if total_len > 1000 {
            score += 0.1;
        }
        if input.contains('?') {
            score += 0.1;
        }
        score.min(1.0)
    }

    /// Keep the `min_size` most important items (in their original order)
    /// and fold the remainder into one synthetic interaction made of their
    /// salient sentences.
    fn compress(&mut self) {
        if self.items.len() <= self.min_size {
            return;
        }
        let mut ranked: Vec<(usize, f32)> = self
            .items
            .iter()
            .enumerate()
            .map(|(idx, item)| (idx, item.importance))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let kept: std::collections::HashSet<usize> =
            ranked.iter().take(self.min_size).map(|(idx, _)| *idx).collect();

        let mut retained = VecDeque::with_capacity(self.min_size + 1);
        let mut folded: Vec<Interaction> = Vec::new();
        for (idx, item) in std::mem::take(&mut self.items).into_iter().enumerate() {
            if kept.contains(&idx) {
                retained.push_back(item);
            } else {
                folded.push(item);
            }
        }

        let folded_count = folded.len();
        if let Some(synthetic) = self.fold(&folded) {
            retained.push_front(synthetic);
        }
        self.items = retained;
        tracing::debug!(
            folded = folded_count,
            retained = self.items.len(),
            "short-term buffer compressed"
        );
    }

    fn fold(&self, folded: &[Interaction]) -> Option<Interaction> {
        if folded.is_empty() {
            return None;
        }
        let lowered: Vec<String> = self
            .salience_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .collect();
        let mut salient: Vec<String> = Vec::new();
        for item in folded {
            let text = format!("{} {}", item.input, item.response);
            for sentence in split_sentences(&text) {
                let lower = sentence.to_lowercase();
                if lowered.iter().any(|k| lower.contains(k.as_str())) {
                    salient.push(sentence.to_string());
                }
            }
        }
        let content = if salient.is_empty() {
            format!("{} earlier exchanges elided", folded.len())
        } else {
            salient.join(" ")
        };
        let importance = folded
            .iter()
            .map(|i| i.importance)
            .fold(0.0_f32, f32::max);
        Some(Interaction {
            player_id: PlayerId::story_machine(),
            input: String::new(),
            response: content.clone(),
            importance,
            keywords: keywords_of(&content, KEYWORD_LIMIT),
            timestamp: folded.last().map(|i| i.timestamp).unwrap_or_else(Utc::now),
        })
    }
}
