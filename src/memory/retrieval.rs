//! Relevance-ranked memory retrieval under a character budget
//!
//! Relevance blends Jaccard similarity over keyword sets with a
//! keyword-coverage ratio (60/40). The caller budget is split across layers:
//! short-term 30%, chapter summaries 30%, key events 20%, and the remainder
//! for relations, themes, and world settings. Items are taken
//! highest-relevance first; an overlong final item is tail-truncated with an
//! ellipsis.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::long_term::event_keywords;
use super::{keywords_of, StoryMemory};

/// Budget and ratio knobs for one retrieval.
#[derive(Debug, Clone)]
pub struct RetrievalLimits {
    /// Total character budget across all layers.
    pub char_budget: usize,
}

impl RetrievalLimits {
    pub fn chars(char_budget: usize) -> Self {
        Self { char_budget }
    }

    /// Map a token budget to characters with a fixed chars-per-token ratio.
    pub fn tokens(token_budget: usize, chars_per_token: usize) -> Self {
        Self {
            char_budget: token_budget * chars_per_token.max(1),
        }
    }
}

/// Retrieved context, one bucket per memory layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryBundle {
    pub short_term: Vec<String>,
    pub chapters: Vec<String>,
    pub key_events: Vec<String>,
    pub relations: Vec<String>,
    pub themes: Vec<String>,
    pub world_settings: Vec<String>,
}

impl MemoryBundle {
    pub fn is_empty(&self) -> bool {
        self.short_term.is_empty()
            && self.chapters.is_empty()
            && self.key_events.is_empty()
            && self.relations.is_empty()
            && self.themes.is_empty()
            && self.world_settings.is_empty()
    }

    /// Render the bundle as prompt context.
    pub fn render(&self) -> String {
        let mut sections: Vec<String> = Vec::new();
        push_section(&mut sections, "Recent exchanges", &self.short_term);
        push_section(&mut sections, "Previous chapters", &self.chapters);
        push_section(&mut sections, "Key events", &self.key_events);
        push_section(&mut sections, "Relationships", &self.relations);
        push_section(&mut sections, "Themes", &self.themes);
        push_section(&mut sections, "World", &self.world_settings);
        sections.join("\n\n")
    }
}

fn push_section(sections: &mut Vec<String>, title: &str, items: &[String]) {
    if !items.is_empty() {
        sections.push(format!("{title}:\n- {}", items.join("\n- ")));
    }
}

/// Relevance of an item against the topic: 0.6 × Jaccard + 0.4 × coverage.
fn relevance(topic: &[String], item: &[String]) -> f32 {
    if topic.is_empty() || item.is_empty() {
        return 0.0;
    }
    let topic_set: HashSet<&String> = topic.iter().collect();
    let item_set: HashSet<&String> = item.iter().collect();
    let intersection = topic_set.intersection(&item_set).count() as f32;
    let union = topic_set.union(&item_set).count() as f32;
    let jaccard = if union == 0.0 { 0.0 } else { intersection / union };
    let coverage = intersection / topic_set.len() as f32;
    0.6 * jaccard + 0.4 * coverage
}

/// Select ranked items into `share` characters, tail-truncating the last.
fn select(mut scored: Vec<(f32, String)>, share: usize) -> Vec<String> {
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut out = Vec::new();
    let mut used = 0usize;
    for (_, text) in scored {
        if used >= share {
            break;
        }
        let remaining = share - used;
        let len = text.chars().count();
        if len <= remaining {
            used += len;
            out.push(text);
        } else if remaining > 1 {
            let truncated: String = text.chars().take(remaining - 1).collect();
            out.push(format!("{truncated}…"));
            break;
        } else {
            break;
        }
    }
    out
}

pub(super) fn retrieve(
    memory: &StoryMemory,
    topic: &str,
    limits: &RetrievalLimits,
) -> MemoryBundle {
    let topic_keywords = keywords_of(topic, 10);
    let budget = limits.char_budget;
    let short_share = budget * 30 / 100;
    let chapter_share = budget * 30 / 100;
    let event_share = budget * 20 / 100;
    let rest_share = budget.saturating_sub(short_share + chapter_share + event_share);

    let short_scored: Vec<(f32, String)> = memory
        .short_term
        .iter()
        .map(|item| {
            let text = if item.input.is_empty() {
                item.response.clone()
            } else {
                format!("{} → {}", item.input, item.response)
            };
            // Blend stored importance in so high-value exchanges survive
            // topic drift.
            let score = relevance(&topic_keywords, &item.keywords) + 0.1 * item.importance;
            (score, text)
        })
        .collect();

    let chapter_scored: Vec<(f32, String)> = memory
        .chapters
        .iter()
        .map(|digest| {
            let keywords = keywords_of(&digest.summary, 10);
            (
                relevance(&topic_keywords, &keywords),
                format!("Chapter {}: {}", digest.number, digest.summary),
            )
        })
        .collect();

    let event_scored: Vec<(f32, String)> = memory
        .long_term
        .key_events
        .iter()
        .map(|event| {
            let score = relevance(&topic_keywords, &event_keywords(event))
                + 0.05 * event.importance as f32;
            (score, event.text.clone())
        })
        .collect();

    let mut rest_scored: Vec<(f32, String)> = memory
        .long_term
        .relations
        .iter()
        .map(|relation| {
            let text = format!(
                "{} / {} ({:+.1}): {}",
                relation.a, relation.b, relation.weight, relation.evidence
            );
            let keywords = keywords_of(&text, 10);
            (relevance(&topic_keywords, &keywords), text)
        })
        .collect();
    rest_scored.extend(memory.long_term.themes.iter().map(|theme| {
        (
            relevance(&topic_keywords, &keywords_of(theme, 10)),
            theme.clone(),
        )
    }));
    rest_scored.extend(memory.long_term.world_settings.iter().map(|setting| {
        (
            relevance(&topic_keywords, &keywords_of(setting, 10)),
            setting.clone(),
        )
    }));

    let selected_rest = select(rest_scored, rest_share);
    let relation_texts: HashSet<String> = memory
        .long_term
        .relations
        .iter()
        .map(|relation| {
            format!(
                "{} / {} ({:+.1}): {}",
                relation.a, relation.b, relation.weight, relation.evidence
            )
        })
        .collect();
    let theme_texts: HashSet<&String> = memory.long_term.themes.iter().collect();

    let mut bundle = MemoryBundle {
        short_term: select(short_scored, short_share),
        chapters: select(chapter_scored, chapter_share),
        key_events: select(event_scored, event_share),
        ..Default::default()
    };
    for text in selected_rest {
        if relation_texts.contains(&text) {
            bundle.relations.push(text);
        } else if theme_texts.contains(&text) {
            bundle.themes.push(text);
        } else {
            bundle.world_settings.push(text);
        }
    }
    bundle
}
