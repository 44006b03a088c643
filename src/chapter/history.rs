//! In-memory chapter history for one story
//!
//! Cache of all chapters sorted by number, with timeline, adjacency, range,
//! search, and export views.

use serde::Serialize;

use crate::types::{Chapter, ChapterStatus};

/// Export formats for a story timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    Text,
    Structured,
}

/// One timeline row.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub number: u32,
    pub status: ChapterStatus,
    pub word_count: usize,
    pub summary: Option<String>,
}

/// Sorted chapter cache.
#[derive(Debug, Clone, Default)]
pub struct ChapterHistory {
    chapters: Vec<Chapter>,
}

impl ChapterHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a chapter, keeping number order.
    pub fn record(&mut self, chapter: Chapter) {
        match self.chapters.iter_mut().find(|c| c.id == chapter.id) {
            Some(existing) => *existing = chapter,
            None => {
                self.chapters.push(chapter);
                self.chapters.sort_by_key(|c| c.number);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn latest(&self) -> Option<&Chapter> {
        self.chapters.last()
    }

    pub fn get(&self, number: u32) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.number == number)
    }

    /// Previous and next chapters around `number`.
    pub fn neighbors(&self, number: u32) -> (Option<&Chapter>, Option<&Chapter>) {
        (
            number.checked_sub(1).and_then(|n| self.get(n)),
            self.get(number + 1),
        )
    }

    /// Chapters with numbers in `[from, to]`.
    pub fn range(&self, from: u32, to: u32) -> Vec<&Chapter> {
        self.chapters
            .iter()
            .filter(|c| c.number >= from && c.number <= to)
            .collect()
    }

    /// Case-insensitive content/summary search.
    pub fn search(&self, query: &str) -> Vec<&Chapter> {
        let needle = query.to_lowercase();
        self.chapters
            .iter()
            .filter(|c| {
                c.content.to_lowercase().contains(&needle)
                    || c.summary
                        .as_deref()
                        .is_some_and(|s| s.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Compact per-chapter overview.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.chapters
            .iter()
            .map(|c| TimelineEntry {
                number: c.number,
                status: c.status,
                word_count: c.word_count,
                summary: c.summary.clone(),
            })
            .collect()
    }

    /// Export the full history.
    pub fn export(&self, format: ExportFormat) -> String {
        match format {
            ExportFormat::Markdown => self
                .chapters
                .iter()
                .map(|c| format!("## Chapter {}\n\n{}\n", c.number, c.content))
                .collect::<Vec<_>>()
                .join("\n"),
            ExportFormat::Text => self
                .chapters
                .iter()
                .map(|c| format!("Chapter {}\n{}\n", c.number, c.content))
                .collect::<Vec<_>>()
                .join("\n"),
            ExportFormat::Structured => {
                serde_json::to_string_pretty(&self.chapters).unwrap_or_else(|_| "[]".to_string())
            }
        }
    }
}
