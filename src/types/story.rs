//! Story, chapter, todo, and progress entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChapterId, PlayerId, RoomId, StoryId, TodoId};

/// A story. Exactly one per room lifecycle; chapters hang off it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub room_id: RoomId,
    pub title: String,
    pub background: String,
    pub created_at: DateTime<Utc>,
}

impl Story {
    pub fn new(room_id: RoomId, title: impl Into<String>, background: impl Into<String>) -> Self {
        Self {
            id: StoryId::new(),
            room_id,
            title: title.into(),
            background: background.into(),
            created_at: Utc::now(),
        }
    }
}

/// Chapter status. Exactly one chapter per story is Active at any time after
/// initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Active,
    Completed,
}

/// A contiguous narrative segment. `number` is 1-based and dense per story.
/// System-authored chapters carry `author_id = None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub story_id: StoryId,
    pub number: u32,
    pub content: String,
    pub summary: Option<String>,
    pub author_id: Option<PlayerId>,
    pub status: ChapterStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub word_count: usize,
}

impl Chapter {
    pub fn new(story_id: StoryId, number: u32, content: impl Into<String>) -> Self {
        let content = content.into();
        let word_count = count_words(&content);
        Self {
            id: ChapterId::new(),
            story_id,
            number,
            content,
            summary: None,
            author_id: None,
            status: ChapterStatus::Active,
            start_time: Utc::now(),
            end_time: None,
            word_count,
        }
    }

    /// Append a generated block to the chapter content, separated from the
    /// existing text, and refresh the word count.
    pub fn append_block(&mut self, block: &str) {
        if !self.content.is_empty() {
            self.content.push_str("\n\n---\n\n");
        }
        self.content.push_str(block);
        self.word_count = count_words(&self.content);
    }

    /// Mark the chapter completed, appending the ending text and recording
    /// the summary.
    pub fn complete(&mut self, ending: &str, summary: String) {
        if !ending.is_empty() {
            self.append_block(ending);
        }
        self.summary = Some(summary);
        self.status = ChapterStatus::Completed;
        self.end_time = Some(Utc::now());
    }
}

/// Whitespace word count over the chapter text.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Todo status. Transitions pending→completed monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    Completed,
}

/// A per-chapter information-gathering objective. 3–5 are created atomically
/// at chapter activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub id: TodoId,
    pub chapter_id: ChapterId,
    pub content: String,
    pub expected_answer: Option<String>,
    pub priority: u8,
    pub status: TodoStatus,
}

impl Todo {
    pub fn new(
        chapter_id: ChapterId,
        content: impl Into<String>,
        expected_answer: Option<String>,
        priority: u8,
    ) -> Self {
        Self {
            id: TodoId::new(),
            chapter_id,
            content: content.into(),
            expected_answer,
            priority: priority.clamp(1, 5),
            status: TodoStatus::Pending,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TodoStatus::Completed
    }
}

/// Per-(chapter, player) feedback progress. `completed_todo_ids` records
/// which todos this player's answers satisfied, which keeps completion
/// marking idempotent per todo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerProgress {
    pub chapter_id: ChapterId,
    pub player_id: PlayerId,
    pub completed_todo_ids: Vec<TodoId>,
    pub total_todos: u32,
    pub completion_rate: f32,
    pub timeout_at: DateTime<Utc>,
}

impl PlayerProgress {
    pub fn new(
        chapter_id: ChapterId,
        player_id: PlayerId,
        total_todos: u32,
        timeout_at: DateTime<Utc>,
    ) -> Self {
        Self {
            chapter_id,
            player_id,
            completed_todo_ids: Vec::new(),
            total_todos,
            completion_rate: 0.0,
            timeout_at,
        }
    }

    pub fn completed_count(&self) -> u32 {
        self.completed_todo_ids.len() as u32
    }

    /// Record a satisfied todo and recompute the completion rate.
    /// Idempotent per todo id. Returns whether the set changed.
    pub fn record_completed(&mut self, todo_id: TodoId) -> bool {
        if self.completed_todo_ids.contains(&todo_id) {
            return false;
        }
        self.completed_todo_ids.push(todo_id);
        self.recompute_rate();
        true
    }

    /// Force the row to fully complete (feedback-timeout path).
    pub fn force_complete(&mut self, all_todo_ids: &[TodoId]) {
        for id in all_todo_ids {
            if !self.completed_todo_ids.contains(id) {
                self.completed_todo_ids.push(*id);
            }
        }
        self.recompute_rate();
    }

    fn recompute_rate(&mut self) {
        self.completion_rate = if self.total_todos == 0 {
            0.0
        } else {
            self.completed_count() as f32 / self.total_todos as f32
        };
    }
}
