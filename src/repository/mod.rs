//! Durable storage contract for rooms, stories, chapters, messages,
//! memories, todos, and progress
//!
//! Multi-entity mutations (story creation, chapter transition, progression
//! bookkeeping, room deletion) are atomic: on failure nothing is written.
//! Writes must be durable before the corresponding event is broadcast.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::memory::Interaction;
use crate::types::{
    Chapter, ChapterId, Message, Player, PlayerId, PlayerProgress, Room, RoomId, Story, StoryId,
    Todo, TodoId,
};

pub mod sqlite;

pub use sqlite::SqliteRepository;

/// Errors produced by the repository.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A compare-and-set precondition failed (e.g. the observed active
    /// chapter changed under a transition).
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Transactional storage for every engine entity.
#[async_trait]
pub trait Repository: Send + Sync {
    // ── Players ─────────────────────────────────────────────────────

    async fn upsert_player(&self, player: &Player) -> Result<(), RepositoryError>;

    async fn get_player(&self, id: &PlayerId) -> Result<Option<Player>, RepositoryError>;

    // ── Rooms ───────────────────────────────────────────────────────

    async fn create_room(&self, room: &Room) -> Result<(), RepositoryError>;

    async fn get_room(&self, id: RoomId) -> Result<Option<Room>, RepositoryError>;

    async fn update_room(&self, room: &Room) -> Result<(), RepositoryError>;

    /// Delete a room and everything hanging off it (story, chapters, todos,
    /// progress, messages, memories, interactions). Atomic.
    async fn delete_room(&self, id: RoomId) -> Result<(), RepositoryError>;

    // ── Stories ─────────────────────────────────────────────────────

    /// Persist a freshly initialized story: the story row, its first
    /// chapter, the chapter's todo batch, and one progress row per member.
    /// Also links the room to the story. Atomic: a failure rolls everything
    /// back and the room keeps no story.
    async fn create_story(
        &self,
        story: &Story,
        first_chapter: &Chapter,
        todos: &[Todo],
        progress: &[PlayerProgress],
    ) -> Result<(), RepositoryError>;

    async fn get_story(&self, id: StoryId) -> Result<Option<Story>, RepositoryError>;

    async fn delete_story(&self, id: StoryId) -> Result<(), RepositoryError>;

    // ── Chapters ────────────────────────────────────────────────────

    async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>, RepositoryError>;

    async fn active_chapter(&self, story_id: StoryId) -> Result<Option<Chapter>, RepositoryError>;

    async fn chapters_for_story(&self, story_id: StoryId) -> Result<Vec<Chapter>, RepositoryError>;

    async fn update_chapter(&self, chapter: &Chapter) -> Result<(), RepositoryError>;

    /// Chapter transition with compare-and-set: verifies the story's active
    /// chapter is still `completed.id`, then completes it and activates
    /// `next` with its todo batch and fresh progress rows, all in one
    /// transaction. Returns [`RepositoryError::Conflict`] if another
    /// transition won the race.
    async fn complete_and_activate(
        &self,
        completed: &Chapter,
        next: &Chapter,
        todos: &[Todo],
        progress: &[PlayerProgress],
    ) -> Result<(), RepositoryError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message. Returns `false` without writing when the same
    /// `(room, client_id)` was already persisted.
    async fn insert_message(&self, message: &Message) -> Result<bool, RepositoryError>;

    async fn messages_for_room(&self, room_id: RoomId) -> Result<Vec<Message>, RepositoryError>;

    async fn all_messages_for_story(
        &self,
        story_id: StoryId,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// Global messages of the active chapter, newest last.
    async fn recent_global_messages(
        &self,
        story_id: StoryId,
        active_chapter: ChapterId,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError>;

    // ── Todos & progress ────────────────────────────────────────────

    async fn todos_for_chapter(&self, chapter_id: ChapterId) -> Result<Vec<Todo>, RepositoryError>;

    async fn progress_for_chapter(
        &self,
        chapter_id: ChapterId,
    ) -> Result<Vec<PlayerProgress>, RepositoryError>;

    /// Insert or replace progress rows (e.g. for a player joining
    /// mid-chapter).
    async fn upsert_progress(&self, rows: &[PlayerProgress]) -> Result<(), RepositoryError>;

    /// Mark `satisfied` todos completed and fold them into the player's
    /// progress row, recomputing its completion rate. One transaction;
    /// idempotent per todo id.
    async fn apply_feedback(
        &self,
        chapter_id: ChapterId,
        player_id: &PlayerId,
        satisfied: &[TodoId],
    ) -> Result<PlayerProgress, RepositoryError>;

    /// Force-complete every progress row of the chapter whose feedback
    /// window has expired, completing the chapter's todos along the way.
    /// Returns all progress rows for the chapter after the update.
    async fn mark_timeout_players_complete(
        &self,
        chapter_id: ChapterId,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlayerProgress>, RepositoryError>;

    // ── Memory ──────────────────────────────────────────────────────

    async fn save_memory(
        &self,
        story_id: StoryId,
        snapshot: &serde_json::Value,
    ) -> Result<(), RepositoryError>;

    async fn load_memory(
        &self,
        story_id: StoryId,
    ) -> Result<Option<serde_json::Value>, RepositoryError>;

    async fn insert_interaction(
        &self,
        story_id: StoryId,
        interaction: &Interaction,
    ) -> Result<(), RepositoryError>;

    // ── Maintenance ─────────────────────────────────────────────────

    /// Flush the write-ahead journal into the main database file.
    async fn checkpoint(&self) -> Result<(), RepositoryError>;
}
