//! Embedded repository backed by SQLite
//!
//! Uses a write-ahead journal for durability; [`checkpoint`] folds the
//! journal back into the main file on the cadence the runtime chooses.
//! A single connection behind an async mutex serializes writers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use super::{Repository, RepositoryError};
use crate::memory::Interaction;
use crate::types::{
    Chapter, ChapterId, ChapterStatus, Message, MessageId, MessageKind, Player, PlayerId,
    PlayerProgress, PlayerRef, PlayerRole, Room, RoomId, RoomStatus, Story, StoryId, Todo,
    TodoId, TodoStatus,
};

/// SQLite-backed repository.
pub struct SqliteRepository {
    conn: tokio::sync::Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (or create) the database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, RepositoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RepositoryError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn =
            Connection::open(path).map_err(|e| RepositoryError::Sqlite(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| RepositoryError::Sqlite(e.to_string()))?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests and ephemeral deployments).
    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RepositoryError::Sqlite(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, RepositoryError> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| RepositoryError::Sqlite(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), RepositoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS players (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL,
                stats_json   TEXT NOT NULL DEFAULT '{}',
                last_active  TEXT NOT NULL,
                online       INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS rooms (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                host_id     TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'waiting',
                story_id    TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS room_players (
                room_id    TEXT NOT NULL,
                player_id  TEXT NOT NULL,
                role       TEXT NOT NULL DEFAULT 'player',
                joined_at  TEXT NOT NULL,
                ord        INTEGER NOT NULL,
                PRIMARY KEY (room_id, player_id),
                FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS stories (
                id          TEXT PRIMARY KEY,
                room_id     TEXT NOT NULL UNIQUE,
                title       TEXT NOT NULL,
                background  TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS chapters (
                id          TEXT PRIMARY KEY,
                story_id    TEXT NOT NULL,
                number      INTEGER NOT NULL,
                content     TEXT NOT NULL,
                summary     TEXT,
                author_id   TEXT,
                status      TEXT NOT NULL DEFAULT 'active',
                start_time  TEXT NOT NULL,
                end_time    TEXT,
                word_count  INTEGER NOT NULL DEFAULT 0,
                UNIQUE (story_id, number),
                FOREIGN KEY (story_id) REFERENCES stories(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT PRIMARY KEY,
                room_id         TEXT NOT NULL,
                story_id        TEXT,
                sender_id       TEXT NOT NULL,
                sender_name     TEXT NOT NULL,
                recipient_id    TEXT,
                recipient_name  TEXT,
                kind            TEXT NOT NULL,
                content         TEXT NOT NULL,
                chapter_number  INTEGER,
                client_id       TEXT,
                created_at      TEXT NOT NULL,
                UNIQUE (room_id, client_id),
                FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE,
                FOREIGN KEY (story_id) REFERENCES stories(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS chapter_todos (
                id               TEXT PRIMARY KEY,
                chapter_id       TEXT NOT NULL,
                content          TEXT NOT NULL,
                expected_answer  TEXT,
                priority         INTEGER NOT NULL DEFAULT 3,
                status           TEXT NOT NULL DEFAULT 'pending',
                FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS player_feedback_progress (
                chapter_id       TEXT NOT NULL,
                player_id        TEXT NOT NULL,
                completed_json   TEXT NOT NULL DEFAULT '[]',
                total_todos      INTEGER NOT NULL DEFAULT 0,
                completion_rate  REAL NOT NULL DEFAULT 0,
                timeout_at       TEXT NOT NULL,
                PRIMARY KEY (chapter_id, player_id),
                FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS memories (
                story_id       TEXT PRIMARY KEY,
                snapshot_json  TEXT NOT NULL,
                updated_at     TEXT NOT NULL,
                FOREIGN KEY (story_id) REFERENCES stories(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS interactions (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                story_id       TEXT NOT NULL,
                player_id      TEXT NOT NULL,
                input          TEXT NOT NULL,
                response       TEXT NOT NULL,
                importance     REAL NOT NULL,
                keywords_json  TEXT NOT NULL DEFAULT '[]',
                created_at     TEXT NOT NULL,
                FOREIGN KEY (story_id) REFERENCES stories(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_room ON messages(room_id);
            CREATE INDEX IF NOT EXISTS idx_messages_story ON messages(story_id);
            CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_id);
            CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);
            CREATE INDEX IF NOT EXISTS idx_todos_chapter ON chapter_todos(chapter_id);
            CREATE INDEX IF NOT EXISTS idx_progress_chapter
                ON player_feedback_progress(chapter_id, player_id);",
        )
        .map_err(|e| RepositoryError::Sqlite(e.to_string()))?;
        Ok(())
    }
}

fn sql_err(e: rusqlite::Error) -> RepositoryError {
    RepositoryError::Sqlite(e.to_string())
}

fn ser_err(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Serialization(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(ser_err)
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(s).map_err(ser_err)
}

fn room_status(s: &str) -> Result<RoomStatus, RepositoryError> {
    match s {
        "waiting" => Ok(RoomStatus::Waiting),
        "playing" => Ok(RoomStatus::Playing),
        "paused" => Ok(RoomStatus::Paused),
        "ended" => Ok(RoomStatus::Ended),
        other => Err(ser_err(format!("unknown room status {other:?}"))),
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn insert_chapter_tx(tx: &Transaction<'_>, chapter: &Chapter) -> Result<(), RepositoryError> {
    tx.execute(
        "INSERT INTO chapters
            (id, story_id, number, content, summary, author_id, status,
             start_time, end_time, word_count)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
        params![
            chapter.id.to_string(),
            chapter.story_id.to_string(),
            chapter.number,
            chapter.content,
            chapter.summary,
            chapter.author_id.as_ref().map(|p| p.to_string()),
            chapter_status_str(chapter.status),
            chapter.start_time.to_rfc3339(),
            chapter.end_time.map(|t| t.to_rfc3339()),
            chapter.word_count as i64,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn insert_todos_tx(tx: &Transaction<'_>, todos: &[Todo]) -> Result<(), RepositoryError> {
    for todo in todos {
        tx.execute(
            "INSERT INTO chapter_todos (id, chapter_id, content, expected_answer, priority, status)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                todo.id.to_string(),
                todo.chapter_id.to_string(),
                todo.content,
                todo.expected_answer,
                todo.priority,
                todo_status_str(todo.status),
            ],
        )
        .map_err(sql_err)?;
    }
    Ok(())
}

fn upsert_progress_tx(
    tx: &Transaction<'_>,
    progress: &[PlayerProgress],
) -> Result<(), RepositoryError> {
    for row in progress {
        let completed_json = serde_json::to_string(&row.completed_todo_ids).map_err(ser_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO player_feedback_progress
                (chapter_id, player_id, completed_json, total_todos, completion_rate, timeout_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                row.chapter_id.to_string(),
                row.player_id.to_string(),
                completed_json,
                row.total_todos,
                row.completion_rate as f64,
                row.timeout_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
    }
    Ok(())
}

fn chapter_status_str(status: ChapterStatus) -> &'static str {
    match status {
        ChapterStatus::Active => "active",
        ChapterStatus::Completed => "completed",
    }
}

fn todo_status_str(status: TodoStatus) -> &'static str {
    match status {
        TodoStatus::Pending => "pending",
        TodoStatus::Completed => "completed",
    }
}

type ChapterRow = (
    String,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
    i64,
);

fn chapter_from_row(row: ChapterRow) -> Result<Chapter, RepositoryError> {
    let (id, story_id, number, content, summary, author_id, status, start, end, word_count) = row;
    Ok(Chapter {
        id: ChapterId(parse_uuid(&id)?),
        story_id: StoryId(parse_uuid(&story_id)?),
        number: number as u32,
        content,
        summary,
        author_id: author_id.map(PlayerId),
        status: match status.as_str() {
            "active" => ChapterStatus::Active,
            _ => ChapterStatus::Completed,
        },
        start_time: parse_ts(&start)?,
        end_time: end.as_deref().map(parse_ts).transpose()?,
        word_count: word_count as usize,
    })
}

const CHAPTER_COLUMNS: &str =
    "id, story_id, number, content, summary, author_id, status, start_time, end_time, word_count";

fn read_chapter_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChapterRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

type MessageRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<i64>,
    Option<String>,
    String,
);

const MESSAGE_COLUMNS: &str = "id, room_id, story_id, sender_id, sender_name, recipient_id, \
     recipient_name, kind, content, chapter_number, client_id, created_at";

fn read_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn message_from_row(row: MessageRow) -> Result<Message, RepositoryError> {
    let (
        id,
        room_id,
        story_id,
        sender_id,
        sender_name,
        recipient_id,
        recipient_name,
        kind,
        content,
        chapter_number,
        client_id,
        created_at,
    ) = row;
    let kind = match kind.as_str() {
        "global" => MessageKind::Global,
        "private" => MessageKind::Private,
        "chapter" => MessageKind::Chapter,
        "story_machine" => MessageKind::StoryMachine {
            recipient_id: PlayerId(
                recipient_id.ok_or_else(|| ser_err("story_machine row without recipient"))?,
            ),
        },
        "player_to_player" => MessageKind::PlayerToPlayer {
            recipient_id: PlayerId(
                recipient_id.ok_or_else(|| ser_err("player_to_player row without recipient"))?,
            ),
            recipient_name: recipient_name.unwrap_or_default(),
        },
        other => return Err(ser_err(format!("unknown message kind {other:?}"))),
    };
    Ok(Message {
        id: MessageId(parse_uuid(&id)?),
        room_id: RoomId(parse_uuid(&room_id)?),
        story_id: story_id.as_deref().map(parse_uuid).transpose()?.map(StoryId),
        sender_id: PlayerId(sender_id),
        sender_name,
        content,
        chapter_number: chapter_number.map(|n| n as u32),
        kind,
        client_id,
        created_at: parse_ts(&created_at)?,
    })
}

fn message_recipient(message: &Message) -> (Option<String>, Option<String>) {
    match &message.kind {
        MessageKind::StoryMachine { recipient_id } => (Some(recipient_id.to_string()), None),
        MessageKind::PlayerToPlayer {
            recipient_id,
            recipient_name,
        } => (
            Some(recipient_id.to_string()),
            Some(recipient_name.clone()),
        ),
        _ => (None, None),
    }
}

type ProgressRow = (String, String, String, i64, f64, String);

const PROGRESS_COLUMNS: &str =
    "chapter_id, player_id, completed_json, total_todos, completion_rate, timeout_at";

fn read_progress_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgressRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn progress_from_row(row: ProgressRow) -> Result<PlayerProgress, RepositoryError> {
    let (chapter_id, player_id, completed_json, total, rate, timeout_at) = row;
    Ok(PlayerProgress {
        chapter_id: ChapterId(parse_uuid(&chapter_id)?),
        player_id: PlayerId(player_id),
        completed_todo_ids: serde_json::from_str(&completed_json).map_err(ser_err)?,
        total_todos: total as u32,
        completion_rate: rate as f32,
        timeout_at: parse_ts(&timeout_at)?,
    })
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn upsert_player(&self, player: &Player) -> Result<(), RepositoryError> {
        let stats_json = serde_json::to_string(&player.stats).map_err(ser_err)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO players (id, name, stats_json, last_active, online)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                stats_json = excluded.stats_json,
                last_active = excluded.last_active,
                online = excluded.online",
            params![
                player.id.to_string(),
                player.name,
                stats_json,
                player.last_active.to_rfc3339(),
                player.online as i32,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_player(&self, id: &PlayerId) -> Result<Option<Player>, RepositoryError> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String, String, String, i64)> = conn
            .query_row(
                "SELECT id, name, stats_json, last_active, online FROM players WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;
        row.map(|(id, name, stats_json, last_active, online)| {
            Ok(Player {
                id: PlayerId(id),
                name,
                stats: serde_json::from_str(&stats_json).map_err(ser_err)?,
                last_active: parse_ts(&last_active)?,
                online: online != 0,
            })
        })
        .transpose()
    }

    async fn create_room(&self, room: &Room) -> Result<(), RepositoryError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT INTO rooms (id, name, host_id, status, story_id, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                room.id.to_string(),
                room.name,
                room.host_id.to_string(),
                room.status.to_string(),
                room.story_id.map(|s| s.to_string()),
                room.created_at.to_rfc3339(),
                room.updated_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        replace_members(&tx, room)?;
        tx.commit().map_err(sql_err)
    }

    async fn get_room(&self, id: RoomId) -> Result<Option<Room>, RepositoryError> {
        let conn = self.conn.lock().await;
        load_room(&conn, id)
    }

    async fn update_room(&self, room: &Room) -> Result<(), RepositoryError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        let changed = tx
            .execute(
                "UPDATE rooms SET name=?2, host_id=?3, status=?4, story_id=?5, updated_at=?6
                 WHERE id=?1",
                params![
                    room.id.to_string(),
                    room.name,
                    room.host_id.to_string(),
                    room.status.to_string(),
                    room.story_id.map(|s| s.to_string()),
                    room.updated_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(RepositoryError::NotFound(format!("room {}", room.id)));
        }
        tx.execute(
            "DELETE FROM room_players WHERE room_id = ?1",
            params![room.id.to_string()],
        )
        .map_err(sql_err)?;
        replace_members(&tx, room)?;
        tx.commit().map_err(sql_err)
    }

    async fn delete_room(&self, id: RoomId) -> Result<(), RepositoryError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "DELETE FROM stories WHERE room_id = ?1",
            params![id.to_string()],
        )
        .map_err(sql_err)?;
        tx.execute("DELETE FROM rooms WHERE id = ?1", params![id.to_string()])
            .map_err(sql_err)?;
        tx.commit().map_err(sql_err)
    }

    async fn create_story(
        &self,
        story: &Story,
        first_chapter: &Chapter,
        todos: &[Todo],
        progress: &[PlayerProgress],
    ) -> Result<(), RepositoryError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT INTO stories (id, room_id, title, background, created_at)
             VALUES (?1,?2,?3,?4,?5)",
            params![
                story.id.to_string(),
                story.room_id.to_string(),
                story.title,
                story.background,
                story.created_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        tx.execute(
            "UPDATE rooms SET story_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                story.room_id.to_string(),
                story.id.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        insert_chapter_tx(&tx, first_chapter)?;
        insert_todos_tx(&tx, todos)?;
        upsert_progress_tx(&tx, progress)?;
        tx.commit().map_err(sql_err)
    }

    async fn get_story(&self, id: StoryId) -> Result<Option<Story>, RepositoryError> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String, String, String, String)> = conn
            .query_row(
                "SELECT id, room_id, title, background, created_at FROM stories WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;
        row.map(|(id, room_id, title, background, created_at)| {
            Ok(Story {
                id: StoryId(parse_uuid(&id)?),
                room_id: RoomId(parse_uuid(&room_id)?),
                title,
                background,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    async fn delete_story(&self, id: StoryId) -> Result<(), RepositoryError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "UPDATE rooms SET story_id = NULL
             WHERE story_id = ?1",
            params![id.to_string()],
        )
        .map_err(sql_err)?;
        tx.execute("DELETE FROM stories WHERE id = ?1", params![id.to_string()])
            .map_err(sql_err)?;
        tx.commit().map_err(sql_err)
    }

    async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>, RepositoryError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {CHAPTER_COLUMNS} FROM chapters WHERE id = ?1"),
                params![id.to_string()],
                read_chapter_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(chapter_from_row).transpose()
    }

    async fn active_chapter(&self, story_id: StoryId) -> Result<Option<Chapter>, RepositoryError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {CHAPTER_COLUMNS} FROM chapters
                     WHERE story_id = ?1 AND status = 'active'
                     ORDER BY number DESC LIMIT 1"
                ),
                params![story_id.to_string()],
                read_chapter_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(chapter_from_row).transpose()
    }

    async fn chapters_for_story(
        &self,
        story_id: StoryId,
    ) -> Result<Vec<Chapter>, RepositoryError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHAPTER_COLUMNS} FROM chapters WHERE story_id = ?1 ORDER BY number"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![story_id.to_string()], read_chapter_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        rows.into_iter().map(chapter_from_row).collect()
    }

    async fn update_chapter(&self, chapter: &Chapter) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE chapters SET content=?2, summary=?3, status=?4, end_time=?5, word_count=?6
                 WHERE id=?1",
                params![
                    chapter.id.to_string(),
                    chapter.content,
                    chapter.summary,
                    chapter_status_str(chapter.status),
                    chapter.end_time.map(|t| t.to_rfc3339()),
                    chapter.word_count as i64,
                ],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(RepositoryError::NotFound(format!("chapter {}", chapter.id)));
        }
        Ok(())
    }

    async fn complete_and_activate(
        &self,
        completed: &Chapter,
        next: &Chapter,
        todos: &[Todo],
        progress: &[PlayerProgress],
    ) -> Result<(), RepositoryError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        let active: Option<String> = tx
            .query_row(
                "SELECT id FROM chapters WHERE story_id = ?1 AND status = 'active'",
                params![completed.story_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        match active {
            Some(id) if id == completed.id.to_string() => {}
            other => {
                return Err(RepositoryError::Conflict(format!(
                    "active chapter changed (expected {}, found {:?})",
                    completed.id, other
                )))
            }
        }
        tx.execute(
            "UPDATE chapters SET content=?2, summary=?3, status='completed', end_time=?4,
                    word_count=?5
             WHERE id=?1",
            params![
                completed.id.to_string(),
                completed.content,
                completed.summary,
                completed.end_time.map(|t| t.to_rfc3339()),
                completed.word_count as i64,
            ],
        )
        .map_err(sql_err)?;
        insert_chapter_tx(&tx, next)?;
        insert_todos_tx(&tx, todos)?;
        upsert_progress_tx(&tx, progress)?;
        tx.commit().map_err(sql_err)
    }

    async fn insert_message(&self, message: &Message) -> Result<bool, RepositoryError> {
        let (recipient_id, recipient_name) = message_recipient(message);
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO messages
                (id, room_id, story_id, sender_id, sender_name, recipient_id, recipient_name,
                 kind, content, chapter_number, client_id, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                message.id.to_string(),
                message.room_id.to_string(),
                message.story_id.map(|s| s.to_string()),
                message.sender_id.to_string(),
                message.sender_name,
                recipient_id,
                recipient_name,
                message.kind.type_name(),
                message.content,
                message.chapter_number,
                message.client_id,
                message.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(sql_err(e)),
        }
    }

    async fn messages_for_room(&self, room_id: RoomId) -> Result<Vec<Message>, RepositoryError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ?1 ORDER BY created_at, id"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![room_id.to_string()], read_message_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn all_messages_for_story(
        &self,
        story_id: StoryId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE story_id = ?1 ORDER BY created_at, id"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![story_id.to_string()], read_message_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn recent_global_messages(
        &self,
        story_id: StoryId,
        active_chapter: ChapterId,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let conn = self.conn.lock().await;
        let number: Option<i64> = conn
            .query_row(
                "SELECT number FROM chapters WHERE id = ?1",
                params![active_chapter.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        let Some(number) = number else {
            return Ok(Vec::new());
        };
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE story_id = ?1 AND kind = 'global' AND chapter_number = ?2
                 ORDER BY created_at DESC, id DESC LIMIT ?3"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![story_id.to_string(), number, limit as i64],
                read_message_row,
            )
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        let mut messages = rows
            .into_iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn todos_for_chapter(
        &self,
        chapter_id: ChapterId,
    ) -> Result<Vec<Todo>, RepositoryError> {
        let conn = self.conn.lock().await;
        load_todos(&conn, chapter_id)
    }

    async fn progress_for_chapter(
        &self,
        chapter_id: ChapterId,
    ) -> Result<Vec<PlayerProgress>, RepositoryError> {
        let conn = self.conn.lock().await;
        load_progress(&conn, chapter_id)
    }

    async fn upsert_progress(&self, rows: &[PlayerProgress]) -> Result<(), RepositoryError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        upsert_progress_tx(&tx, rows)?;
        tx.commit().map_err(sql_err)
    }

    async fn apply_feedback(
        &self,
        chapter_id: ChapterId,
        player_id: &PlayerId,
        satisfied: &[TodoId],
    ) -> Result<PlayerProgress, RepositoryError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        for todo_id in satisfied {
            tx.execute(
                "UPDATE chapter_todos SET status = 'completed'
                 WHERE id = ?1 AND chapter_id = ?2",
                params![todo_id.to_string(), chapter_id.to_string()],
            )
            .map_err(sql_err)?;
        }
        let row = tx
            .query_row(
                &format!(
                    "SELECT {PROGRESS_COLUMNS} FROM player_feedback_progress
                     WHERE chapter_id = ?1 AND player_id = ?2"
                ),
                params![chapter_id.to_string(), player_id.to_string()],
                read_progress_row,
            )
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!("progress ({chapter_id}, {player_id})"))
            })?;
        let mut progress = progress_from_row(row)?;
        for todo_id in satisfied {
            progress.record_completed(*todo_id);
        }
        let completed_json =
            serde_json::to_string(&progress.completed_todo_ids).map_err(ser_err)?;
        tx.execute(
            "UPDATE player_feedback_progress
             SET completed_json = ?3, completion_rate = ?4
             WHERE chapter_id = ?1 AND player_id = ?2",
            params![
                chapter_id.to_string(),
                player_id.to_string(),
                completed_json,
                progress.completion_rate as f64,
            ],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        Ok(progress)
    }

    async fn mark_timeout_players_complete(
        &self,
        chapter_id: ChapterId,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlayerProgress>, RepositoryError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        let todos = load_todos(&tx, chapter_id)?;
        let all_ids: Vec<TodoId> = todos.iter().map(|t| t.id).collect();
        tx.execute(
            "UPDATE chapter_todos SET status = 'completed' WHERE chapter_id = ?1",
            params![chapter_id.to_string()],
        )
        .map_err(sql_err)?;

        let rows = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {PROGRESS_COLUMNS} FROM player_feedback_progress
                     WHERE chapter_id = ?1"
                ))
                .map_err(sql_err)?;
            let collected = stmt
                .query_map(params![chapter_id.to_string()], read_progress_row)
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            collected
        };
        let mut updated = Vec::new();
        for row in rows {
            let mut progress = progress_from_row(row)?;
            if progress.timeout_at <= now {
                progress.force_complete(&all_ids);
                let completed_json =
                    serde_json::to_string(&progress.completed_todo_ids).map_err(ser_err)?;
                tx.execute(
                    "UPDATE player_feedback_progress
                     SET completed_json = ?3, completion_rate = ?4
                     WHERE chapter_id = ?1 AND player_id = ?2",
                    params![
                        chapter_id.to_string(),
                        progress.player_id.to_string(),
                        completed_json,
                        progress.completion_rate as f64,
                    ],
                )
                .map_err(sql_err)?;
            }
            updated.push(progress);
        }
        tx.commit().map_err(sql_err)?;
        Ok(updated)
    }

    async fn save_memory(
        &self,
        story_id: StoryId,
        snapshot: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(snapshot).map_err(ser_err)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO memories (story_id, snapshot_json, updated_at)
             VALUES (?1,?2,?3)",
            params![story_id.to_string(), json, Utc::now().to_rfc3339()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn load_memory(
        &self,
        story_id: StoryId,
    ) -> Result<Option<serde_json::Value>, RepositoryError> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM memories WHERE story_id = ?1",
                params![story_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        json.map(|j| serde_json::from_str(&j).map_err(ser_err))
            .transpose()
    }

    async fn insert_interaction(
        &self,
        story_id: StoryId,
        interaction: &Interaction,
    ) -> Result<(), RepositoryError> {
        let keywords = serde_json::to_string(&interaction.keywords).map_err(ser_err)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO interactions
                (story_id, player_id, input, response, importance, keywords_json, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                story_id.to_string(),
                interaction.player_id.to_string(),
                interaction.input,
                interaction.response,
                interaction.importance as f64,
                keywords,
                interaction.timestamp.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().await;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(sql_err)?;
        Ok(())
    }
}

fn replace_members(tx: &Transaction<'_>, room: &Room) -> Result<(), RepositoryError> {
    for (ord, member) in room.players.iter().enumerate() {
        tx.execute(
            "INSERT INTO room_players (room_id, player_id, role, joined_at, ord)
             VALUES (?1,?2,?3,?4,?5)",
            params![
                room.id.to_string(),
                member.player_id.to_string(),
                match member.role {
                    PlayerRole::Host => "host",
                    PlayerRole::Player => "player",
                },
                member.joined_at.to_rfc3339(),
                ord as i64,
            ],
        )
        .map_err(sql_err)?;
    }
    Ok(())
}

fn load_room(conn: &Connection, id: RoomId) -> Result<Option<Room>, RepositoryError> {
    let row: Option<(String, String, String, String, Option<String>, String, String)> = conn
        .query_row(
            "SELECT id, name, host_id, status, story_id, created_at, updated_at
             FROM rooms WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )
        .optional()
        .map_err(sql_err)?;
    let Some((id, name, host_id, status, story_id, created_at, updated_at)) = row else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT player_id, role, joined_at FROM room_players
             WHERE room_id = ?1 ORDER BY ord",
        )
        .map_err(sql_err)?;
    let member_rows: Vec<(String, String, String)> = stmt
        .query_map(params![id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    let mut players = Vec::with_capacity(member_rows.len());
    for (player_id, role, joined_at) in member_rows {
        players.push(PlayerRef {
            player_id: PlayerId(player_id),
            role: if role == "host" {
                PlayerRole::Host
            } else {
                PlayerRole::Player
            },
            joined_at: parse_ts(&joined_at)?,
        });
    }

    Ok(Some(Room {
        id: RoomId(parse_uuid(&id)?),
        name,
        host_id: PlayerId(host_id),
        status: room_status(&status)?,
        players,
        story_id: story_id.as_deref().map(parse_uuid).transpose()?.map(StoryId),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    }))
}

fn load_todos(conn: &Connection, chapter_id: ChapterId) -> Result<Vec<Todo>, RepositoryError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, chapter_id, content, expected_answer, priority, status
             FROM chapter_todos WHERE chapter_id = ?1 ORDER BY priority DESC, id",
        )
        .map_err(sql_err)?;
    let rows: Vec<(String, String, String, Option<String>, i64, String)> = stmt
        .query_map(params![chapter_id.to_string()], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    rows.into_iter()
        .map(|(id, chapter_id, content, expected, priority, status)| {
            Ok(Todo {
                id: TodoId(parse_uuid(&id)?),
                chapter_id: ChapterId(parse_uuid(&chapter_id)?),
                content,
                expected_answer: expected,
                priority: priority as u8,
                status: if status == "completed" {
                    TodoStatus::Completed
                } else {
                    TodoStatus::Pending
                },
            })
        })
        .collect()
}

fn load_progress(
    conn: &Connection,
    chapter_id: ChapterId,
) -> Result<Vec<PlayerProgress>, RepositoryError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM player_feedback_progress WHERE chapter_id = ?1"
        ))
        .map_err(sql_err)?;
    let rows = stmt
        .query_map(params![chapter_id.to_string()], read_progress_row)
        .map_err(sql_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    rows.into_iter().map(progress_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageKind, PlayerStats};

    fn repo() -> SqliteRepository {
        SqliteRepository::open_in_memory().unwrap()
    }

    fn seeded_room() -> Room {
        let mut room = Room::new("Blackwood Manor", PlayerId::from("p1"));
        room.add_player(PlayerId::from("p2"));
        room
    }

    async fn seed_story(repo: &SqliteRepository, room: &Room) -> (Story, Chapter, Vec<Todo>) {
        let story = Story::new(room.id, "The Case", "A manor, a storm, a missing will.");
        let chapter = Chapter::new(story.id, 1, "The guests arrive at dusk.");
        let todos = vec![
            Todo::new(chapter.id, "find the will", Some("in the desk".to_string()), 5),
            Todo::new(chapter.id, "name the heir", None, 3),
            Todo::new(chapter.id, "check the cellar", None, 2),
        ];
        let progress: Vec<PlayerProgress> = room
            .players
            .iter()
            .map(|p| {
                PlayerProgress::new(chapter.id, p.player_id.clone(), todos.len() as u32, Utc::now())
            })
            .collect();
        repo.create_story(&story, &chapter, &todos, &progress)
            .await
            .unwrap();
        (story, chapter, todos)
    }

    #[tokio::test]
    async fn test_player_upsert_roundtrip() {
        let repo = repo();
        let mut player = Player::new(PlayerId::from("p1"), "Alice");
        player.stats = PlayerStats {
            rooms_joined: 2,
            messages_sent: 10,
            chapters_seen: 3,
        };
        repo.upsert_player(&player).await.unwrap();
        player.online = false;
        repo.upsert_player(&player).await.unwrap();

        let loaded = repo.get_player(&PlayerId::from("p1")).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Alice");
        assert_eq!(loaded.stats.messages_sent, 10);
        assert!(!loaded.online);
    }

    #[tokio::test]
    async fn test_room_roundtrip_preserves_member_order() {
        let repo = repo();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();

        let loaded = repo.get_room(room.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Blackwood Manor");
        assert_eq!(loaded.players.len(), 2);
        assert_eq!(loaded.players[0].player_id, PlayerId::from("p1"));
        assert_eq!(loaded.players[0].role, PlayerRole::Host);
        assert_eq!(loaded.players[1].player_id, PlayerId::from("p2"));
    }

    #[tokio::test]
    async fn test_story_creation_links_room_and_seeds_chapter() {
        let repo = repo();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();
        let (story, chapter, todos) = seed_story(&repo, &room).await;

        let loaded_room = repo.get_room(room.id).await.unwrap().unwrap();
        assert_eq!(loaded_room.story_id, Some(story.id));

        let active = repo.active_chapter(story.id).await.unwrap().unwrap();
        assert_eq!(active.id, chapter.id);
        assert_eq!(active.number, 1);

        let loaded_todos = repo.todos_for_chapter(chapter.id).await.unwrap();
        assert_eq!(loaded_todos.len(), todos.len());
        let progress = repo.progress_for_chapter(chapter.id).await.unwrap();
        assert_eq!(progress.len(), 2);
    }

    #[tokio::test]
    async fn test_message_dedupe_on_client_id() {
        let repo = repo();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();

        let message = Message::new(
            room.id,
            PlayerId::from("p1"),
            "Alice",
            "I open the door",
            MessageKind::Global,
        )
        .with_client_id(Some("c-1".to_string()));
        assert!(repo.insert_message(&message).await.unwrap());

        let duplicate = Message::new(
            room.id,
            PlayerId::from("p1"),
            "Alice",
            "I open the door",
            MessageKind::Global,
        )
        .with_client_id(Some("c-1".to_string()));
        assert!(!repo.insert_message(&duplicate).await.unwrap());

        assert_eq!(repo.messages_for_room(room.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_messages_without_client_id_not_deduped() {
        let repo = repo();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();
        for _ in 0..2 {
            let message = Message::new(
                room.id,
                PlayerId::from("p1"),
                "Alice",
                "hello",
                MessageKind::Global,
            );
            assert!(repo.insert_message(&message).await.unwrap());
        }
        assert_eq!(repo.messages_for_room(room.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recent_global_messages_scoped_to_chapter() {
        let repo = repo();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();
        let (story, chapter, _) = seed_story(&repo, &room).await;

        for i in 0..3 {
            let message = Message::new(
                room.id,
                PlayerId::from("p1"),
                "Alice",
                format!("global {i}"),
                MessageKind::Global,
            )
            .with_story(story.id, 1);
            repo.insert_message(&message).await.unwrap();
        }
        let private = Message::new(
            room.id,
            PlayerId::from("p1"),
            "Alice",
            "whisper",
            MessageKind::Private,
        )
        .with_story(story.id, 1);
        repo.insert_message(&private).await.unwrap();

        let recent = repo
            .recent_global_messages(story.id, chapter.id, 2)
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "global 1");
        assert_eq!(recent[1].content, "global 2");

        // the story-wide view keeps every kind
        let all = repo.all_messages_for_story(story.id).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_apply_feedback_idempotent() {
        let repo = repo();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();
        let (_, chapter, todos) = seed_story(&repo, &room).await;
        let player = PlayerId::from("p1");

        let progress = repo
            .apply_feedback(chapter.id, &player, &[todos[0].id])
            .await
            .unwrap();
        assert_eq!(progress.completed_count(), 1);

        // applying the same todo again changes nothing
        let progress = repo
            .apply_feedback(chapter.id, &player, &[todos[0].id])
            .await
            .unwrap();
        assert_eq!(progress.completed_count(), 1);

        let stored = repo.todos_for_chapter(chapter.id).await.unwrap();
        let completed: Vec<_> = stored.iter().filter(|t| t.is_completed()).collect();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_and_activate_cas() {
        let repo = repo();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();
        let (story, chapter, _) = seed_story(&repo, &room).await;

        let mut completed = chapter.clone();
        completed.complete("The night ends.", "chapter one closed".to_string());
        let next = Chapter::new(story.id, 2, "Morning breaks.");
        let todos = vec![Todo::new(next.id, "ask about breakfast", None, 3)];
        let progress = vec![PlayerProgress::new(
            next.id,
            PlayerId::from("p1"),
            1,
            Utc::now(),
        )];
        repo.complete_and_activate(&completed, &next, &todos, &progress)
            .await
            .unwrap();

        let active = repo.active_chapter(story.id).await.unwrap().unwrap();
        assert_eq!(active.number, 2);

        // Replaying the same transition must conflict: chapter 1 is no
        // longer active.
        let next_again = Chapter::new(story.id, 3, "Never happens.");
        let err = repo
            .complete_and_activate(&completed, &next_again, &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let chapters = repo.chapters_for_story(story.id).await.unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].status, ChapterStatus::Completed);
    }

    #[tokio::test]
    async fn test_timeout_force_completes_expired_rows() {
        let repo = repo();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();
        let (_, chapter, todos) = seed_story(&repo, &room).await;

        let now = Utc::now() + chrono::Duration::seconds(1);
        let rows = repo
            .mark_timeout_players_complete(chapter.id, now)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.completed_count() as usize, todos.len());
            assert!((row.completion_rate - 1.0).abs() < f32::EPSILON);
        }
        let stored = repo.todos_for_chapter(chapter.id).await.unwrap();
        assert!(stored.iter().all(|t| t.is_completed()));
    }

    #[tokio::test]
    async fn test_room_deletion_cascades() {
        let repo = repo();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();
        let (story, chapter, _) = seed_story(&repo, &room).await;
        let message = Message::new(
            room.id,
            PlayerId::from("p1"),
            "Alice",
            "hello",
            MessageKind::Global,
        )
        .with_story(story.id, 1);
        repo.insert_message(&message).await.unwrap();
        repo.save_memory(story.id, &serde_json::json!({"k": 1}))
            .await
            .unwrap();

        repo.delete_room(room.id).await.unwrap();
        assert!(repo.get_room(room.id).await.unwrap().is_none());
        assert!(repo.get_story(story.id).await.unwrap().is_none());
        assert!(repo.get_chapter(chapter.id).await.unwrap().is_none());
        assert!(repo.todos_for_chapter(chapter.id).await.unwrap().is_empty());
        assert!(repo
            .progress_for_chapter(chapter.id)
            .await
            .unwrap()
            .is_empty());
        assert!(repo.messages_for_room(room.id).await.unwrap().is_empty());
        assert!(repo.load_memory(story.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_snapshot_roundtrip() {
        let repo = repo();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();
        let (story, _, _) = seed_story(&repo, &room).await;

        let snapshot = serde_json::json!({"short_term": [], "version": 1});
        repo.save_memory(story.id, &snapshot).await.unwrap();
        let loaded = repo.load_memory(story.id).await.unwrap().unwrap();
        assert_eq!(loaded["version"], 1);
    }

    #[tokio::test]
    async fn test_on_disk_open_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storyhost.db");
        let repo = SqliteRepository::open(&path).unwrap();
        let room = seeded_room();
        repo.create_room(&room).await.unwrap();
        repo.checkpoint().await.unwrap();

        drop(repo);
        let reopened = SqliteRepository::open(&path).unwrap();
        assert!(reopened.get_room(room.id).await.unwrap().is_some());
    }
}
