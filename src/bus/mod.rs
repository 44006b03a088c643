//! Typed egress bus
//!
//! The engine pushes events through an abstract bus; the transport layer
//! registers per-player session channels against [`SessionBus`]. Delivery is
//! best-effort and in-order per scope; reconnecting clients replay history
//! through the repository instead.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::{Chapter, ChapterId, Message, PlayerId, PlayerProgress, Room, RoomId, StoryId};

/// Delivery scope for one emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every member of the room.
    Room(RoomId),
    /// One player within a room.
    Player(RoomId, PlayerId),
    /// Every member except one.
    RoomExcept(RoomId, PlayerId),
}

/// Events pushed to connected sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    RoomUpdated {
        room: Room,
    },
    NewMessage {
        message: Message,
    },
    NewChapter {
        chapter: Chapter,
    },
    StoryInitialized {
        room_id: RoomId,
        story_id: StoryId,
    },
    StoryMachineInit {
        player_id: PlayerId,
        chapter_number: u32,
        opening: String,
        total_todos: u32,
    },
    FeedbackProgressUpdate {
        chapter_id: ChapterId,
        rows: Vec<PlayerProgress>,
    },
    ChapterReady {
        chapter_number: u32,
    },
    PlayerLeft {
        player_id: PlayerId,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_event: Option<String>,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::RoomUpdated { .. } => "room_updated",
            EngineEvent::NewMessage { .. } => "new_message",
            EngineEvent::NewChapter { .. } => "new_chapter",
            EngineEvent::StoryInitialized { .. } => "story_initialized",
            EngineEvent::StoryMachineInit { .. } => "story_machine_init",
            EngineEvent::FeedbackProgressUpdate { .. } => "feedback_progress_update",
            EngineEvent::ChapterReady { .. } => "chapter_ready",
            EngineEvent::PlayerLeft { .. } => "player_left",
            EngineEvent::Error { .. } => "error",
        }
    }
}

/// Abstract publish surface the engine talks to.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, scope: Scope, event: EngineEvent);
}

/// Default bus: one unbounded channel per connected (room, player) session.
#[derive(Default)]
pub struct SessionBus {
    sessions: DashMap<(RoomId, PlayerId), mpsc::UnboundedSender<EngineEvent>>,
}

impl SessionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session and receive its event stream.
    pub fn register(
        &self,
        room_id: RoomId,
        player_id: PlayerId,
    ) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert((room_id, player_id), tx);
        rx
    }

    /// Detach a session.
    pub fn unregister(&self, room_id: RoomId, player_id: &PlayerId) {
        self.sessions.remove(&(room_id, player_id.clone()));
    }

    fn send_to(&self, key: &(RoomId, PlayerId), event: &EngineEvent) {
        if let Some(entry) = self.sessions.get(key) {
            if entry.send(event.clone()).is_err() {
                tracing::debug!(room = %key.0, player = %key.1, "dropping dead session");
                drop(entry);
                self.sessions.remove(key);
            }
        }
    }
}

#[async_trait]
impl EventBus for SessionBus {
    async fn emit(&self, scope: Scope, event: EngineEvent) {
        match scope {
            Scope::Room(room_id) => {
                let keys: Vec<(RoomId, PlayerId)> = self
                    .sessions
                    .iter()
                    .map(|e| e.key().clone())
                    .filter(|(r, _)| *r == room_id)
                    .collect();
                for key in keys {
                    self.send_to(&key, &event);
                }
            }
            Scope::Player(room_id, player_id) => {
                self.send_to(&(room_id, player_id), &event);
            }
            Scope::RoomExcept(room_id, excluded) => {
                let keys: Vec<(RoomId, PlayerId)> = self
                    .sessions
                    .iter()
                    .map(|e| e.key().clone())
                    .filter(|(r, p)| *r == room_id && *p != excluded)
                    .collect();
                for key in keys {
                    self.send_to(&key, &event);
                }
            }
        }
    }
}

/// Test bus that records every emission in order.
#[derive(Default)]
pub struct RecordingBus {
    events: parking_lot::Mutex<Vec<(Scope, EngineEvent)>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All emissions so far, oldest first.
    pub fn events(&self) -> Vec<(Scope, EngineEvent)> {
        self.events.lock().clone()
    }

    /// Event names only, for order assertions.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|(_, e)| e.name()).collect()
    }

    /// Drop recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn emit(&self, scope: Scope, event: EngineEvent) {
        self.events.lock().push((scope, event));
    }
}
