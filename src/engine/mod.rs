//! Room engine
//!
//! The central coordinator: validates inbound commands, routes each one to
//! its room's mailbox task, and owns the registry of live rooms. Rooms not
//! currently resident (after a process restart) are rehydrated from the
//! repository on first touch.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::bus::EventBus;
use crate::chapter::ChapterManager;
use crate::config::Config;
use crate::feedback::FeedbackEvaluator;
use crate::memory::StoryMemory;
use crate::queue::RequestQueue;
use crate::repository::Repository;
use crate::types::{
    Chapter, EngineError, EngineResult, Message, Player, PlayerId, Room, RoomId, RoomStatus,
};

mod dispatch;
mod room;
mod timers;

pub use room::InboundMessageType;
use room::{RoomCommand, RoomTask, StoryState};

/// Response of `send_message`: the persisted message, the chapter when AI
/// content was appended, and the room snapshot.
#[derive(Debug, Clone)]
pub struct SendMessageResponse {
    pub message: Message,
    pub chapter: Option<Chapter>,
    pub room: Room,
}

/// Inbound `send_message` payload.
#[derive(Debug, Clone, Default)]
pub struct SendMessageRequest {
    pub message: String,
    pub message_type: String,
    pub recipient_id: Option<String>,
    pub recipient_name: Option<String>,
    /// Client correlation id for duplicate suppression.
    pub client_message_id: Option<String>,
}

/// Shared services injected into every room task. Tests substitute fakes by
/// constructing the engine with their own implementations.
pub(crate) struct Services {
    pub repository: Arc<dyn Repository>,
    pub queue: RequestQueue,
    pub bus: Arc<dyn EventBus>,
    pub config: Arc<Config>,
    pub chapters: ChapterManager,
    pub evaluator: FeedbackEvaluator,
}

struct RoomHandle {
    tx: mpsc::UnboundedSender<RoomCommand>,
}

/// The multi-room coordination engine.
pub struct RoomEngine {
    services: Arc<Services>,
    rooms: Arc<DashMap<RoomId, RoomHandle>>,
}

impl RoomEngine {
    pub fn new(
        repository: Arc<dyn Repository>,
        queue: RequestQueue,
        bus: Arc<dyn EventBus>,
        config: Arc<Config>,
    ) -> Self {
        let chapters = ChapterManager::new(
            queue.clone(),
            config.chapter.clone(),
            config.memory.clone(),
        );
        let evaluator = FeedbackEvaluator::new(queue.clone(), repository.clone());
        Self {
            services: Arc::new(Services {
                repository,
                queue,
                bus,
                config,
                chapters,
                evaluator,
            }),
            rooms: Arc::new(DashMap::new()),
        }
    }

    /// Number of resident room tasks.
    pub fn resident_rooms(&self) -> usize {
        self.rooms.len()
    }

    // ── Commands ────────────────────────────────────────────────────

    pub async fn create_room(
        &self,
        name: &str,
        player_id: &str,
        username: &str,
    ) -> EngineResult<Room> {
        if name.trim().is_empty() || player_id.is_empty() || username.is_empty() {
            return Err(EngineError::MissingParameters(
                "name, playerId and username are required".to_string(),
            ));
        }
        let max = self.services.config.engine.max_room_name_len;
        if name.chars().count() > max {
            return Err(EngineError::InvalidInput(format!(
                "room name exceeds {max} characters"
            )));
        }

        let player_id = PlayerId::from(player_id);
        let mut player = self
            .services
            .repository
            .get_player(&player_id)
            .await?
            .unwrap_or_else(|| Player::new(player_id.clone(), username));
        player.name = username.to_string();
        player.online = true;
        player.stats.rooms_joined += 1;
        self.services.repository.upsert_player(&player).await?;

        let room = Room::new(name.trim(), player_id.clone());
        self.services.repository.create_room(&room).await?;

        let mut names = HashMap::new();
        names.insert(player_id, username.to_string());
        self.spawn_room(room.clone(), None, names);
        tracing::info!(room = %room.id, name = %room.name, "room created");
        Ok(room)
    }

    pub async fn join_room(
        &self,
        room_id: RoomId,
        player_id: &str,
        username: &str,
    ) -> EngineResult<Room> {
        if player_id.is_empty() || username.is_empty() {
            return Err(EngineError::MissingParameters(
                "playerId and username are required".to_string(),
            ));
        }
        self.send_command(room_id, |respond| RoomCommand::Join {
            player_id: PlayerId::from(player_id),
            username: username.to_string(),
            respond,
        })
        .await
    }

    pub async fn leave_room(&self, room_id: RoomId, player_id: &str) -> EngineResult<Room> {
        self.send_command(room_id, |respond| RoomCommand::Leave {
            player_id: PlayerId::from(player_id),
            respond,
        })
        .await
    }

    pub async fn initialize_story(
        &self,
        room_id: RoomId,
        player_id: &str,
        title: &str,
        background: &str,
    ) -> EngineResult<Room> {
        if title.trim().is_empty() || background.trim().is_empty() {
            return Err(EngineError::MissingParameters(
                "title and background are required".to_string(),
            ));
        }
        self.send_command(room_id, |respond| RoomCommand::InitializeStory {
            player_id: PlayerId::from(player_id),
            title: title.trim().to_string(),
            background: background.trim().to_string(),
            respond,
        })
        .await
    }

    pub async fn send_message(
        &self,
        room_id: RoomId,
        player_id: &str,
        request: SendMessageRequest,
    ) -> EngineResult<SendMessageResponse> {
        if request.message.is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        let max = self.services.config.engine.max_message_len;
        let len = request.message.chars().count();
        if len > max {
            return Err(EngineError::MessageTooLong { len, max });
        }
        let message_type = InboundMessageType::parse(&request.message_type)
            .ok_or_else(|| EngineError::InvalidMessageType(request.message_type.clone()))?;
        if message_type == InboundMessageType::PlayerToPlayer && request.recipient_id.is_none() {
            return Err(EngineError::MissingRecipient);
        }

        self.send_command(room_id, |respond| RoomCommand::SendMessage {
            player_id: PlayerId::from(player_id),
            content: request.message,
            message_type,
            recipient_id: request.recipient_id.map(PlayerId::from),
            recipient_name: request.recipient_name,
            client_id: request.client_message_id,
            respond,
        })
        .await
    }

    pub async fn get_messages(
        &self,
        room_id: RoomId,
        player_id: &str,
    ) -> EngineResult<Vec<Message>> {
        let player_id = PlayerId::from(player_id);
        if self.rooms.contains_key(&room_id) {
            return self
                .send_command(room_id, |respond| RoomCommand::GetMessages {
                    player_id: player_id.clone(),
                    respond,
                })
                .await;
        }
        // Ended or non-resident rooms answer straight from history.
        let room = self
            .services
            .repository
            .get_room(room_id)
            .await?
            .ok_or(EngineError::RoomNotFound(room_id))?;
        if !room.is_member(&player_id) {
            return Err(EngineError::NotInRoom);
        }
        let messages = self.services.repository.messages_for_room(room_id).await?;
        Ok(messages
            .into_iter()
            .filter(|m| m.visible_to(&player_id))
            .collect())
    }

    pub async fn get_room_status(&self, room_id: RoomId) -> EngineResult<Room> {
        if self.rooms.contains_key(&room_id) {
            return self
                .send_command(room_id, |respond| RoomCommand::GetStatus { respond })
                .await;
        }
        self.services
            .repository
            .get_room(room_id)
            .await?
            .ok_or(EngineError::RoomNotFound(room_id))
    }

    pub async fn pause_room(&self, room_id: RoomId, player_id: &str) -> EngineResult<Room> {
        self.send_command(room_id, |respond| RoomCommand::Pause {
            player_id: PlayerId::from(player_id),
            respond,
        })
        .await
    }

    pub async fn resume_room(&self, room_id: RoomId, player_id: &str) -> EngineResult<Room> {
        self.send_command(room_id, |respond| RoomCommand::Resume {
            player_id: PlayerId::from(player_id),
            respond,
        })
        .await
    }

    pub async fn end_room(&self, room_id: RoomId, player_id: &str) -> EngineResult<Room> {
        self.send_command(room_id, |respond| RoomCommand::End {
            player_id: PlayerId::from(player_id),
            respond,
        })
        .await
    }

    /// Stop every room task. Outstanding work is cancelled; no further
    /// mutations are written.
    pub async fn shutdown(&self) {
        let ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.rooms.remove(&id) {
                let _ = handle.tx.send(RoomCommand::Shutdown);
            }
        }
        tracing::info!("room engine shut down");
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn send_command<T>(
        &self,
        room_id: RoomId,
        make: impl FnOnce(oneshot::Sender<EngineResult<T>>) -> RoomCommand,
    ) -> EngineResult<T> {
        let tx = self.room_sender(room_id).await?;
        let (respond, rx) = oneshot::channel();
        tx.send(make(respond))
            .map_err(|_| EngineError::RoomNotFound(room_id))?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }

    async fn room_sender(
        &self,
        room_id: RoomId,
    ) -> EngineResult<mpsc::UnboundedSender<RoomCommand>> {
        if let Some(handle) = self.rooms.get(&room_id) {
            return Ok(handle.tx.clone());
        }
        self.rehydrate(room_id).await
    }

    /// Bring a persisted room back as a live task.
    async fn rehydrate(
        &self,
        room_id: RoomId,
    ) -> EngineResult<mpsc::UnboundedSender<RoomCommand>> {
        let room = self
            .services
            .repository
            .get_room(room_id)
            .await?
            .ok_or(EngineError::RoomNotFound(room_id))?;
        if room.status == RoomStatus::Ended {
            return Err(EngineError::RoomNotFound(room_id));
        }

        let mut names = HashMap::new();
        for member in &room.players {
            if let Some(player) = self
                .services
                .repository
                .get_player(&member.player_id)
                .await?
            {
                names.insert(member.player_id.clone(), player.name);
            }
        }

        let story = match room.story_id {
            Some(story_id) => {
                let story = self
                    .services
                    .repository
                    .get_story(story_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Internal(format!("room references missing story {story_id}"))
                    })?;
                let active = self
                    .services
                    .repository
                    .active_chapter(story_id)
                    .await?
                    .ok_or(EngineError::NoActiveChapter)?;
                let todos = self.services.repository.todos_for_chapter(active.id).await?;
                let progress = self
                    .services
                    .repository
                    .progress_for_chapter(active.id)
                    .await?;
                let memory = match self.services.repository.load_memory(story_id).await? {
                    Some(snapshot) => {
                        StoryMemory::restore(&self.services.config.memory, &snapshot)
                            .unwrap_or_else(|| StoryMemory::new(&self.services.config.memory))
                    }
                    None => StoryMemory::new(&self.services.config.memory),
                };
                let mut state = StoryState::new(story, active, todos, progress, memory);
                for chapter in self
                    .services
                    .repository
                    .chapters_for_story(story_id)
                    .await?
                {
                    state.history.record(chapter);
                }
                Some(state)
            }
            None => None,
        };

        tracing::info!(room = %room_id, "rehydrating room from repository");
        Ok(self.spawn_room(room, story, names))
    }

    fn spawn_room(
        &self,
        room: Room,
        story: Option<StoryState>,
        names: HashMap<PlayerId, String>,
    ) -> mpsc::UnboundedSender<RoomCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let room_id = room.id;
        let task = RoomTask::new(room, story, names, self.services.clone(), tx.clone());
        self.rooms.insert(room_id, RoomHandle { tx: tx.clone() });

        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            let final_room = task.run(rx).await;
            rooms.remove(&room_id);
            tracing::debug!(room = %room_id, status = %final_room.status, "room task retired");
        });
        tx
    }
}
