//! Per-room mailbox task
//!
//! All mutations for a room (inbound commands, timer callbacks, and LLM
//! continuations) arrive as [`RoomCommand`] values on one FIFO mailbox, so
//! the room is logically single-writer. Handlers never await a provider call
//! while holding the mailbox: they snapshot state, spawn the provider work,
//! and the continuation re-enters through an `Apply*` command. Conflicts are
//! resolved by compare-and-set on the observed active chapter id.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::dispatch::{self, TriggerCounters};
use super::timers::{self, TimerHandle};
use super::{SendMessageResponse, Services};
use crate::bus::{EngineEvent, Scope};
use crate::chapter::{ChapterHistory, ChapterManager, ChapterTransition, TriggerObservations};
use crate::memory::{RetrievalLimits, StoryMemory};
use crate::provider::{ChatMessage, ChatOptions};
use crate::types::{
    Chapter, ChapterId, EngineError, EngineResult, Message, MessageKind, Player, PlayerId,
    PlayerProgress, Room, RoomStatus, Story, Todo, TodoId,
};

type Responder<T> = oneshot::Sender<EngineResult<T>>;

/// Inbound message types accepted by `send_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundMessageType {
    Global,
    Private,
    PlayerToPlayer,
}

impl InboundMessageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Self::Global),
            "private" => Some(Self::Private),
            "player_to_player" => Some(Self::PlayerToPlayer),
            _ => None,
        }
    }
}

/// Everything a successful story initialization produced off-mailbox.
pub(crate) struct StoryInitOutcome {
    pub story: Story,
    pub chapter: Chapter,
    pub todos: Vec<Todo>,
    pub progress: Vec<PlayerProgress>,
}

/// Result of the private-message pipeline.
pub(crate) struct PrivateOutcome {
    pub progress: PlayerProgress,
    pub satisfied: Vec<TodoId>,
    pub reply: Message,
}

/// A generated transition, persisted and ready to apply.
pub(crate) struct TransitionApplied {
    pub transition: ChapterTransition,
    pub memory: StoryMemory,
    pub progress: Vec<PlayerProgress>,
}

/// Commands delivered onto the room mailbox.
pub(crate) enum RoomCommand {
    Join {
        player_id: PlayerId,
        username: String,
        respond: Responder<Room>,
    },
    Leave {
        player_id: PlayerId,
        respond: Responder<Room>,
    },
    InitializeStory {
        player_id: PlayerId,
        title: String,
        background: String,
        respond: Responder<Room>,
    },
    ApplyStoryInit {
        result: Result<StoryInitOutcome, EngineError>,
        respond: Responder<Room>,
    },
    SendMessage {
        player_id: PlayerId,
        content: String,
        message_type: InboundMessageType,
        recipient_id: Option<PlayerId>,
        recipient_name: Option<String>,
        client_id: Option<String>,
        respond: Responder<SendMessageResponse>,
    },
    ApplyGlobalAppend {
        observed: ChapterId,
        generated: Result<String, EngineError>,
        message: Message,
        respond: Responder<SendMessageResponse>,
    },
    ApplyPrivateOutcome {
        observed: ChapterId,
        player_id: PlayerId,
        message: Option<Message>,
        outcome: Result<PrivateOutcome, EngineError>,
        respond: Responder<SendMessageResponse>,
    },
    FeedbackTimeout {
        chapter_id: ChapterId,
    },
    ApplyTransition {
        observed: ChapterId,
        result: Result<TransitionApplied, EngineError>,
    },
    Pause {
        player_id: PlayerId,
        respond: Responder<Room>,
    },
    Resume {
        player_id: PlayerId,
        respond: Responder<Room>,
    },
    End {
        player_id: PlayerId,
        respond: Responder<Room>,
    },
    GcExpired,
    GetStatus {
        respond: Responder<Room>,
    },
    GetMessages {
        player_id: PlayerId,
        respond: Responder<Vec<Message>>,
    },
    Shutdown,
}

/// Story-scoped state owned by the room task.
pub(crate) struct StoryState {
    pub story: Story,
    pub active: Chapter,
    pub todos: Vec<Todo>,
    pub progress: HashMap<PlayerId, PlayerProgress>,
    pub memory: StoryMemory,
    pub history: ChapterHistory,
    pub global_messages_this_chapter: u32,
    pub messages_since_ai_output: u32,
    pub chapter_key_events: usize,
    pub last_ai_output: chrono::DateTime<Utc>,
    pub last_player_activity: chrono::DateTime<Utc>,
}

impl StoryState {
    pub(crate) fn new(
        story: Story,
        active: Chapter,
        todos: Vec<Todo>,
        progress: Vec<PlayerProgress>,
        memory: StoryMemory,
    ) -> Self {
        let mut history = ChapterHistory::new();
        history.record(active.clone());
        let now = Utc::now();
        Self {
            story,
            active,
            todos,
            progress: progress
                .into_iter()
                .map(|row| (row.player_id.clone(), row))
                .collect(),
            memory,
            history,
            global_messages_this_chapter: 0,
            messages_since_ai_output: 0,
            chapter_key_events: 0,
            last_ai_output: now,
            last_player_activity: now,
        }
    }

    fn reset_chapter_counters(&mut self) {
        self.global_messages_this_chapter = 0;
        self.messages_since_ai_output = 0;
        self.chapter_key_events = 0;
        self.last_ai_output = Utc::now();
        self.last_player_activity = Utc::now();
    }

    fn progress_rows(&self) -> Vec<PlayerProgress> {
        let mut rows: Vec<PlayerProgress> = self.progress.values().cloned().collect();
        rows.sort_by(|a, b| a.player_id.0.cmp(&b.player_id.0));
        rows
    }
}

/// The room actor. Owns the room entity and its story state.
pub(crate) struct RoomTask {
    room: Room,
    story: Option<StoryState>,
    services: Arc<Services>,
    tx: mpsc::UnboundedSender<RoomCommand>,
    names: HashMap<PlayerId, String>,
    seen_client_ids: HashSet<String>,
    feedback_timer: Option<TimerHandle>,
    gc_timer: Option<TimerHandle>,
    init_in_progress: bool,
    generating: bool,
    transitioning: bool,
}

impl RoomTask {
    pub(crate) fn new(
        room: Room,
        story: Option<StoryState>,
        names: HashMap<PlayerId, String>,
        services: Arc<Services>,
        tx: mpsc::UnboundedSender<RoomCommand>,
    ) -> Self {
        Self {
            room,
            story,
            services,
            tx,
            names,
            seen_client_ids: HashSet::new(),
            feedback_timer: None,
            gc_timer: None,
            init_in_progress: false,
            generating: false,
            transitioning: false,
        }
    }

    /// Drive the mailbox until shutdown or room retirement.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) -> Room {
        self.rearm_feedback_timer();
        while let Some(command) = rx.recv().await {
            if self.apply(command).await {
                break;
            }
        }
        rx.close();
        // Drain without applying further mutations.
        while let Ok(command) = rx.try_recv() {
            reject(command);
        }
        self.room
    }

    /// Apply one command. Returns true when the task should retire.
    async fn apply(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Join {
                player_id,
                username,
                respond,
            } => {
                let _ = respond.send(self.handle_join(player_id, username).await);
            }
            RoomCommand::Leave { player_id, respond } => {
                let _ = respond.send(self.handle_leave(player_id).await);
            }
            RoomCommand::InitializeStory {
                player_id,
                title,
                background,
                respond,
            } => self.handle_initialize_story(player_id, title, background, respond),
            RoomCommand::ApplyStoryInit { result, respond } => {
                let _ = respond.send(self.apply_story_init(result).await);
            }
            RoomCommand::SendMessage {
                player_id,
                content,
                message_type,
                recipient_id,
                recipient_name,
                client_id,
                respond,
            } => {
                self.handle_send_message(
                    player_id,
                    content,
                    message_type,
                    recipient_id,
                    recipient_name,
                    client_id,
                    respond,
                )
                .await
            }
            RoomCommand::ApplyGlobalAppend {
                observed,
                generated,
                message,
                respond,
            } => {
                let _ = respond.send(self.apply_global_append(observed, generated, message).await);
            }
            RoomCommand::ApplyPrivateOutcome {
                observed,
                player_id,
                message,
                outcome,
                respond,
            } => {
                let _ = respond.send(
                    self.apply_private_outcome(observed, player_id, message, outcome)
                        .await,
                );
            }
            RoomCommand::FeedbackTimeout { chapter_id } => {
                self.handle_feedback_timeout(chapter_id).await;
            }
            RoomCommand::ApplyTransition { observed, result } => {
                self.apply_transition(observed, result).await;
            }
            RoomCommand::Pause { player_id, respond } => {
                let _ = respond.send(
                    self.handle_status_change(player_id, RoomStatus::Paused, RoomStatus::Playing)
                        .await,
                );
            }
            RoomCommand::Resume { player_id, respond } => {
                let _ = respond.send(
                    self.handle_status_change(player_id, RoomStatus::Playing, RoomStatus::Paused)
                        .await,
                );
            }
            RoomCommand::End { player_id, respond } => {
                let result = self.handle_end(player_id).await;
                let retire = result.is_ok();
                let _ = respond.send(result);
                return retire;
            }
            RoomCommand::GcExpired => {
                if self.handle_gc_expired().await {
                    return true;
                }
            }
            RoomCommand::GetStatus { respond } => {
                let _ = respond.send(Ok(self.room.clone()));
            }
            RoomCommand::GetMessages { player_id, respond } => {
                let _ = respond.send(self.handle_get_messages(player_id).await);
            }
            RoomCommand::Shutdown => {
                self.cancel_timers();
                return true;
            }
        }
        false
    }

    // ── Membership ──────────────────────────────────────────────────

    async fn handle_join(&mut self, player_id: PlayerId, username: String) -> EngineResult<Room> {
        if self.room.status == RoomStatus::Ended {
            return Err(EngineError::RoomNotFound(self.room.id));
        }
        if let Some(timer) = self.gc_timer.take() {
            timer.cancel();
        }
        self.names.insert(player_id.clone(), username.clone());

        let mut player = self
            .services
            .repository
            .get_player(&player_id)
            .await?
            .unwrap_or_else(|| Player::new(player_id.clone(), username.clone()));
        player.name = username;
        player.online = true;
        player.last_active = Utc::now();

        if self.room.add_player(player_id.clone()) {
            player.stats.rooms_joined += 1;
            self.services.repository.upsert_player(&player).await?;
            self.services.repository.update_room(&self.room).await?;

            // Late joiners still owe feedback for the active chapter.
            if let Some(story) = &mut self.story {
                if !story.progress.contains_key(&player_id) {
                    let timeout_at = Utc::now()
                        + chrono::Duration::from_std(self.services.config.engine.feedback_timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(600));
                    let row = PlayerProgress::new(
                        story.active.id,
                        player_id.clone(),
                        story.todos.len() as u32,
                        timeout_at,
                    );
                    self.services
                        .repository
                        .upsert_progress(&[row.clone()])
                        .await?;
                    story.progress.insert(player_id.clone(), row);
                }
            }

            self.emit(
                Scope::Room(self.room.id),
                EngineEvent::RoomUpdated {
                    room: self.room.clone(),
                },
            )
            .await;
            if let Some(story) = &self.story {
                let opening = ChapterManager::opening_message(
                    self.display_name(&player_id),
                    &story.active,
                    &story.todos,
                );
                self.emit(
                    Scope::Player(self.room.id, player_id.clone()),
                    EngineEvent::StoryMachineInit {
                        player_id: player_id.clone(),
                        chapter_number: story.active.number,
                        opening,
                        total_todos: story.todos.len() as u32,
                    },
                )
                .await;
            }
        } else {
            self.services.repository.upsert_player(&player).await?;
        }
        Ok(self.room.clone())
    }

    async fn handle_leave(&mut self, player_id: PlayerId) -> EngineResult<Room> {
        if !self.room.is_member(&player_id) {
            return Err(EngineError::NotInRoom);
        }
        self.room.remove_player(&player_id);
        self.services.repository.update_room(&self.room).await?;

        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::PlayerLeft {
                player_id: player_id.clone(),
            },
        )
        .await;
        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::RoomUpdated {
                room: self.room.clone(),
            },
        )
        .await;

        if self.room.is_empty() {
            let grace = self.services.config.engine.empty_room_grace_period;
            tracing::info!(room = %self.room.id, ?grace, "room empty, scheduling deletion");
            self.gc_timer = Some(timers::schedule(
                self.tx.clone(),
                grace,
                RoomCommand::GcExpired,
            ));
        }
        Ok(self.room.clone())
    }

    async fn handle_gc_expired(&mut self) -> bool {
        if !self.room.is_empty() {
            return false;
        }
        tracing::info!(room = %self.room.id, "empty-room grace expired, deleting room");
        self.cancel_timers();
        self.room.status = RoomStatus::Ended;
        if let Err(error) = self.services.repository.delete_room(self.room.id).await {
            tracing::error!(room = %self.room.id, %error, "room deletion failed");
        }
        true
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    fn handle_initialize_story(
        &mut self,
        player_id: PlayerId,
        title: String,
        background: String,
        respond: Responder<Room>,
    ) {
        if !self.room.is_member(&player_id) {
            let _ = respond.send(Err(EngineError::NotInRoom));
            return;
        }
        if !self.room.is_host(&player_id) {
            let _ = respond.send(Err(EngineError::PermissionDenied(
                "only the host may initialize the story".to_string(),
            )));
            return;
        }
        if self.story.is_some() || self.room.story_id.is_some() {
            let _ = respond.send(Err(EngineError::InvalidInput(
                "story already initialized".to_string(),
            )));
            return;
        }
        if self.init_in_progress {
            let _ = respond.send(Err(EngineError::InvalidInput(
                "story initialization already in progress".to_string(),
            )));
            return;
        }
        self.init_in_progress = true;

        let story = Story::new(self.room.id, title, background);
        let members: Vec<PlayerId> = self
            .room
            .players
            .iter()
            .map(|p| p.player_id.clone())
            .collect();
        let services = self.services.clone();
        let tx = self.tx.clone();
        let feedback_timeout = self.services.config.engine.feedback_timeout;

        tokio::spawn(async move {
            let result = async {
                let chapter = services.chapters.generate_first(&story).await?;
                let todos = services.chapters.generate_todos(&chapter).await;
                let timeout_at = Utc::now()
                    + chrono::Duration::from_std(feedback_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(600));
                let progress: Vec<PlayerProgress> = members
                    .iter()
                    .map(|p| {
                        PlayerProgress::new(chapter.id, p.clone(), todos.len() as u32, timeout_at)
                    })
                    .collect();
                services
                    .repository
                    .create_story(&story, &chapter, &todos, &progress)
                    .await?;
                Ok(StoryInitOutcome {
                    story,
                    chapter,
                    todos,
                    progress,
                })
            }
            .await;
            let _ = tx.send(RoomCommand::ApplyStoryInit { result, respond });
        });
    }

    async fn apply_story_init(
        &mut self,
        result: Result<StoryInitOutcome, EngineError>,
    ) -> EngineResult<Room> {
        self.init_in_progress = false;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                // Nothing was persisted; the room stays in Waiting.
                tracing::warn!(room = %self.room.id, %error, "story initialization failed");
                return Err(error);
            }
        };

        let story_id = outcome.story.id;
        self.room.story_id = Some(story_id);
        self.room.status = RoomStatus::Playing;
        self.services.repository.update_room(&self.room).await?;

        let memory = StoryMemory::new(&self.services.config.memory);
        let state = StoryState::new(
            outcome.story,
            outcome.chapter,
            outcome.todos,
            outcome.progress,
            memory,
        );
        self.story = Some(state);
        self.bump_chapters_seen().await;

        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::StoryInitialized {
                room_id: self.room.id,
                story_id,
            },
        )
        .await;
        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::RoomUpdated {
                room: self.room.clone(),
            },
        )
        .await;
        self.announce_active_chapter().await?;

        tracing::info!(room = %self.room.id, "story initialized, chapter 1 active");
        Ok(self.room.clone())
    }

    /// Broadcast the active chapter plus the per-player story-machine
    /// bootstrap, then arm the feedback timer.
    async fn announce_active_chapter(&mut self) -> EngineResult<()> {
        let Some(story) = &self.story else {
            return Ok(());
        };
        let chapter = story.active.clone();
        let todos = story.todos.clone();
        let story_id = story.story.id;
        let rows = story.progress_rows();

        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::NewChapter {
                chapter: chapter.clone(),
            },
        )
        .await;

        for member in self.room.players.clone() {
            let opening = ChapterManager::opening_message(
                self.display_name(&member.player_id),
                &chapter,
                &todos,
            );
            let message = Message::new(
                self.room.id,
                PlayerId::story_machine(),
                "Story Machine",
                opening.clone(),
                MessageKind::StoryMachine {
                    recipient_id: member.player_id.clone(),
                },
            )
            .with_story(story_id, chapter.number);
            self.services.repository.insert_message(&message).await?;
            self.emit(
                Scope::Player(self.room.id, member.player_id.clone()),
                EngineEvent::StoryMachineInit {
                    player_id: member.player_id.clone(),
                    chapter_number: chapter.number,
                    opening,
                    total_todos: todos.len() as u32,
                },
            )
            .await;
        }

        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::FeedbackProgressUpdate {
                chapter_id: chapter.id,
                rows,
            },
        )
        .await;

        self.feedback_timer = Some(timers::schedule(
            self.tx.clone(),
            self.services.config.engine.feedback_timeout,
            RoomCommand::FeedbackTimeout {
                chapter_id: chapter.id,
            },
        ));
        Ok(())
    }

    async fn handle_status_change(
        &mut self,
        player_id: PlayerId,
        to: RoomStatus,
        from: RoomStatus,
    ) -> EngineResult<Room> {
        if !self.room.is_member(&player_id) {
            return Err(EngineError::NotInRoom);
        }
        if !self.room.is_host(&player_id) {
            return Err(EngineError::PermissionDenied(
                "only the host may pause or resume".to_string(),
            ));
        }
        if self.room.status != from || !self.room.status.can_transition_to(to) {
            return Err(EngineError::InvalidInput(format!(
                "cannot move from {} to {}",
                self.room.status, to
            )));
        }
        self.room.status = to;
        self.room.updated_at = Utc::now();
        self.services.repository.update_room(&self.room).await?;
        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::RoomUpdated {
                room: self.room.clone(),
            },
        )
        .await;
        Ok(self.room.clone())
    }

    async fn handle_end(&mut self, player_id: PlayerId) -> EngineResult<Room> {
        if !self.room.is_member(&player_id) {
            return Err(EngineError::NotInRoom);
        }
        if !self.room.is_host(&player_id) {
            return Err(EngineError::PermissionDenied(
                "only the host may end the room".to_string(),
            ));
        }
        self.cancel_timers();
        self.room.status = RoomStatus::Ended;
        self.room.updated_at = Utc::now();
        self.services.repository.update_room(&self.room).await?;
        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::RoomUpdated {
                room: self.room.clone(),
            },
        )
        .await;
        tracing::info!(room = %self.room.id, "room ended by host");
        Ok(self.room.clone())
    }

    // ── Message dispatch ────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn handle_send_message(
        &mut self,
        player_id: PlayerId,
        content: String,
        message_type: InboundMessageType,
        recipient_id: Option<PlayerId>,
        recipient_name: Option<String>,
        client_id: Option<String>,
        respond: Responder<SendMessageResponse>,
    ) {
        if let Err(error) = self.validate_sender(&player_id) {
            let _ = respond.send(Err(error));
            return;
        }
        if let Some(id) = &client_id {
            if self.seen_client_ids.contains(id) {
                // Duplicate submission: acknowledge without persisting or
                // broadcasting again.
                let kind = match message_type {
                    InboundMessageType::Global => MessageKind::Global,
                    InboundMessageType::Private => MessageKind::Private,
                    InboundMessageType::PlayerToPlayer => MessageKind::PlayerToPlayer {
                        recipient_id: recipient_id.clone().unwrap_or_else(|| player_id.clone()),
                        recipient_name: recipient_name.clone().unwrap_or_default(),
                    },
                };
                let message = Message::new(
                    self.room.id,
                    player_id.clone(),
                    self.display_name(&player_id).to_string(),
                    content,
                    kind,
                )
                .with_client_id(client_id);
                let _ = respond.send(Ok(SendMessageResponse {
                    message,
                    chapter: None,
                    room: self.room.clone(),
                }));
                return;
            }
        }

        match message_type {
            InboundMessageType::Global => {
                self.handle_global_message(player_id, content, client_id, respond)
                    .await
            }
            InboundMessageType::Private => {
                self.handle_private_message(player_id, content, client_id, respond)
                    .await
            }
            InboundMessageType::PlayerToPlayer => {
                let _ = respond.send(
                    self.handle_direct_message(
                        player_id,
                        content,
                        recipient_id,
                        recipient_name,
                        client_id,
                    )
                    .await,
                );
            }
        }
    }

    fn validate_sender(&self, player_id: &PlayerId) -> EngineResult<()> {
        if !self.room.is_member(player_id) {
            return Err(EngineError::NotInRoom);
        }
        match self.room.status {
            RoomStatus::Ended => Err(EngineError::RoomNotFound(self.room.id)),
            RoomStatus::Paused => Err(EngineError::PermissionDenied(
                "room is paused".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn handle_global_message(
        &mut self,
        player_id: PlayerId,
        content: String,
        client_id: Option<String>,
        respond: Responder<SendMessageResponse>,
    ) {
        let mut message = Message::new(
            self.room.id,
            player_id.clone(),
            self.display_name(&player_id).to_string(),
            content.clone(),
            MessageKind::Global,
        )
        .with_client_id(client_id.clone());
        if let Some(story) = &self.story {
            message = message.with_story(story.story.id, story.active.number);
        }

        match self.persist_message(&message).await {
            Ok(true) => {}
            Ok(false) => {
                let _ = respond.send(Ok(SendMessageResponse {
                    message,
                    chapter: None,
                    room: self.room.clone(),
                }));
                return;
            }
            Err(error) => {
                let _ = respond.send(Err(error));
                return;
            }
        }
        self.bump_message_stats(&player_id).await;

        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::NewMessage {
                message: message.clone(),
            },
        )
        .await;

        let Some(story) = &mut self.story else {
            let _ = respond.send(Ok(SendMessageResponse {
                message,
                chapter: None,
                room: self.room.clone(),
            }));
            return;
        };

        story.global_messages_this_chapter += 1;
        story.messages_since_ai_output += 1;
        story.last_player_activity = Utc::now();

        let counters = TriggerCounters {
            global_messages_this_chapter: story.global_messages_this_chapter,
            messages_since_ai_output: story.messages_since_ai_output,
            last_ai_output: story.last_ai_output,
        };
        let reason = dispatch::evaluate(
            &self.services.config.story_trigger,
            &content,
            &counters,
            Utc::now(),
        );

        let Some(reason) = reason else {
            let _ = respond.send(Ok(SendMessageResponse {
                message,
                chapter: None,
                room: self.room.clone(),
            }));
            return;
        };
        if self.generating {
            tracing::debug!(room = %self.room.id, %reason, "generation already in flight");
            let _ = respond.send(Ok(SendMessageResponse {
                message,
                chapter: None,
                room: self.room.clone(),
            }));
            return;
        }
        tracing::debug!(room = %self.room.id, %reason, "story generation triggered");
        self.generating = true;

        let Some(story) = &self.story else {
            let _ = respond.send(Ok(SendMessageResponse {
                message,
                chapter: None,
                room: self.room.clone(),
            }));
            return;
        };
        let observed = story.active.id;
        let generation_story_id = story.story.id;
        let bundle = story.memory.relevant_memories(
            &content,
            &RetrievalLimits::chars(self.services.config.memory.context_char_budget),
        );
        let mut context = format!(
            "You are the narrator of a collaborative mystery story.\nTitle: {}\nBackground: {}\n\n\
             Current chapter so far:\n{}",
            story.story.title,
            story.story.background,
            tail_chars(&story.active.content, 2000),
        );
        if !bundle.is_empty() {
            context.push_str("\n\n");
            context.push_str(&bundle.render());
        }
        let prompt = format!(
            "{} says: {content}\n\nContinue the scene in a short passage that reacts to the \
             players and deepens the mystery.",
            self.display_name(&player_id),
        );

        let services = self.services.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut context = context;
            if let Ok(recent) = services
                .repository
                .recent_global_messages(generation_story_id, observed, 8)
                .await
            {
                if !recent.is_empty() {
                    context.push_str("\n\nRecent table talk:\n");
                    for m in &recent {
                        context.push_str(&format!("{}: {}\n", m.sender_name, m.content));
                    }
                }
            }
            let generated = services
                .queue
                .generate_story(
                    0,
                    None,
                    crate::provider::GenerateRequest::new(context, prompt),
                )
                .await
                .map(|completion| completion.content)
                .map_err(EngineError::from);
            let _ = tx.send(RoomCommand::ApplyGlobalAppend {
                observed,
                generated,
                message,
                respond,
            });
        });
    }

    async fn apply_global_append(
        &mut self,
        observed: ChapterId,
        generated: Result<String, EngineError>,
        message: Message,
    ) -> EngineResult<SendMessageResponse> {
        self.generating = false;
        let block = match generated {
            Ok(block) => block,
            Err(error) => {
                // The player's message stands; the chapter simply does not
                // grow this round.
                tracing::warn!(room = %self.room.id, %error, "story generation failed");
                return Ok(SendMessageResponse {
                    message,
                    chapter: None,
                    room: self.room.clone(),
                });
            }
        };

        let Some(story) = &mut self.story else {
            return Ok(SendMessageResponse {
                message,
                chapter: None,
                room: self.room.clone(),
            });
        };
        if story.active.id != observed {
            tracing::debug!(room = %self.room.id, "discarding stale generation");
            return Ok(SendMessageResponse {
                message,
                chapter: None,
                room: self.room.clone(),
            });
        }

        story.active.append_block(&block);
        self.services.repository.update_chapter(&story.active).await?;
        story.history.record(story.active.clone());

        let chapter_message = Message::new(
            self.room.id,
            PlayerId::story_machine(),
            "Narrator",
            block.clone(),
            MessageKind::Chapter,
        )
        .with_story(story.story.id, story.active.number);
        self.services
            .repository
            .insert_message(&chapter_message)
            .await?;

        story
            .memory
            .record_interaction(message.sender_id.clone(), &message.content, &block);
        if let Some(latest) = story.memory.short_term.iter().last().cloned() {
            self.services
                .repository
                .insert_interaction(story.story.id, &latest)
                .await?;
        }
        story.chapter_key_events += story.memory.absorb_chapter(&block);
        story.messages_since_ai_output = 0;
        story.last_ai_output = Utc::now();

        let updated = story.active.clone();
        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::NewMessage {
                message: chapter_message,
            },
        )
        .await;
        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::NewChapter {
                chapter: updated.clone(),
            },
        )
        .await;

        self.maybe_auto_advance().await;

        Ok(SendMessageResponse {
            message,
            chapter: Some(updated),
            room: self.room.clone(),
        })
    }

    async fn handle_private_message(
        &mut self,
        player_id: PlayerId,
        content: String,
        client_id: Option<String>,
        respond: Responder<SendMessageResponse>,
    ) {
        let Some(story) = &self.story else {
            let _ = respond.send(Err(EngineError::StoryMissing));
            return;
        };
        if let Some(id) = &client_id {
            self.seen_client_ids.insert(id.clone());
        }

        let observed = story.active.id;
        let story_id = story.story.id;
        let chapter_number = story.active.number;
        let todos = story.todos.clone();
        let story_context = format!(
            "Title: {}\nBackground: {}\n\nActive chapter:\n{}",
            story.story.title,
            story.story.background,
            tail_chars(&story.active.content, 1500),
        );
        let message = Message::new(
            self.room.id,
            player_id.clone(),
            self.display_name(&player_id).to_string(),
            content.clone(),
            MessageKind::Private,
        )
        .with_story(story_id, chapter_number)
        .with_client_id(client_id);

        let services = self.services.clone();
        let tx = self.tx.clone();
        let room_id = self.room.id;
        tokio::spawn(async move {
            // Availability is checked before anything is persisted, so an
            // unavailable provider leaves no trace of the attempt.
            if let Err(error) = services.queue.ensure_available().await {
                let _ = tx.send(RoomCommand::ApplyPrivateOutcome {
                    observed,
                    player_id: player_id.clone(),
                    message: None,
                    outcome: Err(EngineError::from(error)),
                    respond,
                });
                return;
            }

            let outcome = async {
                services.repository.insert_message(&message).await?;

                let verdicts = services
                    .evaluator
                    .evaluate_message(&content, &todos, &story_context)
                    .await;
                let progress = services
                    .evaluator
                    .apply_verdicts(observed, &player_id, &verdicts)
                    .await?;
                let satisfied: Vec<TodoId> = verdicts
                    .iter()
                    .filter(|v| v.satisfied)
                    .map(|v| v.todo_id)
                    .collect();

                let reply_text = match services
                    .queue
                    .chat(
                        1,
                        None,
                        vec![
                            ChatMessage::system(
                                "You are the story machine: the private investigative voice of a \
                                 collaborative mystery game. Acknowledge the player's report in \
                                 character and, without revealing answers, nudge them toward \
                                 what remains unexamined.",
                            ),
                            ChatMessage::user(format!("{story_context}\n\nPlayer report:\n{content}")),
                        ],
                        ChatOptions {
                            max_tokens: 512,
                            temperature: 0.6,
                            json: false,
                        },
                    )
                    .await
                {
                    Ok(completion) => completion.content,
                    Err(error) => {
                        tracing::warn!(room = %room_id, %error, "story-machine reply failed");
                        "The story machine crackles and falls silent for a moment. Your report \
                         has been recorded; try again shortly."
                            .to_string()
                    }
                };

                let reply = Message::new(
                    room_id,
                    PlayerId::story_machine(),
                    "Story Machine",
                    reply_text,
                    MessageKind::StoryMachine {
                        recipient_id: player_id.clone(),
                    },
                )
                .with_story(story_id, chapter_number);
                services.repository.insert_message(&reply).await?;

                Ok(PrivateOutcome {
                    progress,
                    satisfied,
                    reply,
                })
            }
            .await;

            let _ = tx.send(RoomCommand::ApplyPrivateOutcome {
                observed,
                player_id,
                message: Some(message),
                outcome,
                respond,
            });
        });
    }

    async fn apply_private_outcome(
        &mut self,
        observed: ChapterId,
        player_id: PlayerId,
        message: Option<Message>,
        outcome: Result<PrivateOutcome, EngineError>,
    ) -> EngineResult<SendMessageResponse> {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                self.emit(
                    Scope::Player(self.room.id, player_id),
                    EngineEvent::Error {
                        code: error.code().as_str().to_string(),
                        message: error.to_string(),
                        source_event: Some("send_message".to_string()),
                    },
                )
                .await;
                return Err(error);
            }
        };
        let message = message.ok_or_else(|| {
            EngineError::Internal("private outcome without persisted message".to_string())
        })?;
        self.bump_message_stats(&message.sender_id).await;

        let Some(story) = &mut self.story else {
            return Ok(SendMessageResponse {
                message,
                chapter: None,
                room: self.room.clone(),
            });
        };
        if story.active.id != observed {
            // The chapter advanced while we were evaluating; the repository
            // already holds the progress for the old chapter.
            return Ok(SendMessageResponse {
                message,
                chapter: None,
                room: self.room.clone(),
            });
        }

        for todo in story.todos.iter_mut() {
            if outcome.satisfied.contains(&todo.id) {
                todo.status = crate::types::TodoStatus::Completed;
            }
        }
        story
            .progress
            .insert(outcome.progress.player_id.clone(), outcome.progress.clone());
        story.last_player_activity = Utc::now();
        story
            .memory
            .record_interaction(message.sender_id.clone(), &message.content, &outcome.reply.content);
        if let Some(latest) = story.memory.short_term.iter().last().cloned() {
            self.services
                .repository
                .insert_interaction(story.story.id, &latest)
                .await?;
        }

        let chapter_id = story.active.id;
        let rows = story.progress_rows();
        self.emit(
            Scope::Player(self.room.id, message.sender_id.clone()),
            EngineEvent::NewMessage {
                message: outcome.reply.clone(),
            },
        )
        .await;
        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::FeedbackProgressUpdate { chapter_id, rows },
        )
        .await;

        if self.progression_met() {
            self.start_transition("progression threshold reached");
        }

        Ok(SendMessageResponse {
            message,
            chapter: None,
            room: self.room.clone(),
        })
    }

    async fn handle_direct_message(
        &mut self,
        player_id: PlayerId,
        content: String,
        recipient_id: Option<PlayerId>,
        recipient_name: Option<String>,
        client_id: Option<String>,
    ) -> EngineResult<SendMessageResponse> {
        let recipient_id = recipient_id.ok_or(EngineError::MissingRecipient)?;
        if !self.room.is_member(&recipient_id) {
            return Err(EngineError::InvalidInput(
                "recipient is not in the room".to_string(),
            ));
        }
        let recipient_name =
            recipient_name.unwrap_or_else(|| self.display_name(&recipient_id).to_string());

        let mut message = Message::new(
            self.room.id,
            player_id.clone(),
            self.display_name(&player_id).to_string(),
            content,
            MessageKind::PlayerToPlayer {
                recipient_id: recipient_id.clone(),
                recipient_name,
            },
        )
        .with_client_id(client_id);
        if let Some(story) = &self.story {
            message = message.with_story(story.story.id, story.active.number);
        }

        if !self.persist_message(&message).await? {
            return Ok(SendMessageResponse {
                message,
                chapter: None,
                room: self.room.clone(),
            });
        }
        self.bump_message_stats(&player_id).await;

        // Recorded, never answered: no provider call, no memory update.
        let event = EngineEvent::NewMessage {
            message: message.clone(),
        };
        self.emit(Scope::Player(self.room.id, player_id.clone()), event.clone())
            .await;
        if recipient_id != player_id {
            self.emit(Scope::Player(self.room.id, recipient_id), event).await;
        }

        Ok(SendMessageResponse {
            message,
            chapter: None,
            room: self.room.clone(),
        })
    }

    // ── Progression ─────────────────────────────────────────────────

    async fn handle_feedback_timeout(&mut self, chapter_id: ChapterId) {
        let Some(story) = &mut self.story else {
            return;
        };
        if story.active.id != chapter_id || self.transitioning {
            return;
        }
        tracing::info!(room = %self.room.id, chapter = story.active.number, "feedback window expired");

        match self
            .services
            .repository
            .mark_timeout_players_complete(chapter_id, Utc::now())
            .await
        {
            Ok(rows) => {
                for todo in story.todos.iter_mut() {
                    todo.status = crate::types::TodoStatus::Completed;
                }
                for row in rows {
                    story.progress.insert(row.player_id.clone(), row);
                }
                let rows = story.progress_rows();
                self.emit(
                    Scope::Room(self.room.id),
                    EngineEvent::FeedbackProgressUpdate { chapter_id, rows },
                )
                .await;
                self.start_transition("feedback timeout");
            }
            Err(error) => {
                tracing::error!(room = %self.room.id, %error, "timeout bookkeeping failed");
            }
        }
    }

    /// Re-evaluate the chapter-length trigger policy after an append.
    async fn maybe_auto_advance(&mut self) {
        let Some(story) = &self.story else {
            return;
        };
        if self.transitioning {
            return;
        }
        let observations = TriggerObservations {
            word_count: story.active.word_count,
            key_events: story.chapter_key_events,
            message_count: story.global_messages_this_chapter as usize,
            started_at: story.active.start_time,
            last_player_activity: story.last_player_activity,
        };
        if let Some(trigger) = self.services.chapters.should_advance(&observations, Utc::now()) {
            tracing::info!(room = %self.room.id, %trigger, "chapter trigger fired");
            self.start_transition("chapter trigger");
        }
    }

    fn progression_met(&self) -> bool {
        let Some(story) = &self.story else {
            return false;
        };
        if self.room.players.is_empty() {
            return false;
        }
        let threshold = self.services.config.engine.progression_threshold;
        self.room.players.iter().all(|member| {
            story
                .progress
                .get(&member.player_id)
                .map(|row| row.completion_rate + f32::EPSILON >= threshold)
                .unwrap_or(false)
        })
    }

    fn start_transition(&mut self, reason: &str) {
        if self.transitioning {
            return;
        }
        let Some(story) = &self.story else {
            return;
        };
        self.transitioning = true;
        tracing::info!(room = %self.room.id, chapter = story.active.number, reason, "starting chapter transition");

        let observed = story.active.id;
        let story_entity = story.story.clone();
        let active = story.active.clone();
        let mut memory = story.memory.clone();
        let members: Vec<PlayerId> = self
            .room
            .players
            .iter()
            .map(|p| p.player_id.clone())
            .collect();
        let services = self.services.clone();
        let tx = self.tx.clone();
        let feedback_timeout = self.services.config.engine.feedback_timeout;

        tokio::spawn(async move {
            let result = async {
                let transition = services
                    .chapters
                    .transition(&story_entity, &active, &mut memory)
                    .await?;
                let timeout_at = Utc::now()
                    + chrono::Duration::from_std(feedback_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(600));
                let progress: Vec<PlayerProgress> = members
                    .iter()
                    .map(|p| {
                        PlayerProgress::new(
                            transition.next.id,
                            p.clone(),
                            transition.todos.len() as u32,
                            timeout_at,
                        )
                    })
                    .collect();
                services
                    .repository
                    .complete_and_activate(
                        &transition.completed,
                        &transition.next,
                        &transition.todos,
                        &progress,
                    )
                    .await?;
                services
                    .repository
                    .save_memory(story_entity.id, &memory.snapshot())
                    .await?;
                Ok(TransitionApplied {
                    transition,
                    memory,
                    progress,
                })
            }
            .await;
            let _ = tx.send(RoomCommand::ApplyTransition { observed, result });
        });
    }

    async fn apply_transition(
        &mut self,
        observed: ChapterId,
        result: Result<TransitionApplied, EngineError>,
    ) {
        self.transitioning = false;
        let applied = match result {
            Ok(applied) => applied,
            Err(EngineError::Repository(crate::repository::RepositoryError::Conflict(detail))) => {
                tracing::debug!(room = %self.room.id, %detail, "transition lost the race");
                return;
            }
            Err(error) => {
                tracing::warn!(room = %self.room.id, %error, "chapter transition failed");
                return;
            }
        };

        let Some(story) = &mut self.story else {
            return;
        };
        if story.active.id != observed {
            tracing::debug!(room = %self.room.id, "discarding stale transition");
            return;
        }

        story.history.record(applied.transition.completed.clone());
        story.history.record(applied.transition.next.clone());
        story.active = applied.transition.next.clone();
        story.todos = applied.transition.todos.clone();
        story.progress = applied
            .progress
            .into_iter()
            .map(|row| (row.player_id.clone(), row))
            .collect();
        story.memory = applied.memory;
        story.reset_chapter_counters();

        let number = story.active.number;
        if let Some(timer) = self.feedback_timer.take() {
            timer.cancel();
        }
        self.bump_chapters_seen().await;
        if let Err(error) = self.announce_active_chapter().await {
            tracing::error!(room = %self.room.id, %error, "chapter announcement failed");
        }
        self.emit(
            Scope::Room(self.room.id),
            EngineEvent::ChapterReady {
                chapter_number: number,
            },
        )
        .await;
        tracing::info!(room = %self.room.id, chapter = number, "chapter transition applied");
    }

    // ── Reads ───────────────────────────────────────────────────────

    async fn handle_get_messages(&self, player_id: PlayerId) -> EngineResult<Vec<Message>> {
        if !self.room.is_member(&player_id) {
            return Err(EngineError::NotInRoom);
        }
        let messages = self
            .services
            .repository
            .messages_for_room(self.room.id)
            .await?;
        Ok(messages
            .into_iter()
            .filter(|m| m.visible_to(&player_id))
            .collect())
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn persist_message(&mut self, message: &Message) -> EngineResult<bool> {
        let inserted = self.services.repository.insert_message(message).await?;
        if let Some(id) = &message.client_id {
            self.seen_client_ids.insert(id.clone());
        }
        Ok(inserted)
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.feedback_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.gc_timer.take() {
            timer.cancel();
        }
    }

    async fn emit(&self, scope: Scope, event: EngineEvent) {
        self.services.bus.emit(scope, event).await;
    }

    fn display_name<'a>(&'a self, player_id: &'a PlayerId) -> &'a str {
        self.names
            .get(player_id)
            .map(|s| s.as_str())
            .unwrap_or(player_id.as_str())
    }

    /// Arm the feedback timer from persisted deadlines (rehydration path).
    fn rearm_feedback_timer(&mut self) {
        let Some(story) = &self.story else {
            return;
        };
        let Some(deadline) = story.progress.values().map(|row| row.timeout_at).min() else {
            return;
        };
        let delay = (deadline - Utc::now()).to_std().unwrap_or_default();
        self.feedback_timer = Some(timers::schedule(
            self.tx.clone(),
            delay,
            RoomCommand::FeedbackTimeout {
                chapter_id: story.active.id,
            },
        ));
    }

    async fn bump_message_stats(&self, player_id: &PlayerId) {
        if let Ok(Some(mut player)) = self.services.repository.get_player(player_id).await {
            player.stats.messages_sent += 1;
            player.last_active = Utc::now();
            if let Err(error) = self.services.repository.upsert_player(&player).await {
                tracing::debug!(%error, "player stats update failed");
            }
        }
    }

    async fn bump_chapters_seen(&self) {
        for member in &self.room.players {
            if let Ok(Some(mut player)) =
                self.services.repository.get_player(&member.player_id).await
            {
                player.stats.chapters_seen += 1;
                if let Err(error) = self.services.repository.upsert_player(&player).await {
                    tracing::debug!(%error, "player stats update failed");
                }
            }
        }
    }
}

/// Fail a command's responder when the room is draining.
fn reject(command: RoomCommand) {
    match command {
        RoomCommand::Join { respond, .. }
        | RoomCommand::Leave { respond, .. }
        | RoomCommand::InitializeStory { respond, .. }
        | RoomCommand::ApplyStoryInit { respond, .. }
        | RoomCommand::Pause { respond, .. }
        | RoomCommand::Resume { respond, .. }
        | RoomCommand::End { respond, .. }
        | RoomCommand::GetStatus { respond } => {
            let _ = respond.send(Err(EngineError::ShuttingDown));
        }
        RoomCommand::SendMessage { respond, .. }
        | RoomCommand::ApplyGlobalAppend { respond, .. }
        | RoomCommand::ApplyPrivateOutcome { respond, .. } => {
            let _ = respond.send(Err(EngineError::ShuttingDown));
        }
        RoomCommand::GetMessages { respond, .. } => {
            let _ = respond.send(Err(EngineError::ShuttingDown));
        }
        RoomCommand::FeedbackTimeout { .. }
        | RoomCommand::ApplyTransition { .. }
        | RoomCommand::GcExpired
        | RoomCommand::Shutdown => {}
    }
}

/// Last `max` characters of a text, on a char boundary.
fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}
