//! Message entity and visibility rules
//!
//! Messages are a tagged variant per kind; each variant carries exactly the
//! fields its kind requires and visibility is derived, never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, PlayerId, RoomId, StoryId};

/// Who may observe a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Every current and future member of the room.
    Global,
    /// A single player's private story-machine channel.
    Private,
    /// Exactly the sender and the recipient.
    Direct,
}

/// Kind-specific message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Public table talk, visible to the whole room.
    Global,
    /// Player input on their private story-machine channel.
    Private,
    /// Story-machine reply addressed to one player.
    StoryMachine { recipient_id: PlayerId },
    /// Direct player-to-player note. Recorded, never answered.
    PlayerToPlayer {
        recipient_id: PlayerId,
        recipient_name: String,
    },
    /// Narrative block authored by the engine.
    Chapter,
}

impl MessageKind {
    pub fn visibility(&self) -> Visibility {
        match self {
            MessageKind::Global | MessageKind::Chapter => Visibility::Global,
            MessageKind::Private | MessageKind::StoryMachine { .. } => Visibility::Private,
            MessageKind::PlayerToPlayer { .. } => Visibility::Direct,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::Global => "global",
            MessageKind::Private => "private",
            MessageKind::StoryMachine { .. } => "story_machine",
            MessageKind::PlayerToPlayer { .. } => "player_to_player",
            MessageKind::Chapter => "chapter",
        }
    }
}

/// A persisted message. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub story_id: Option<StoryId>,
    pub sender_id: PlayerId,
    pub sender_name: String,
    pub content: String,
    pub chapter_number: Option<u32>,
    pub kind: MessageKind,
    /// Caller-supplied correlation id used to suppress duplicate submissions.
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        room_id: RoomId,
        sender_id: PlayerId,
        sender_name: impl Into<String>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: MessageId::new(),
            room_id,
            story_id: None,
            sender_id,
            sender_name: sender_name.into(),
            content: content.into(),
            chapter_number: None,
            kind,
            client_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_story(mut self, story_id: StoryId, chapter_number: u32) -> Self {
        self.story_id = Some(story_id);
        self.chapter_number = Some(chapter_number);
        self
    }

    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn visibility(&self) -> Visibility {
        self.kind.visibility()
    }

    /// Whether `player` may observe this message via `get_messages`.
    pub fn visible_to(&self, player: &PlayerId) -> bool {
        match &self.kind {
            MessageKind::Global | MessageKind::Chapter => true,
            MessageKind::Private => &self.sender_id == player,
            MessageKind::StoryMachine { recipient_id } => recipient_id == player,
            MessageKind::PlayerToPlayer { recipient_id, .. } => {
                &self.sender_id == player || recipient_id == player
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(kind: MessageKind) -> Message {
        Message::new(RoomId::new(), PlayerId::from("alice"), "Alice", "hello", kind)
    }

    #[test]
    fn test_visibility_derivation() {
        assert_eq!(base(MessageKind::Global).visibility(), Visibility::Global);
        assert_eq!(base(MessageKind::Chapter).visibility(), Visibility::Global);
        assert_eq!(base(MessageKind::Private).visibility(), Visibility::Private);
        assert_eq!(
            base(MessageKind::StoryMachine {
                recipient_id: PlayerId::from("alice")
            })
            .visibility(),
            Visibility::Private
        );
        assert_eq!(
            base(MessageKind::PlayerToPlayer {
                recipient_id: PlayerId::from("bob"),
                recipient_name: "Bob".to_string()
            })
            .visibility(),
            Visibility::Direct
        );
    }

    #[test]
    fn test_direct_visible_only_to_endpoints() {
        let msg = base(MessageKind::PlayerToPlayer {
            recipient_id: PlayerId::from("bob"),
            recipient_name: "Bob".to_string(),
        });
        assert!(msg.visible_to(&PlayerId::from("alice")));
        assert!(msg.visible_to(&PlayerId::from("bob")));
        assert!(!msg.visible_to(&PlayerId::from("carol")));
    }

    #[test]
    fn test_private_visible_only_to_sender() {
        let msg = base(MessageKind::Private);
        assert!(msg.visible_to(&PlayerId::from("alice")));
        assert!(!msg.visible_to(&PlayerId::from("bob")));
    }

    #[test]
    fn test_story_machine_visible_only_to_recipient() {
        let mut msg = base(MessageKind::StoryMachine {
            recipient_id: PlayerId::from("bob"),
        });
        msg.sender_id = PlayerId::story_machine();
        assert!(msg.visible_to(&PlayerId::from("bob")));
        assert!(!msg.visible_to(&PlayerId::from("alice")));
    }
}
