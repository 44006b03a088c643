//! Room and player entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PlayerId, RoomId, StoryId};

/// Lifecycle status of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Paused,
    Ended,
}

impl RoomStatus {
    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Allowed transitions: waiting→playing, playing↔paused, any→ended.
    pub fn can_transition_to(&self, next: RoomStatus) -> bool {
        use RoomStatus::*;
        matches!(
            (self, next),
            (Waiting, Playing) | (Playing, Paused) | (Paused, Playing) | (_, Ended)
        )
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomStatus::Waiting => write!(f, "waiting"),
            RoomStatus::Playing => write!(f, "playing"),
            RoomStatus::Paused => write!(f, "paused"),
            RoomStatus::Ended => write!(f, "ended"),
        }
    }
}

/// Role of a player within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerRole {
    Host,
    Player,
}

/// Membership record inside a room. Order of the `players` vector is join
/// order and is preserved across persistence round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRef {
    pub player_id: PlayerId,
    pub role: PlayerRole,
    pub joined_at: DateTime<Utc>,
}

/// A game room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub host_id: PlayerId,
    pub status: RoomStatus,
    pub players: Vec<PlayerRef>,
    pub story_id: Option<StoryId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    /// Create a fresh room in the Waiting state with the host as sole member.
    pub fn new(name: impl Into<String>, host_id: PlayerId) -> Self {
        let now = Utc::now();
        Self {
            id: RoomId::new(),
            name: name.into(),
            host_id: host_id.clone(),
            status: RoomStatus::Waiting,
            players: vec![PlayerRef {
                player_id: host_id,
                role: PlayerRole::Host,
                joined_at: now,
            }],
            story_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_member(&self, player_id: &PlayerId) -> bool {
        self.players.iter().any(|p| &p.player_id == player_id)
    }

    pub fn is_host(&self, player_id: &PlayerId) -> bool {
        &self.host_id == player_id
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Add a member if not already present. Returns whether the set changed.
    pub fn add_player(&mut self, player_id: PlayerId) -> bool {
        if self.is_member(&player_id) {
            return false;
        }
        let role = if self.host_id == player_id {
            PlayerRole::Host
        } else {
            PlayerRole::Player
        };
        self.players.push(PlayerRef {
            player_id,
            role,
            joined_at: Utc::now(),
        });
        self.updated_at = Utc::now();
        true
    }

    /// Remove a member. Returns whether the set changed.
    pub fn remove_player(&mut self, player_id: &PlayerId) -> bool {
        let before = self.players.len();
        self.players.retain(|p| &p.player_id != player_id);
        let changed = self.players.len() != before;
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}

/// Per-player activity counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub rooms_joined: u32,
    pub messages_sent: u64,
    pub chapters_seen: u32,
}

/// A player, shared across rooms. Created once on first appearance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub stats: PlayerStats,
    pub last_active: DateTime<Utc>,
    pub online: bool,
}

impl Player {
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            stats: PlayerStats::default(),
            last_active: Utc::now(),
            online: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use RoomStatus::*;
        assert!(Waiting.can_transition_to(Playing));
        assert!(Playing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Playing));
        assert!(Waiting.can_transition_to(Ended));
        assert!(Playing.can_transition_to(Ended));
        assert!(!Waiting.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Waiting));
        assert!(!Ended.can_transition_to(Playing));
    }

    #[test]
    fn test_room_membership() {
        let host = PlayerId::from("p1");
        let mut room = Room::new("Manor", host.clone());
        assert!(room.is_member(&host));
        assert!(room.is_host(&host));

        let other = PlayerId::from("p2");
        assert!(room.add_player(other.clone()));
        assert!(!room.add_player(other.clone()));
        assert_eq!(room.players.len(), 2);
        assert_eq!(room.players[1].role, PlayerRole::Player);

        assert!(room.remove_player(&other));
        assert!(!room.remove_player(&other));
        assert!(!room.is_empty());
        assert!(room.remove_player(&host));
        assert!(room.is_empty());
    }
}
