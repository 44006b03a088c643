//! Invariant checks over the engine's observable state

mod common;

use std::time::Duration;

use common::{harness, script_story_init, script_transition, test_config, wait_until};
use storyhost::bus::EngineEvent;
use storyhost::types::{ChapterStatus, ErrorCode, TodoStatus};
use storyhost::SendMessageRequest;

fn global_with_client(message: &str, client_id: &str) -> SendMessageRequest {
    SendMessageRequest {
        message: message.to_string(),
        message_type: "global".to_string(),
        client_message_id: Some(client_id.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn chapter_numbers_stay_dense_with_single_active() {
    let mut config = test_config();
    config.engine.feedback_timeout = Duration::from_millis(120);
    let h = harness(config).await;
    let room = h
        .engine()
        .create_room("Harrow House", "p1", "Alice")
        .await
        .unwrap();
    script_story_init(&h.provider);
    let room = h
        .engine()
        .initialize_story(room.id, "p1", "T", "B")
        .await
        .unwrap();
    let story_id = room.story_id.unwrap();
    script_transition(&h.provider, "Chapter two.");
    script_transition(&h.provider, "Chapter three.");

    let repository = h.runtime.repository().clone();
    wait_until("two timeout transitions", Duration::from_secs(5), || {
        let repository = repository.clone();
        async move {
            repository
                .active_chapter(story_id)
                .await
                .unwrap()
                .map(|c| c.number >= 3)
                .unwrap_or(false)
        }
    })
    .await;
    h.engine().end_room(room.id, "p1").await.unwrap();

    let chapters = repository.chapters_for_story(story_id).await.unwrap();
    let mut numbers: Vec<u32> = chapters.iter().map(|c| c.number).collect();
    numbers.sort_unstable();
    let expected: Vec<u32> = (1..=chapters.len() as u32).collect();
    assert_eq!(numbers, expected, "dense 1..N numbering");
    let active = chapters
        .iter()
        .filter(|c| c.status == ChapterStatus::Active)
        .count();
    assert_eq!(active, 1, "exactly one active chapter");
}

#[tokio::test]
async fn todo_batch_bounds_and_monotone_status() {
    let h = harness(test_config()).await;
    let room = h
        .engine()
        .create_room("Harrow House", "p1", "Alice")
        .await
        .unwrap();
    script_story_init(&h.provider);
    let room = h
        .engine()
        .initialize_story(room.id, "p1", "T", "B")
        .await
        .unwrap();
    let story_id = room.story_id.unwrap();
    let repository = h.runtime.repository();
    let active = repository.active_chapter(story_id).await.unwrap().unwrap();

    let todos = repository.todos_for_chapter(active.id).await.unwrap();
    assert!((3..=5).contains(&todos.len()));
    assert!(todos.iter().all(|t| (1..=5).contains(&t.priority)));

    // completed todos never revert
    let player = storyhost::types::PlayerId::from("p1");
    repository
        .apply_feedback(active.id, &player, &[todos[0].id])
        .await
        .unwrap();
    repository
        .apply_feedback(active.id, &player, &[])
        .await
        .unwrap();
    let after = repository.todos_for_chapter(active.id).await.unwrap();
    let completed: Vec<_> = after.iter().filter(|t| t.status == TodoStatus::Completed).collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, todos[0].id);
}

#[tokio::test]
async fn global_messages_visible_to_future_members() {
    let h = harness(test_config()).await;
    let room = h
        .engine()
        .create_room("Harrow House", "p1", "Alice")
        .await
        .unwrap();
    h.engine()
        .send_message(room.id, "p1", SendMessageRequest {
            message: "welcome everyone".to_string(),
            message_type: "global".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    // A player joining later still replays the message.
    h.engine().join_room(room.id, "p2", "Bob").await.unwrap();
    let replay = h.engine().get_messages(room.id, "p2").await.unwrap();
    assert!(replay.iter().any(|m| m.content == "welcome everyone"));
}

#[tokio::test]
async fn private_messages_visible_only_to_author() {
    let h = harness(test_config()).await;
    let room = h
        .engine()
        .create_room("Harrow House", "p1", "Alice")
        .await
        .unwrap();
    h.engine().join_room(room.id, "p2", "Bob").await.unwrap();
    script_story_init(&h.provider);
    h.engine()
        .initialize_story(room.id, "p1", "T", "B")
        .await
        .unwrap();

    h.provider
        .push_response(r#"{"satisfied": false, "reason": "nothing yet"}"#);
    h.provider
        .push_response(r#"{"satisfied": false, "reason": "nothing yet"}"#);
    h.provider
        .push_response(r#"{"satisfied": false, "reason": "nothing yet"}"#);
    h.provider.push_response("Understood.");
    h.engine()
        .send_message(room.id, "p1", SendMessageRequest {
            message: "my secret theory".to_string(),
            message_type: "private".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let p1_view = h.engine().get_messages(room.id, "p1").await.unwrap();
    assert!(p1_view.iter().any(|m| m.content == "my secret theory"));
    let p2_view = h.engine().get_messages(room.id, "p2").await.unwrap();
    assert!(!p2_view.iter().any(|m| m.content == "my secret theory"));
}

#[tokio::test]
async fn empty_room_deleted_after_grace_period() {
    let h = harness(test_config()).await;
    let room = h
        .engine()
        .create_room("Harrow House", "p1", "Alice")
        .await
        .unwrap();
    h.engine().leave_room(room.id, "p1").await.unwrap();

    let repository = h.runtime.repository().clone();
    // grace period is 150ms in the test config
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(repository.get_room(room.id).await.unwrap().is_some());

    wait_until("room deletion", Duration::from_secs(5), || {
        let repository = repository.clone();
        async move { repository.get_room(room.id).await.unwrap().is_none() }
    })
    .await;
    wait_until("room task retirement", Duration::from_secs(5), || {
        let engine = h.engine().clone();
        async move { engine.resident_rooms() == 0 }
    })
    .await;
}

#[tokio::test]
async fn rejoin_cancels_empty_room_deletion() {
    let h = harness(test_config()).await;
    let room = h
        .engine()
        .create_room("Harrow House", "p1", "Alice")
        .await
        .unwrap();
    h.engine().leave_room(room.id, "p1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    h.engine().join_room(room.id, "p1", "Alice").await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h
        .runtime
        .repository()
        .get_room(room.id)
        .await
        .unwrap()
        .is_some());
    let status = h.engine().get_room_status(room.id).await.unwrap();
    assert!(status.is_member(&storyhost::types::PlayerId::from("p1")));
}

#[tokio::test]
async fn duplicate_client_id_persists_and_broadcasts_once() {
    let h = harness(test_config()).await;
    let room = h
        .engine()
        .create_room("Harrow House", "p1", "Alice")
        .await
        .unwrap();
    h.bus.clear();

    h.engine()
        .send_message(room.id, "p1", global_with_client("double send", "corr-1"))
        .await
        .unwrap();
    h.engine()
        .send_message(room.id, "p1", global_with_client("double send", "corr-1"))
        .await
        .unwrap();

    let stored: Vec<_> = h
        .engine()
        .get_messages(room.id, "p1")
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.content == "double send")
        .collect();
    assert_eq!(stored.len(), 1);

    let broadcasts = h
        .bus
        .events()
        .iter()
        .filter(|(_, event)| {
            matches!(event, EngineEvent::NewMessage { message } if message.content == "double send")
        })
        .count();
    assert_eq!(broadcasts, 1);
}

#[tokio::test]
async fn validation_errors_reported_with_codes() {
    let h = harness(test_config()).await;
    let room = h
        .engine()
        .create_room("Harrow House", "p1", "Alice")
        .await
        .unwrap();

    let err = h
        .engine()
        .create_room(&"x".repeat(60), "p1", "Alice")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInput);

    let err = h
        .engine()
        .send_message(room.id, "p1", SendMessageRequest {
            message: String::new(),
            message_type: "global".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::EmptyMessage);

    let err = h
        .engine()
        .send_message(room.id, "p1", SendMessageRequest {
            message: "x".repeat(1100),
            message_type: "global".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MessageTooLong);

    let err = h
        .engine()
        .send_message(room.id, "p1", SendMessageRequest {
            message: "hello".to_string(),
            message_type: "telepathy".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidMessageType);

    let err = h
        .engine()
        .send_message(room.id, "p1", SendMessageRequest {
            message: "psst".to_string(),
            message_type: "player_to_player".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingRecipient);

    let err = h
        .engine()
        .send_message(room.id, "p9", SendMessageRequest {
            message: "hello".to_string(),
            message_type: "global".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotInRoom);

    let err = h
        .engine()
        .initialize_story(room.id, "p2", "T", "B")
        .await
        .unwrap_err();
    // p2 never joined: membership is checked before host privileges
    assert_eq!(err.code(), ErrorCode::NotInRoom);
}
