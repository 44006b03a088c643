//! One-shot timers feeding the room mailbox
//!
//! Timers hold ids and a command sender, never room state. Firing delivers a
//! command onto the mailbox so `apply` stays the only path that mutates a
//! room; cancellation aborts the sleep task.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::room::RoomCommand;

/// Handle to a scheduled one-shot. Aborts the timer when dropped.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// After `delay`, deliver `command` onto the room mailbox.
pub(crate) fn schedule(
    tx: mpsc::UnboundedSender<RoomCommand>,
    delay: Duration,
    command: RoomCommand,
) -> TimerHandle {
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // A closed mailbox means the room is already gone.
        let _ = tx.send(command);
    });
    TimerHandle { handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChapterId;

    #[tokio::test]
    async fn test_timer_delivers_command() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chapter_id = ChapterId::new();
        let _timer = schedule(
            tx,
            Duration::from_millis(10),
            RoomCommand::FeedbackTimeout { chapter_id },
        );
        let command = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            command,
            RoomCommand::FeedbackTimeout { chapter_id: c } if c == chapter_id
        ));
    }

    #[tokio::test]
    async fn test_cancel_prevents_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = schedule(
            tx,
            Duration::from_millis(20),
            RoomCommand::GcExpired,
        );
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
