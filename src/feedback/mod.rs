//! Feedback evaluator
//!
//! Judges player replies against the active chapter's todos. Each pending
//! todo gets an LLM verdict; evaluations for one message run concurrently.
//! All parsing of model output happens here, and every failure path falls
//! back to a deterministic keyword heuristic so a malformed reply can never
//! produce an inconsistent verdict.

use futures::future::join_all;
use std::sync::Arc;

use crate::memory::keywords_of;
use crate::provider::{ChatMessage, ChatOptions};
use crate::queue::RequestQueue;
use crate::repository::Repository;
use crate::types::{ChapterId, EngineError, PlayerId, PlayerProgress, Todo, TodoId};

const VERDICT_SYSTEM_PROMPT: &str = "You judge whether a player's reply satisfies an \
information-gathering objective in a mystery game. Respond with a JSON object: \
{\"satisfied\": true|false, \"reason\": \"short explanation\"}. Respond with JSON only.";

/// Verdict for one todo.
#[derive(Debug, Clone)]
pub struct TodoVerdict {
    pub todo_id: TodoId,
    pub satisfied: bool,
    pub reason: String,
}

/// Evaluates player feedback and maintains per-player progress.
#[derive(Clone)]
pub struct FeedbackEvaluator {
    queue: RequestQueue,
    repository: Arc<dyn Repository>,
}

impl FeedbackEvaluator {
    pub fn new(queue: RequestQueue, repository: Arc<dyn Repository>) -> Self {
        Self { queue, repository }
    }

    /// Judge `player_message` against every not-yet-completed todo.
    pub async fn evaluate_message(
        &self,
        player_message: &str,
        todos: &[Todo],
        story_context: &str,
    ) -> Vec<TodoVerdict> {
        let pending: Vec<&Todo> = todos.iter().filter(|t| !t.is_completed()).collect();
        let futures = pending
            .iter()
            .map(|todo| self.judge_one(player_message, todo, story_context));
        join_all(futures).await
    }

    /// Mark satisfied todos completed and refresh the player's progress row.
    /// Both happen in one repository transaction.
    pub async fn apply_verdicts(
        &self,
        chapter_id: ChapterId,
        player_id: &PlayerId,
        verdicts: &[TodoVerdict],
    ) -> Result<PlayerProgress, EngineError> {
        let satisfied: Vec<TodoId> = verdicts
            .iter()
            .filter(|v| v.satisfied)
            .map(|v| v.todo_id)
            .collect();
        let progress = self
            .repository
            .apply_feedback(chapter_id, player_id, &satisfied)
            .await?;
        tracing::debug!(
            chapter = %chapter_id,
            player = %player_id,
            satisfied = satisfied.len(),
            rate = progress.completion_rate,
            "feedback applied"
        );
        Ok(progress)
    }

    async fn judge_one(
        &self,
        player_message: &str,
        todo: &Todo,
        story_context: &str,
    ) -> TodoVerdict {
        let user = format!(
            "Story context:\n{story_context}\n\nObjective: {}\nExpected answer: {}\n\nPlayer reply:\n{player_message}",
            todo.content,
            todo.expected_answer.as_deref().unwrap_or("(none recorded)"),
        );
        let messages = vec![
            ChatMessage::system(VERDICT_SYSTEM_PROMPT),
            ChatMessage::user(user),
        ];
        let options = ChatOptions {
            max_tokens: 256,
            temperature: 0.0,
            json: true,
        };

        match self.queue.chat(1, None, messages, options).await {
            Ok(completion) => match parse_verdict(&completion.content) {
                Some((satisfied, reason)) => TodoVerdict {
                    todo_id: todo.id,
                    satisfied,
                    reason,
                },
                None => {
                    tracing::warn!(todo = %todo.id, "unparseable verdict, using heuristic");
                    heuristic_verdict(player_message, todo)
                }
            },
            Err(error) => {
                tracing::warn!(todo = %todo.id, %error, "verdict call failed, using heuristic");
                heuristic_verdict(player_message, todo)
            }
        }
    }
}

/// Extract the first JSON value embedded in model output. Models wrap JSON
/// in prose and code fences often enough that plain `from_str` is not
/// enough.
pub(crate) fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some(value);
    }
    for open in ['{', '['] {
        let close = if open == '{' { '}' } else { ']' };
        if let Some(start) = text.find(open) {
            // Try progressively shorter suffixes ending at a closer.
            let mut end = text.len();
            while let Some(idx) = text[..end].rfind(close) {
                if idx < start {
                    break;
                }
                if let Ok(value) = serde_json::from_str(&text[start..=idx]) {
                    return Some(value);
                }
                end = idx;
            }
        }
    }
    None
}

fn parse_verdict(text: &str) -> Option<(bool, String)> {
    let value = extract_json(text)?;
    let satisfied = value.get("satisfied")?.as_bool()?;
    let reason = value
        .get("reason")
        .and_then(|r| r.as_str())
        .unwrap_or("")
        .to_string();
    Some((satisfied, reason))
}

/// Deterministic fallback: keyword overlap between the reply and the todo's
/// expected answer (or its prompt when no answer was recorded).
fn heuristic_verdict(player_message: &str, todo: &Todo) -> TodoVerdict {
    let target_text = todo.expected_answer.as_deref().unwrap_or(&todo.content);
    let target = keywords_of(target_text, 10);
    let reply_tokens = keywords_of(player_message, 50);
    let hits = target
        .iter()
        .filter(|k| reply_tokens.contains(k))
        .count();
    let satisfied = !target.is_empty() && hits * 2 >= target.len();
    TodoVerdict {
        todo_id: todo.id,
        satisfied,
        reason: format!("keyword heuristic: {hits}/{} terms matched", target.len()),
    }
}
