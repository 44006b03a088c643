//! Chapter manager
//!
//! Owns first-chapter generation, chapter transitions (ending summary, key
//! memory extraction, next opening, optional random event), todo batch
//! generation, the trigger policy, and the per-story history cache.

use rand::Rng;

use crate::config::{ChapterTriggerConfig, MemoryConfig};
use crate::feedback::extract_json;
use crate::memory::{RetrievalLimits, StoryMemory};
use crate::provider::{ChatMessage, ChatOptions, GenerateRequest};
use crate::queue::RequestQueue;
use crate::types::{Chapter, EngineError, Story, Todo};

pub mod history;
pub mod triggers;

pub use history::{ChapterHistory, ExportFormat, TimelineEntry};
pub use triggers::{evaluate as evaluate_triggers, ChapterTrigger, TriggerObservations};

const MIN_TODOS: usize = 3;
const MAX_TODOS: usize = 5;

const TODO_SYSTEM_PROMPT: &str = "You design investigation objectives for a collaborative \
mystery game. Given a chapter, produce between 3 and 5 information-gathering objectives \
players should pursue, each with the answer you expect them to uncover. Respond with a JSON \
array only: [{\"prompt\": \"...\", \"expected_answer\": \"...\", \"priority\": 1-5}, ...]";

/// A narrative surprise injected into a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomEventKind {
    Encounter,
    Discovery,
    Weather,
    Rumor,
    Opportunity,
    Crisis,
}

impl RandomEventKind {
    const WEIGHTED: &'static [(RandomEventKind, u32)] = &[
        (RandomEventKind::Encounter, 3),
        (RandomEventKind::Discovery, 3),
        (RandomEventKind::Weather, 2),
        (RandomEventKind::Rumor, 2),
        (RandomEventKind::Opportunity, 2),
        (RandomEventKind::Crisis, 1),
    ];

    fn prompt_hint(&self) -> &'static str {
        match self {
            RandomEventKind::Encounter => "an unexpected character crosses the players' path",
            RandomEventKind::Discovery => "a hidden object or place comes to light",
            RandomEventKind::Weather => "the weather turns and reshapes the scene",
            RandomEventKind::Rumor => "a rumor spreads among the characters",
            RandomEventKind::Opportunity => "a fleeting opportunity presents itself",
            RandomEventKind::Crisis => "a sudden crisis forces everyone to react",
        }
    }

    /// Weighted draw over the event set.
    fn draw(rng: &mut impl Rng) -> Self {
        let total: u32 = Self::WEIGHTED.iter().map(|(_, w)| w).sum();
        let mut roll = rng.gen_range(0..total);
        for (kind, weight) in Self::WEIGHTED {
            if roll < *weight {
                return *kind;
            }
            roll -= weight;
        }
        RandomEventKind::Encounter
    }
}

/// The outcome of one chapter transition.
#[derive(Debug, Clone)]
pub struct ChapterTransition {
    /// The prior chapter, completed, ending appended, summary set.
    pub completed: Chapter,
    /// The freshly generated active chapter.
    pub next: Chapter,
    /// Todo batch for the new chapter.
    pub todos: Vec<Todo>,
    pub random_event: Option<RandomEventKind>,
}

/// Drives chapter content through the request queue.
#[derive(Clone)]
pub struct ChapterManager {
    queue: RequestQueue,
    trigger_config: ChapterTriggerConfig,
    memory_config: MemoryConfig,
}

impl ChapterManager {
    pub fn new(
        queue: RequestQueue,
        trigger_config: ChapterTriggerConfig,
        memory_config: MemoryConfig,
    ) -> Self {
        Self {
            queue,
            trigger_config,
            memory_config,
        }
    }

    /// Generate chapter one for a fresh story.
    pub async fn generate_first(&self, story: &Story) -> Result<Chapter, EngineError> {
        let context = format!(
            "You are the narrator of a collaborative mystery story.\nTitle: {}\nBackground: {}",
            story.title, story.background
        );
        let prompt = "Write the opening chapter. Set the scene, introduce the cast, and end \
                      with an unresolved hook the players can investigate.";
        let completion = self
            .queue
            .generate_story(1, None, GenerateRequest::new(context, prompt))
            .await?;
        tracing::info!(story = %story.id, model = %completion.model, "first chapter generated");
        Ok(Chapter::new(story.id, 1, completion.content))
    }

    /// Produce the 3–5 todo batch for a chapter. Falls back to deterministic
    /// objectives derived from the chapter text when the model reply is
    /// unusable.
    pub async fn generate_todos(&self, chapter: &Chapter) -> Vec<Todo> {
        let messages = vec![
            ChatMessage::system(TODO_SYSTEM_PROMPT),
            ChatMessage::user(format!("Chapter {}:\n{}", chapter.number, chapter.content)),
        ];
        let options = ChatOptions {
            max_tokens: 1024,
            temperature: 0.3,
            json: true,
        };
        let mut todos = match self.queue.chat(1, None, messages, options).await {
            Ok(completion) => parse_todos(chapter, &completion.content),
            Err(error) => {
                tracing::warn!(%error, "todo generation failed, using fallback objectives");
                Vec::new()
            }
        };
        if todos.len() < MIN_TODOS {
            fill_fallback_todos(chapter, &mut todos);
        }
        todos.truncate(MAX_TODOS);
        todos
    }

    /// The per-player story-machine opening for a fresh chapter.
    pub fn opening_message(player_name: &str, chapter: &Chapter, todos: &[Todo]) -> String {
        let objectives: Vec<String> = todos
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{}. {}", i + 1, t.content))
            .collect();
        format!(
            "{player_name}, chapter {} is underway. Tell me what you observe and suspect. \
             Your objectives:\n{}",
            chapter.number,
            objectives.join("\n")
        )
    }

    /// Run a full transition off the given active chapter. The caller holds
    /// no room lock while this awaits provider calls; persistence and state
    /// application happen afterwards under the room mailbox.
    pub async fn transition(
        &self,
        story: &Story,
        active: &Chapter,
        memory: &mut StoryMemory,
    ) -> Result<ChapterTransition, EngineError> {
        let ending = self
            .queue
            .summarize(1, None, active.content.clone())
            .await?;
        let summary = truncate_chars(&ending, self.memory_config.summary_max_chars);

        let mut completed = active.clone();
        completed.complete(&ending, summary.clone());

        memory.add_chapter_digest(active.number, summary.clone());
        let key_events = memory.absorb_chapter(&active.content);
        tracing::debug!(
            story = %story.id,
            chapter = active.number,
            key_events,
            "chapter absorbed into long-term memory"
        );

        let random_event = {
            let mut rng = rand::thread_rng();
            if rng.gen::<f64>() < self.trigger_config.random_event_probability {
                Some(RandomEventKind::draw(&mut rng))
            } else {
                None
            }
        };

        let bundle = memory.relevant_memories(
            &summary,
            &RetrievalLimits::chars(self.memory_config.context_char_budget),
        );
        let mut context = format!(
            "You are the narrator of a collaborative mystery story.\nTitle: {}\nBackground: {}\n\n\
             Previous chapter ended:\n{ending}",
            story.title, story.background
        );
        if !bundle.is_empty() {
            context.push_str("\n\n");
            context.push_str(&bundle.render());
        }
        let mut prompt = format!(
            "Write chapter {} continuing the story. Advance the investigation and end with a \
             new hook.",
            active.number + 1
        );
        if let Some(event) = random_event {
            prompt.push_str(&format!(" Along the way, {}.", event.prompt_hint()));
        }

        let completion = self
            .queue
            .generate_story(1, None, GenerateRequest::new(context, prompt))
            .await?;
        let next = Chapter::new(story.id, active.number + 1, completion.content);
        let todos = self.generate_todos(&next).await;

        tracing::info!(
            story = %story.id,
            from = active.number,
            to = next.number,
            random_event = ?random_event,
            "chapter transition generated"
        );

        Ok(ChapterTransition {
            completed,
            next,
            todos,
            random_event,
        })
    }

    /// Evaluate the auto-progression trigger policy for the active chapter.
    pub fn should_advance(
        &self,
        observations: &TriggerObservations,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<ChapterTrigger> {
        triggers::evaluate(&self.trigger_config, observations, now)
    }
}

fn parse_todos(chapter: &Chapter, reply: &str) -> Vec<Todo> {
    let Some(value) = extract_json(reply) else {
        return Vec::new();
    };
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let prompt = item.get("prompt").and_then(|p| p.as_str())?;
            let expected = item
                .get("expected_answer")
                .and_then(|e| e.as_str())
                .map(|e| e.to_string());
            let priority = item
                .get("priority")
                .and_then(|p| p.as_u64())
                .unwrap_or(3) as u8;
            Some(Todo::new(chapter.id, prompt, expected, priority))
        })
        .collect()
}

/// Deterministic objectives from the chapter text itself.
fn fill_fallback_todos(chapter: &Chapter, todos: &mut Vec<Todo>) {
    let sentences: Vec<&str> = chapter
        .content
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| s.split_whitespace().count() >= 4)
        .collect();
    for sentence in sentences {
        if todos.len() >= MIN_TODOS {
            return;
        }
        todos.push(Todo::new(
            chapter.id,
            format!("Investigate: {}", truncate_chars(sentence, 120)),
            None,
            3,
        ));
    }
    let generic = [
        "Describe what your character examines first",
        "Name the person you find most suspicious and why",
        "Share your current theory about what happened",
    ];
    for prompt in generic {
        if todos.len() >= MIN_TODOS {
            return;
        }
        todos.push(Todo::new(chapter.id, prompt, None, 3));
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{truncated}…")
}
