//! Shared harness for engine integration tests

use std::sync::Arc;
use std::time::Duration;

use storyhost::bus::RecordingBus;
use storyhost::config::Config;
use storyhost::provider::ScriptedProvider;
use storyhost::{GameRuntime, RoomEngine};

pub struct Harness {
    pub runtime: GameRuntime,
    pub provider: Arc<ScriptedProvider>,
    pub bus: Arc<RecordingBus>,
}

impl Harness {
    pub fn engine(&self) -> &Arc<RoomEngine> {
        self.runtime.engine()
    }
}

/// Test configuration: sequential queue dispatch for deterministic scripted
/// responses, fast retries, short grace periods.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.queue.max_concurrent = 1;
    config.queue.retry_delay = Duration::from_millis(1);
    config.engine.empty_room_grace_period = Duration::from_millis(150);
    config
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub async fn harness(config: Config) -> Harness {
    init_tracing();
    let provider = Arc::new(ScriptedProvider::new());
    let bus = Arc::new(RecordingBus::new());
    let runtime = GameRuntime::new(config, provider.clone(), bus.clone())
        .await
        .expect("runtime boots");
    Harness {
        runtime,
        provider,
        bus,
    }
}

/// Scripted responses for a full story initialization: the first chapter and
/// its todo batch (three todos with expected answers).
pub fn script_story_init(provider: &ScriptedProvider) {
    provider.push_response(
        "The gates of Harrow House swing open at dusk. Seven guests, one locked study, and a \
         letter nobody admits to writing.",
    );
    provider.push_response(
        r#"[{"prompt": "Find out who wrote the letter", "expected_answer": "the housekeeper wrote the letter", "priority": 5},
            {"prompt": "Locate the study key", "expected_answer": "the key hangs in the pantry", "priority": 4},
            {"prompt": "Establish where the colonel was at dusk", "expected_answer": "the colonel was in the garden", "priority": 3}]"#,
    );
}

/// Scripted responses for one chapter transition: ending summary, next
/// chapter, todo batch.
pub fn script_transition(provider: &ScriptedProvider, next_chapter_text: &str) {
    provider.push_response("The first night ends with the letter unclaimed.");
    provider.push_response(next_chapter_text);
    provider.push_response(
        r#"[{"prompt": "Ask about the broken window", "expected_answer": "it broke from inside", "priority": 4},
            {"prompt": "Find the gardener", "expected_answer": "he left before dawn", "priority": 3},
            {"prompt": "Check the cellar door", "expected_answer": "it was bolted", "priority": 3}]"#,
    );
}

/// Poll until `condition` holds or the deadline passes.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
