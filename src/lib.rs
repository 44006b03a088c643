//! Storyhost: game-room coordination engine
//!
//! A real-time, multi-tenant coordination engine for AI-driven collaborative
//! mystery games. Rooms host players and a persistent story of ordered
//! chapters; the engine drives chapter generation through a pluggable
//! language-model provider, collects per-player feedback on private
//! story-machine channels, evaluates it against chapter objectives, and
//! advances chapters on progression or timeout.
//!
//! Transport, authentication, and the concrete provider HTTP stack live
//! outside this crate: embedders feed commands into [`RoomEngine`] and
//! subscribe to events through an [`bus::EventBus`] implementation.

pub mod bus;
pub mod chapter;
pub mod config;
pub mod engine;
pub mod feedback;
pub mod memory;
pub mod provider;
pub mod queue;
pub mod repository;
pub mod types;

// Re-export commonly used types
pub use bus::{EngineEvent, EventBus, RecordingBus, Scope, SessionBus};
pub use config::{Config, ConfigError};
pub use engine::{RoomEngine, SendMessageRequest, SendMessageResponse};
pub use provider::{
    Completion, HttpProvider, ProviderError, ProviderHandle, ProviderHealth, ScriptedProvider,
    StoryProvider,
};
pub use queue::{QueueError, RequestQueue};
pub use repository::{Repository, RepositoryError, SqliteRepository};
pub use types::*;

use std::sync::Arc;

/// The assembled runtime: repository, provider slot, request queue, bus, and
/// engine, constructed at startup with explicit lifecycles.
pub struct GameRuntime {
    config: Arc<Config>,
    repository: Arc<dyn Repository>,
    provider: ProviderHandle,
    queue: RequestQueue,
    engine: Arc<RoomEngine>,
    checkpoint_task: Option<tokio::task::JoinHandle<()>>,
}

impl GameRuntime {
    /// Assemble a runtime from configuration, a provider, and an event bus.
    pub async fn new(
        config: Config,
        provider: Arc<dyn StoryProvider>,
        bus: Arc<dyn EventBus>,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        let config = Arc::new(config);

        let repository: Arc<dyn Repository> = match &config.repository.path {
            Some(path) => Arc::new(SqliteRepository::open(path)?),
            None => Arc::new(SqliteRepository::open_in_memory()?),
        };

        let provider = ProviderHandle::new(provider);
        let queue = RequestQueue::new(
            provider.clone(),
            config.queue.clone(),
            config.provider.availability_ttl,
        );
        let engine = Arc::new(RoomEngine::new(
            repository.clone(),
            queue.clone(),
            bus,
            config.clone(),
        ));

        let checkpoint_task = config.repository.path.as_ref().map(|_| {
            let repository = repository.clone();
            let interval = config.repository.checkpoint_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(error) = repository.checkpoint().await {
                        tracing::warn!(%error, "repository checkpoint failed");
                    }
                }
            })
        });

        tracing::info!("game runtime initialized");
        Ok(Self {
            config,
            repository,
            provider,
            queue,
            engine,
            checkpoint_task,
        })
    }

    pub fn engine(&self) -> &Arc<RoomEngine> {
        &self.engine
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Swap the active provider (explicit configuration reload). The cached
    /// availability probe is dropped so the next call sees the new backend.
    pub async fn reload_provider(&self, provider: Arc<dyn StoryProvider>) {
        self.provider.reload(provider);
        self.queue.invalidate_availability().await;
    }

    /// Shut the runtime down in reverse order of construction.
    pub async fn shutdown(&mut self) {
        tracing::info!("game runtime shutting down");
        self.engine.shutdown().await;
        self.queue.shutdown().await;
        if let Some(task) = self.checkpoint_task.take() {
            task.abort();
        }
        if let Err(error) = self.repository.checkpoint().await {
            tracing::debug!(%error, "final checkpoint failed");
        }
    }
}
