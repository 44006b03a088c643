//! Bounded-concurrency request queue in front of the story provider
//!
//! Submissions carry an integer priority and an optional deadline. At most
//! `max_concurrent` provider calls run in parallel; among waiting tasks the
//! highest priority dispatches first, FIFO within a priority. Transient
//! failures are retried with linear backoff, each attempt bounded by the
//! per-call timeout and all attempts bounded by the caller deadline. A cached
//! health probe gates dispatch so an unavailable provider short-circuits
//! without burning attempts.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Notify, Semaphore};

use crate::config::QueueConfig;
use crate::provider::{
    ChatMessage, ChatOptions, Completion, GenerateRequest, ProviderError, ProviderHandle,
    StoryProvider,
};

/// Errors surfaced to queue callers.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The caller deadline elapsed before an attempt succeeded.
    #[error("Request deadline exceeded")]
    Timeout,

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Request queue is shutting down")]
    ShuttingDown,
}

/// The provider call a submission wants to run.
#[derive(Debug, Clone)]
enum RequestKind {
    Generate(GenerateRequest),
    Summarize(String),
    Chat(Vec<ChatMessage>, ChatOptions),
}

struct Submission {
    priority: i32,
    seq: u64,
    deadline: Option<Instant>,
    kind: RequestKind,
    responder: oneshot::Sender<Result<Completion, QueueError>>,
}

impl PartialEq for Submission {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Submission {}

impl PartialOrd for Submission {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Submission {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cached provider availability with a TTL, refreshed on demand.
struct AvailabilityCache {
    ttl: Duration,
    state: tokio::sync::Mutex<Option<(Instant, bool, Option<String>)>>,
}

impl AvailabilityCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: tokio::sync::Mutex::new(None),
        }
    }

    async fn ensure(&self, provider: &Arc<dyn StoryProvider>) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let fresh = matches!(&*state, Some((probed, _, _)) if probed.elapsed() < self.ttl);
        if !fresh {
            let health = provider.health_check().await;
            if !health.available {
                tracing::warn!(
                    provider = provider.name(),
                    reason = health.reason.as_deref().unwrap_or("unknown"),
                    "provider health probe failed"
                );
            }
            *state = Some((Instant::now(), health.available, health.reason));
        }
        match &*state {
            Some((_, true, _)) => Ok(()),
            Some((_, false, reason)) => Err(QueueError::ProviderUnavailable(
                reason.clone().unwrap_or_else(|| "provider unavailable".to_string()),
            )),
            None => Ok(()),
        }
    }

    async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}

struct QueueInner {
    provider: ProviderHandle,
    config: QueueConfig,
    heap: Mutex<BinaryHeap<Submission>>,
    seq: AtomicU64,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    availability: AvailabilityCache,
    shutting_down: AtomicBool,
}

/// The shared request queue. Cheap to clone.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    /// Create the queue and start its dispatch loop.
    pub fn new(provider: ProviderHandle, config: QueueConfig, availability_ttl: Duration) -> Self {
        let inner = Arc::new(QueueInner {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            provider,
            config,
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            availability: AvailabilityCache::new(availability_ttl),
            shutting_down: AtomicBool::new(false),
        });
        tokio::spawn(dispatch_loop(inner.clone()));
        Self { inner }
    }

    /// Generate narrative content through the provider.
    pub async fn generate_story(
        &self,
        priority: i32,
        deadline: Option<Instant>,
        request: GenerateRequest,
    ) -> Result<Completion, QueueError> {
        self.submit(priority, deadline, RequestKind::Generate(request))
            .await
    }

    /// Summarize a text through the provider.
    pub async fn summarize(
        &self,
        priority: i32,
        deadline: Option<Instant>,
        text: String,
    ) -> Result<String, QueueError> {
        self.submit(priority, deadline, RequestKind::Summarize(text))
            .await
            .map(|c| c.content)
    }

    /// Run a chat exchange through the provider.
    pub async fn chat(
        &self,
        priority: i32,
        deadline: Option<Instant>,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> Result<Completion, QueueError> {
        self.submit(priority, deadline, RequestKind::Chat(messages, options))
            .await
    }

    /// Check cached provider availability, refreshing on demand. Used by the
    /// engine to reject work before persisting anything.
    pub async fn ensure_available(&self) -> Result<(), QueueError> {
        let provider = self.inner.provider.get();
        self.inner.availability.ensure(&provider).await
    }

    /// Drop the cached health result so the next check re-probes.
    pub async fn invalidate_availability(&self) {
        self.inner.availability.invalidate().await;
    }

    /// Number of submissions waiting for dispatch.
    pub fn pending(&self) -> usize {
        self.inner.heap.lock().len()
    }

    /// Stop dispatching and fail all queued submissions.
    pub async fn shutdown(&self) {
        self.inner
            .shutting_down
            .store(true, AtomicOrdering::SeqCst);
        self.inner.notify.notify_waiters();
        let drained: Vec<Submission> = {
            let mut heap = self.inner.heap.lock();
            heap.drain().collect()
        };
        for submission in drained {
            let _ = submission.responder.send(Err(QueueError::ShuttingDown));
        }
        tracing::info!("request queue shut down");
    }

    async fn submit(
        &self,
        priority: i32,
        deadline: Option<Instant>,
        kind: RequestKind,
    ) -> Result<Completion, QueueError> {
        if self.inner.shutting_down.load(AtomicOrdering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        let submission = Submission {
            priority,
            seq: self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst),
            deadline,
            kind,
            responder: tx,
        };
        self.inner.heap.lock().push(submission);
        self.inner.notify.notify_one();
        rx.await.unwrap_or(Err(QueueError::ShuttingDown))
    }
}

async fn dispatch_loop(inner: Arc<QueueInner>) {
    loop {
        if inner.shutting_down.load(AtomicOrdering::SeqCst) {
            return;
        }
        if inner.heap.lock().is_empty() {
            inner.notify.notified().await;
            continue;
        }
        let permit = match inner.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let submission = inner.heap.lock().pop();
        match submission {
            Some(submission) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let result = run_submission(&inner, &submission.kind, submission.deadline).await;
                    let _ = submission.responder.send(result);
                    drop(permit);
                    inner.notify.notify_one();
                });
            }
            None => drop(permit),
        }
    }
}

async fn run_submission(
    inner: &QueueInner,
    kind: &RequestKind,
    deadline: Option<Instant>,
) -> Result<Completion, QueueError> {
    let provider = inner.provider.get();
    inner.availability.ensure(&provider).await?;

    let mut attempt: u32 = 1;
    loop {
        let per_attempt = inner.config.timeout;
        let effective = match deadline {
            Some(deadline) => {
                let remaining = deadline
                    .checked_duration_since(Instant::now())
                    .ok_or(QueueError::Timeout)?;
                per_attempt.min(remaining)
            }
            None => per_attempt,
        };

        let outcome = tokio::time::timeout(effective, execute(&provider, kind)).await;
        let error = match outcome {
            Ok(Ok(completion)) => return Ok(completion),
            Ok(Err(error)) => error,
            Err(_) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(QueueError::Timeout);
                }
                ProviderError::Timeout(effective)
            }
        };

        if !error.is_retryable() || attempt >= inner.config.max_retries {
            return Err(QueueError::Provider(error));
        }

        let delay = inner.config.retry_delay * attempt;
        if let Some(deadline) = deadline {
            if Instant::now() + delay >= deadline {
                return Err(QueueError::Timeout);
            }
        }
        tracing::debug!(attempt, ?delay, error = %error, "retrying provider call");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

async fn execute(
    provider: &Arc<dyn StoryProvider>,
    kind: &RequestKind,
) -> Result<Completion, ProviderError> {
    match kind {
        RequestKind::Generate(request) => provider.generate_story(request.clone()).await,
        RequestKind::Summarize(text) => {
            provider.summarize(text).await.map(|content| Completion {
                content,
                model: provider.name().to_string(),
                tokens: Default::default(),
            })
        }
        RequestKind::Chat(messages, options) => provider.chat(messages, options).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderHealth, ScriptedProvider};
    use async_trait::async_trait;

    fn queue_with(provider: Arc<ScriptedProvider>, config: QueueConfig) -> RequestQueue {
        RequestQueue::new(
            ProviderHandle::new(provider),
            config,
            Duration::from_secs(60),
        )
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            max_concurrent: 2,
            max_retries: 3,
            retry_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure(ProviderError::Transient("503".into()));
        provider.push_response("recovered");
        let queue = queue_with(provider.clone(), fast_config());

        let result = queue
            .generate_story(0, None, GenerateRequest::new("", "go"))
            .await
            .unwrap();
        assert_eq!(result.content, "recovered");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure(ProviderError::Permanent("401".into()));
        let queue = queue_with(provider.clone(), fast_config());

        let err = queue.summarize(0, None, "text".into()).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Provider(ProviderError::Permanent(_))
        ));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let provider = Arc::new(ScriptedProvider::new());
        for _ in 0..3 {
            provider.push_failure(ProviderError::Transient("503".into()));
        }
        let queue = queue_with(provider.clone(), fast_config());

        let err = queue.summarize(0, None, "text".into()).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Provider(ProviderError::Transient(_))
        ));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_provider_short_circuits() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.set_health(ProviderHealth::unavailable("maintenance"));
        let queue = queue_with(provider.clone(), fast_config());

        let err = queue.summarize(0, None, "text".into()).await.unwrap_err();
        assert!(matches!(err, QueueError::ProviderUnavailable(_)));
        // The probe ran but no completion call did.
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_availability_cached_until_invalidated() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.set_health(ProviderHealth::unavailable("maintenance"));
        let queue = queue_with(provider.clone(), fast_config());

        assert!(queue.ensure_available().await.is_err());
        // Recovery is not observed until the cache expires or is invalidated.
        provider.set_health(ProviderHealth::available());
        assert!(queue.ensure_available().await.is_err());
        queue.invalidate_availability().await;
        assert!(queue.ensure_available().await.is_ok());
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let provider = Arc::new(ScriptedProvider::new());
        for _ in 0..3 {
            provider.push_failure(ProviderError::Transient("503".into()));
        }
        let queue = queue_with(
            provider,
            QueueConfig {
                retry_delay: Duration::from_secs(10),
                ..fast_config()
            },
        );

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = queue
            .summarize(0, Some(deadline), "text".into())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Timeout));
    }

    /// Provider that parks calls until released, for observing dispatch order.
    struct GatedProvider {
        gate: tokio::sync::Semaphore,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StoryProvider for GatedProvider {
        async fn generate_story(
            &self,
            request: GenerateRequest,
        ) -> Result<Completion, ProviderError> {
            self.order.lock().push(request.prompt.clone());
            let _permit = self.gate.acquire().await.map_err(|_| {
                ProviderError::Transient("gate closed".into())
            })?;
            Ok(Completion {
                content: request.prompt,
                model: "gated".into(),
                tokens: Default::default(),
            })
        }

        async fn summarize(&self, text: &str) -> Result<String, ProviderError> {
            Ok(text.to_string())
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<Completion, ProviderError> {
            Ok(Completion {
                content: String::new(),
                model: "gated".into(),
                tokens: Default::default(),
            })
        }

        async fn health_check(&self) -> ProviderHealth {
            ProviderHealth::available()
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    #[tokio::test]
    async fn test_priority_order_among_waiting_tasks() {
        let provider = Arc::new(GatedProvider {
            gate: tokio::sync::Semaphore::new(0),
            order: Mutex::new(Vec::new()),
        });
        let queue = RequestQueue::new(
            ProviderHandle::new(provider.clone()),
            QueueConfig {
                max_concurrent: 1,
                ..fast_config()
            },
            Duration::from_secs(60),
        );

        // Occupy the single slot.
        let q = queue.clone();
        let first = tokio::spawn(async move {
            q.generate_story(0, None, GenerateRequest::new("", "first"))
                .await
        });
        // Wait until the first call is parked inside the provider.
        while provider.order.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // Two waiters: "low" submitted before "high", but "high" outranks it.
        let q = queue.clone();
        let low = tokio::spawn(async move {
            q.generate_story(0, None, GenerateRequest::new("", "low"))
                .await
        });
        let q = queue.clone();
        let high = tokio::spawn(async move {
            q.generate_story(5, None, GenerateRequest::new("", "high"))
                .await
        });
        while queue.pending() < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        provider.gate.add_permits(10);
        let _ = first.await.unwrap();
        let _ = low.await.unwrap();
        let _ = high.await.unwrap();

        let order = provider.order.lock().clone();
        assert_eq!(order, vec!["first", "high", "low"]);
    }
}
