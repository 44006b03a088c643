//! Engine error taxonomy and wire error codes

use thiserror::Error;

use super::RoomId;
use crate::provider::ProviderError;
use crate::queue::QueueError;
use crate::repository::RepositoryError;

/// Wire-level error codes surfaced to command callbacks and error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingParameters,
    InvalidInput,
    NotInRoom,
    RoomNotFound,
    PermissionDenied,
    EmptyMessage,
    MessageTooLong,
    InvalidMessageType,
    MissingRecipient,
    RequestTimeout,
    RateLimitExceeded,
    ProviderUnavailable,
    AiServiceError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingParameters => "MISSING_PARAMETERS",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
            ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::EmptyMessage => "EMPTY_MESSAGE",
            ErrorCode::MessageTooLong => "MESSAGE_TOO_LONG",
            ErrorCode::InvalidMessageType => "INVALID_MESSAGE_TYPE",
            ErrorCode::MissingRecipient => "MISSING_RECIPIENT",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            ErrorCode::AiServiceError => "AI_SERVICE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main engine error type. Validation, authorization, and state errors are
/// returned synchronously to the submitting command; provider errors are
/// caught at the request-queue boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Missing parameters: {0}")]
    MissingParameters(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Player is not a member of the room")]
    NotInRoom,

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message too long: {len} chars, max {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("Invalid message type: {0}")]
    InvalidMessageType(String),

    #[error("Recipient required for player-to-player messages")]
    MissingRecipient,

    #[error("Story has not been initialized")]
    StoryMissing,

    #[error("No active chapter")]
    NoActiveChapter,

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The wire code this error maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::MissingParameters(_) => ErrorCode::MissingParameters,
            EngineError::InvalidInput(_) => ErrorCode::InvalidInput,
            EngineError::NotInRoom => ErrorCode::NotInRoom,
            EngineError::RoomNotFound(_) => ErrorCode::RoomNotFound,
            EngineError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            EngineError::EmptyMessage => ErrorCode::EmptyMessage,
            EngineError::MessageTooLong { .. } => ErrorCode::MessageTooLong,
            EngineError::InvalidMessageType(_) => ErrorCode::InvalidMessageType,
            EngineError::MissingRecipient => ErrorCode::MissingRecipient,
            EngineError::StoryMissing | EngineError::NoActiveChapter => ErrorCode::InvalidInput,
            EngineError::Timeout => ErrorCode::RequestTimeout,
            EngineError::RateLimited => ErrorCode::RateLimitExceeded,
            EngineError::Provider(e) => provider_code(e),
            EngineError::Queue(e) => queue_code(e),
            EngineError::Repository(_) => ErrorCode::InternalError,
            EngineError::ShuttingDown => ErrorCode::InternalError,
            EngineError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

fn provider_code(e: &ProviderError) -> ErrorCode {
    match e {
        ProviderError::Unavailable(_) => ErrorCode::ProviderUnavailable,
        ProviderError::Timeout(_) => ErrorCode::RequestTimeout,
        ProviderError::RateLimited { .. } => ErrorCode::RateLimitExceeded,
        ProviderError::Transient(_) | ProviderError::Permanent(_) => ErrorCode::AiServiceError,
    }
}

fn queue_code(e: &QueueError) -> ErrorCode {
    match e {
        QueueError::ProviderUnavailable(_) => ErrorCode::ProviderUnavailable,
        QueueError::Timeout => ErrorCode::RequestTimeout,
        QueueError::Provider(p) => provider_code(p),
        QueueError::ShuttingDown => ErrorCode::InternalError,
    }
}

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;
