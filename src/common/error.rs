use thiserror::Error;

use crate::common::models::UserId;

/// Error type shared by the stores, the router and the collaborators.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Caller supplied something the engine refuses (past delivery time, empty body, ...).
    #[error("invalid request: {0}")]
    Validation(String),

    /// Only produced by direct fetch-by-id reads; mutations answer `false` instead.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("recipient {0} is offline")]
    RecipientOffline(UserId),

    #[error("request has no authenticated sender")]
    Unauthenticated,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("push delivery failed: {0}")]
    Push(String),
}

impl NotifyError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, NotifyError>;
