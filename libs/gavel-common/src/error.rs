use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced synchronously to judge callers.
///
/// Execution-phase outcomes (compile errors, runtime errors, timeouts, wrong
/// answers) are verdict data, never values of this type.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("invalid submission: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("judge is at capacity, retry later")]
    Capacity,

    #[error("submission {0} not found")]
    NotFound(Uuid),

    #[error("internal judge error: {0}")]
    Internal(String),

    #[error("result store error: {0}")]
    Store(String),
}

impl JudgeError {
    pub fn validation(message: impl Into<String>) -> Self {
        JudgeError::Validation(vec![message.into()])
    }
}

impl From<redis::RedisError> for JudgeError {
    fn from(e: redis::RedisError) -> Self {
        JudgeError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for JudgeError {
    fn from(e: serde_json::Error) -> Self {
        JudgeError::Store(format!("serialization error: {}", e))
    }
}

pub type JudgeResult<T> = Result<T, JudgeError>;
