//! Error kinds surfaced by the memory core.
//!
//! The host-facing API only ever sees [`MemError::NotFound`],
//! [`MemError::Validation`], [`MemError::Conflict`], and [`MemError::Internal`].
//! [`MemError::Retryable`] and [`MemError::Config`] exist for the AI provider
//! boundary: retryable failures are consumed by the provider chain, config
//! errors short-circuit fallback and degrade to the basic extractor.

use thiserror::Error;

pub type Result<T, E = MemError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MemError {
    /// Requested entity absent or filtered out by lineage.
    #[error("not found: {0}")]
    NotFound(String),

    /// Input violated a schema constraint.
    #[error("validation error: {0}")]
    Validation(String),

    /// Duplicate key or lineage violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient AI provider failure (rate-limit, 5xx, timeout).
    /// Never surfaced past the provider chain.
    #[error("retryable provider failure: {0}")]
    Retryable(String),

    /// Unauthorized, forbidden, or malformed request to an AI provider.
    /// Short-circuits provider fallback.
    #[error("provider configuration error: {0}")]
    Config(String),

    /// Programming errors or database corruption.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MemError {
    /// `true` for failures the provider chain may retry or fall through on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<rusqlite::Error> for MemError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("row not found".into()),
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(msg.unwrap_or_else(|| "constraint violation".into()))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for MemError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json: {err}"))
    }
}
