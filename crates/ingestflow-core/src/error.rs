// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ingestflow-core.
//!
//! Every engine entry point returns [`EngineError`]. Each variant carries a
//! stable error code so that callers (the result consumer, an operator tool)
//! can decide whether to redeliver a message or drop it.

use std::fmt;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while applying workflow operations.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineError {
    /// Scene was not found in the store.
    SceneNotFound {
        /// The scene identifier (numeric ID or source ID) that was not found.
        scene_id: String,
    },

    /// Tile was not found in the store.
    TileNotFound {
        /// The tile identifier that was not found.
        tile_id: String,
    },

    /// Area of interest was not found.
    AoiNotFound {
        /// The AOI identifier that was not found.
        aoi_id: String,
    },

    /// Entity already exists (duplicate ingestion or AOI creation).
    AlreadyExists {
        /// Kind of entity ("scene", "tile", "aoi").
        kind: &'static str,
        /// Identifier of the existing entity.
        id: String,
    },

    /// Entity is in a state that does not allow the requested operation.
    InvalidState {
        /// Kind of entity.
        entity: &'static str,
        /// Identifier of the entity.
        id: String,
        /// What went wrong.
        details: String,
    },

    /// A cascade found the store in a state that must never exist.
    ///
    /// The whole unit of work is rolled back when this is raised.
    InvariantViolation {
        /// The operation that detected the violation.
        operation: &'static str,
        /// Violation details.
        details: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Publishing jobs to the bus failed.
    PublishError {
        /// The topic being published to.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The operation was cancelled before it committed.
    Cancelled {
        /// The operation that was cancelled.
        operation: &'static str,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SceneNotFound { .. } => "SCENE_NOT_FOUND",
            Self::TileNotFound { .. } => "TILE_NOT_FOUND",
            Self::AoiNotFound { .. } => "AOI_NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::PublishError { .. } => "PUBLISH_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
        }
    }

    /// Whether redelivering the same request may succeed.
    ///
    /// Only transient infrastructure failures are retryable. Not-found,
    /// validation and invariant errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError { .. } | Self::PublishError { .. }
        )
    }

    /// Maps a sqlx error to a `DatabaseError` tagged with the given operation.
    pub(crate) fn db(operation: &'static str) -> impl Fn(sqlx::Error) -> EngineError {
        move |err| EngineError::DatabaseError {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }

    pub(crate) fn invariant(operation: &'static str, details: impl Into<String>) -> Self {
        EngineError::InvariantViolation {
            operation,
            details: details.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SceneNotFound { scene_id } => write!(f, "Scene '{}' not found", scene_id),
            Self::TileNotFound { tile_id } => write!(f, "Tile '{}' not found", tile_id),
            Self::AoiNotFound { aoi_id } => write!(f, "AOI '{}' not found", aoi_id),
            Self::AlreadyExists { kind, id } => {
                write!(f, "{} '{}' already exists", kind, id)
            }
            Self::InvalidState {
                entity,
                id,
                details,
            } => {
                write!(f, "{} '{}' is in invalid state: {}", entity, id, details)
            }
            Self::InvariantViolation { operation, details } => {
                write!(f, "Invariant violated during '{}': {}", operation, details)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::PublishError { operation, details } => {
                write!(f, "Publish error on '{}': {}", operation, details)
            }
            Self::Cancelled { operation } => write!(f, "Operation '{}' was cancelled", operation),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
