use std::fmt;

use thiserror::Error;

/// Stable machine-readable codes for rejected input.
///
/// The string form is part of the public API contract; SDKs switch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MissingTenantId,
    MissingServiceGroupId,
    MissingServiceName,
    MissingServiceInstanceId,
    MissingHostAddress,
    InvalidPortNumber,
    InvalidWeight,
    InvalidStatus,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingTenantId => "MISSING_TENANT_ID",
            Self::MissingServiceGroupId => "MISSING_SERVICE_GROUP_ID",
            Self::MissingServiceName => "MISSING_SERVICE_NAME",
            Self::MissingServiceInstanceId => "MISSING_SERVICE_INSTANCE_ID",
            Self::MissingHostAddress => "MISSING_HOST_ADDRESS",
            Self::InvalidPortNumber => "INVALID_PORT_NUMBER",
            Self::InvalidWeight => "INVALID_WEIGHT",
            Self::InvalidStatus => "INVALID_STATUS",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{code}: {message}")]
    Validation { code: ErrorCode, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No available instance: {0}")]
    NoAvailableInstance(String),

    #[error("Optimistic lock conflict")]
    OptimisticLockConflict,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Deserialization error: {context}")]
    Deserialization { context: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// The validation code, if this is a rejected-input error
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Validation { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Stable reply code for a failed operation.
    ///
    /// `not_found` names what the operation targets (`INSTANCE_NOT_FOUND`,
    /// `SERVICE_NOT_FOUND`); `failed` is the per-operation fallback.
    #[must_use]
    pub fn reply_code(&self, not_found: &'static str, failed: &'static str) -> &'static str {
        match self {
            Self::Validation { code, .. } => code.as_str(),
            Self::NotFound(_) => not_found,
            Self::NoAvailableInstance(_) => "NO_AVAILABLE_INSTANCE",
            Self::OptimisticLockConflict => "VERSION_CONFLICT",
            _ => failed,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().unwrap_or_default();
                match code.as_ref() {
                    // PostgreSQL unique_violation
                    "23505" => Self::AlreadyExists(db_err.message().to_string()),
                    // PostgreSQL foreign_key_violation
                    "23503" => Self::NotFound("Referenced resource not found".to_string()),
                    _ => Self::Database(err),
                }
            }
            _ => Self::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
