//! Error types for query engine operations

use thiserror::Error;

use crate::cursor::CursorError;

/// Errors that can occur while parsing, building or executing a query
#[derive(Debug, Error)]
pub enum DataApiError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Invalid query parameter: {0}")]
    InvalidParam(String),

    #[error("Invalid cursor: {0}")]
    Cursor(#[from] CursorError),

    #[error("Row-level security setup failed: {0}")]
    RlsSetup(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Integrity constraint categories callers commonly surface to users
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintViolation {
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    CheckViolation,
}

impl ConstraintViolation {
    /// Map a PostgreSQL SQLSTATE code
    pub fn from_sqlstate(code: &str) -> Option<Self> {
        match code {
            "23505" => Some(Self::UniqueViolation),
            "23503" => Some(Self::ForeignKeyViolation),
            "23502" => Some(Self::NotNullViolation),
            "23514" => Some(Self::CheckViolation),
            _ => None,
        }
    }
}

impl DataApiError {
    pub fn invalid_filter(msg: impl Into<String>) -> Self {
        Self::InvalidFilter(msg.into())
    }

    pub fn invalid_order(msg: impl Into<String>) -> Self {
        Self::InvalidOrder(msg.into())
    }

    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    pub fn rls_setup(msg: impl Into<String>) -> Self {
        Self::RlsSetup(msg.into())
    }

    /// Whether the error is attributable to client input (4xx, never retried)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFilter(_) | Self::InvalidOrder(_) | Self::InvalidParam(_) | Self::Cursor(_)
        )
    }

    /// Integrity constraint category of a database error, if any
    ///
    /// The error itself is left untouched; this only helps callers choose a
    /// user-facing message.
    pub fn constraint_violation(&self) -> Option<ConstraintViolation> {
        match self {
            Self::Sql(sqlx::Error::Database(db_err)) => db_err
                .code()
                .and_then(|code| ConstraintViolation::from_sqlstate(&code)),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DataApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors() {
        assert!(DataApiError::invalid_filter("bad").is_client_error());
        assert!(DataApiError::invalid_order("bad").is_client_error());
        assert!(DataApiError::invalid_param("bad").is_client_error());
        assert!(DataApiError::from(CursorError::MissingColumn).is_client_error());
        assert!(!DataApiError::rls_setup("role").is_client_error());
        assert!(!DataApiError::Sql(sqlx::Error::RowNotFound).is_client_error());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            DataApiError::invalid_filter("Unknown operator 'zz'").to_string(),
            "Invalid filter: Unknown operator 'zz'"
        );
        assert_eq!(
            DataApiError::rls_setup("bad role").to_string(),
            "Row-level security setup failed: bad role"
        );
    }

    #[test]
    fn test_constraint_violation_codes() {
        assert_eq!(
            ConstraintViolation::from_sqlstate("23505"),
            Some(ConstraintViolation::UniqueViolation)
        );
        assert_eq!(
            ConstraintViolation::from_sqlstate("23503"),
            Some(ConstraintViolation::ForeignKeyViolation)
        );
        assert_eq!(
            ConstraintViolation::from_sqlstate("23502"),
            Some(ConstraintViolation::NotNullViolation)
        );
        assert_eq!(
            ConstraintViolation::from_sqlstate("23514"),
            Some(ConstraintViolation::CheckViolation)
        );
        assert_eq!(ConstraintViolation::from_sqlstate("42P01"), None);
        assert_eq!(
            DataApiError::Sql(sqlx::Error::RowNotFound).constraint_violation(),
            None
        );
    }
}
