//! Ledger error taxonomy
//!
//! Every store and engine operation returns [`LedgerError`]. Callers switch on
//! [`LedgerError::kind`] rather than on individual variants when they only need
//! to know how to react (translate, retry, or report).

use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Closed set of error kinds the HTTP layer and CLI dispatch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AlreadyCompleted,
    /// Request understood but refused by policy or validation
    Rejected,
    /// Timeouts and connectivity problems; safe for the caller to retry
    Transient,
    Internal,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("user not found")]
    UserNotFound,

    #[error("task not found")]
    TaskNotFound,

    #[error("referrer code not found")]
    ReferrerCodeNotFound,

    #[error("user already exists")]
    UserAlreadyExists,

    #[error("task already exists")]
    TaskAlreadyExists,

    #[error("task {task_id} already completed by user {user_id}")]
    AlreadyCompleted { task_id: i64, user_id: i64 },

    #[error("user {user_id} already redeemed a referrer code")]
    AlreadyRedeemed { user_id: i64 },

    #[error("users cannot redeem their own referrer code")]
    SelfReferral,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store operation timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UserNotFound | Self::TaskNotFound | Self::ReferrerCodeNotFound => {
                ErrorKind::NotFound
            }
            Self::UserAlreadyExists | Self::TaskAlreadyExists => ErrorKind::AlreadyExists,
            Self::AlreadyCompleted { .. } => ErrorKind::AlreadyCompleted,
            Self::AlreadyRedeemed { .. }
            | Self::SelfReferral
            | Self::InvalidCredentials
            | Self::InvalidInput(_) => ErrorKind::Rejected,
            Self::Timeout | Self::Unavailable(_) => ErrorKind::Transient,
            Self::InvariantViolation(_) | Self::Storage(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

// ============================================================================
// DRIVER ERROR CLASSIFICATION
// ============================================================================

impl From<tokio_postgres::Error> for LedgerError {
    fn from(err: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        if err.is_closed() {
            return Self::Unavailable(err.to_string());
        }
        match err.code() {
            // No SQLSTATE means the failure happened below the protocol (IO, TLS)
            None => Self::Unavailable(err.to_string()),
            Some(code) if *code == SqlState::QUERY_CANCELED => Self::Timeout,
            Some(code)
                if *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::T_R_DEADLOCK_DETECTED
                    || *code == SqlState::ADMIN_SHUTDOWN
                    || *code == SqlState::TOO_MANY_CONNECTIONS =>
            {
                Self::Unavailable(err.to_string())
            }
            Some(_) => Self::Storage(err.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for LedgerError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Timeout(_) => Self::Timeout,
            deadpool_postgres::PoolError::Backend(e) => e.into(),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::OperationInterrupted) => Self::Timeout,
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::Unavailable(err.to_string())
            }
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::SystemIoFailure) => {
                Self::Unavailable(err.to_string())
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(LedgerError::UserNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(LedgerError::TaskNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(LedgerError::ReferrerCodeNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            LedgerError::AlreadyCompleted {
                task_id: 1,
                user_id: 2
            }
            .kind(),
            ErrorKind::AlreadyCompleted
        );
        assert_eq!(LedgerError::SelfReferral.kind(), ErrorKind::Rejected);
        assert_eq!(
            LedgerError::InvariantViolation("x".to_string()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_transient() {
        assert!(LedgerError::Timeout.is_transient());
        assert!(LedgerError::Unavailable("down".to_string()).is_transient());
        assert!(!LedgerError::UserAlreadyExists.is_transient());
        assert!(!LedgerError::Storage("boom".to_string()).is_transient());
    }

    #[test]
    fn test_sqlite_interrupt_is_timeout() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
            None,
        );
        assert!(matches!(LedgerError::from(err), LedgerError::Timeout));

        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(LedgerError::from(err).is_transient());
    }
}
