//! Error types for the community access core

use serde::Serialize;
use thiserror::Error;

/// Result type alias for community operations
pub type OasisResult<T> = Result<T, OasisError>;

/// Why a token failed the activity check at consumption time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    Disabled,
    Expired,
    Exhausted,
}

impl std::fmt::Display for InactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InactiveReason::Disabled => write!(f, "disabled"),
            InactiveReason::Expired => write!(f, "expired"),
            InactiveReason::Exhausted => write!(f, "use limit reached"),
        }
    }
}

/// Coarse error classes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    TokenInactive,
    Validation,
    Unauthorized,
    Transient,
    Internal,
}

/// Community module error types
#[derive(Debug, Error)]
pub enum OasisError {
    #[error("Community not found: {0}")]
    CommunityNotFound(String),

    #[error("Token not found: {0}")]
    TokenNotFound(String),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Invite token is no longer valid ({reason})")]
    TokenInactive { reason: InactiveReason },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Member already exists in community: {user_id}")]
    MemberExists { user_id: String },

    #[error("The community owner cannot be modified or removed")]
    CannotModifyOwner,

    #[error("Unauthorized: {action}")]
    Unauthorized { action: String },

    #[error("Store temporarily unavailable: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for OasisError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_) => OasisError::Transient(err.to_string()),
            sqlx::Error::Database(ref db_err) if is_busy(db_err.message()) => {
                OasisError::Transient(err.to_string())
            }
            _ => OasisError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OasisError {
    fn from(err: serde_json::Error) -> Self {
        OasisError::Serialization(err.to_string())
    }
}

fn is_busy(message: &str) -> bool {
    message.contains("database is locked") || message.contains("database is busy")
}

/// Serializable error payload for callers rendering messages
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retriable: bool,
}

impl OasisError {
    /// Shorthand for an authorization failure
    pub fn unauthorized(action: impl Into<String>) -> Self {
        OasisError::Unauthorized {
            action: action.into(),
        }
    }

    /// Collapse onto the error classes of the access-control contract
    pub fn kind(&self) -> ErrorKind {
        match self {
            OasisError::CommunityNotFound(_)
            | OasisError::TokenNotFound(_)
            | OasisError::MemberNotFound(_)
            | OasisError::RoleNotFound(_) => ErrorKind::NotFound,

            OasisError::TokenInactive { .. } => ErrorKind::TokenInactive,

            OasisError::Validation(_)
            | OasisError::MemberExists { .. }
            | OasisError::CannotModifyOwner => ErrorKind::Validation,

            OasisError::Unauthorized { .. } => ErrorKind::Unauthorized,

            OasisError::Transient(_) => ErrorKind::Transient,

            OasisError::Database(_) | OasisError::Serialization(_) | OasisError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            OasisError::CommunityNotFound(_) => "COMMUNITY_NOT_FOUND",
            OasisError::TokenNotFound(_) => "TOKEN_NOT_FOUND",
            OasisError::MemberNotFound(_) => "MEMBER_NOT_FOUND",
            OasisError::RoleNotFound(_) => "ROLE_NOT_FOUND",
            OasisError::TokenInactive { .. } => "TOKEN_INACTIVE",
            OasisError::Validation(_) => "VALIDATION_ERROR",
            OasisError::MemberExists { .. } => "MEMBER_EXISTS",
            OasisError::CannotModifyOwner => "CANNOT_MODIFY_OWNER",
            OasisError::Unauthorized { .. } => "UNAUTHORIZED",
            OasisError::Transient(_) => "TRANSIENT",
            OasisError::Database(_) => "DATABASE_ERROR",
            OasisError::Serialization(_) => "SERIALIZATION_ERROR",
            OasisError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Only transient store failures are safe to retry
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            retriable: self.is_retriable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_variants_share_kind() {
        assert_eq!(OasisError::TokenNotFound("t".into()).kind(), ErrorKind::NotFound);
        assert_eq!(OasisError::CommunityNotFound("c".into()).kind(), ErrorKind::NotFound);
        assert_eq!(OasisError::RoleNotFound("r".into()).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_inactive_is_distinct_from_not_found() {
        let err = OasisError::TokenInactive {
            reason: InactiveReason::Expired,
        };
        assert_eq!(err.kind(), ErrorKind::TokenInactive);
        assert_eq!(err.code(), "TOKEN_INACTIVE");
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err: OasisError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retriable());

        let err: OasisError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_retriable());
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_body() {
        let body = OasisError::unauthorized("create permanent token").to_body();
        assert_eq!(body.code, "UNAUTHORIZED");
        assert!(!body.retriable);
    }
}
