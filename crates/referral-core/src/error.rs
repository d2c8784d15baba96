use std::fmt;

use crate::db::store::StoreError;

/// Machine-readable error codes for callers that map engine outcomes to
/// user-facing responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    StoreUnavailable,
    UserNotFound,
    AlreadyHasParent,
    CycleDetected,
    InvalidUserId,
    StorageConflict,
    CorruptClosure,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::StoreUnavailable => "E1002",
            Self::UserNotFound => "E2001",
            Self::AlreadyHasParent => "E2002",
            Self::CycleDetected => "E2003",
            Self::InvalidUserId => "E2004",
            Self::StorageConflict => "E3001",
            Self::CorruptClosure => "E3002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::StoreUnavailable => "Referral store unavailable",
            Self::UserNotFound => "User not found in referral tree",
            Self::AlreadyHasParent => "User already has an upline",
            Self::CycleDetected => "Cycle would be created",
            Self::InvalidUserId => "Invalid user id",
            Self::StorageConflict => "Concurrent closure write conflict",
            Self::CorruptClosure => "Closure index inconsistent with uplines",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in referral.toml and retry."),
            Self::StoreUnavailable => Some("Check the database path and file permissions."),
            Self::UserNotFound => Some("Register the user before placing it in the tree."),
            Self::AlreadyHasParent => {
                Some("Use `refer move` to change an existing upline instead.")
            }
            Self::CycleDetected => Some("Pick a parent outside the user's own downline."),
            Self::InvalidUserId => Some("User ids must contain at least one non-space character."),
            Self::StorageConflict => Some("Retry; another mutation touched the same users."),
            Self::CorruptClosure => Some("Run `refer rebuild` to re-derive the closure index."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Failures reported by hierarchy operations.
///
/// The first five variants are typed, recoverable outcomes. [`Self::Db`]
/// carries infrastructure failures (I/O, locking timeouts, malformed data)
/// and is never recoverable. Any error returned from a mutation has already
/// rolled back its transaction.
#[derive(Debug, thiserror::Error)]
pub enum HierarchyError {
    /// A referenced user has no tree membership.
    #[error("user not found: '{0}'")]
    NotFound(String),

    /// The user already sits under `existing_parent`.
    #[error("user '{user_id}' already has upline '{existing_parent}'")]
    Conflict {
        user_id: String,
        existing_parent: String,
    },

    /// Placing `user_id` under `proposed_parent` would make it its own ancestor.
    #[error("placing '{user_id}' under '{proposed_parent}' would create a cycle")]
    CycleDetected {
        user_id: String,
        proposed_parent: String,
    },

    /// The id is empty or whitespace only.
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    /// A uniqueness constraint rejected a closure write; the transaction was
    /// rolled back.
    #[error("closure write conflict: {0}")]
    StorageConflict(String),

    #[error("database error: {0:#}")]
    Db(#[source] anyhow::Error),
}

impl HierarchyError {
    /// Machine-readable code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::UserNotFound,
            Self::Conflict { .. } => ErrorCode::AlreadyHasParent,
            Self::CycleDetected { .. } => ErrorCode::CycleDetected,
            Self::InvalidUserId(_) => ErrorCode::InvalidUserId,
            Self::StorageConflict(_) => ErrorCode::StorageConflict,
            Self::Db(_) => ErrorCode::InternalUnexpected,
        }
    }

    /// Whether the caller may reasonably retry, reject, or inform the user,
    /// as opposed to treating the failure as an outage.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Db(_))
    }

    pub(crate) fn cycle(user_id: &str, proposed_parent: &str) -> Self {
        Self::CycleDetected {
            user_id: user_id.to_string(),
            proposed_parent: proposed_parent.to_string(),
        }
    }
}

impl From<anyhow::Error> for HierarchyError {
    fn from(e: anyhow::Error) -> Self {
        Self::Db(e)
    }
}

impl From<rusqlite::Error> for HierarchyError {
    fn from(e: rusqlite::Error) -> Self {
        Self::from(StoreError::from(e))
    }
}

impl From<StoreError> for HierarchyError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation { .. } => Self::StorageConflict(e.to_string()),
            other => Self::Db(anyhow::Error::new(other)),
        }
    }
}
