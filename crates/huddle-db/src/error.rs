use huddle_types::api::ErrorKind;
use rusqlite::ErrorCode;

/// Failure of a chat operation. Validation failures are reported to the
/// originating caller only; store failures mean nothing was applied.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Actor lacks permission for the room or request
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Actor is not the principal required for this transition
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("attachment unavailable: {0}")]
    AttachmentUnavailable(String),

    /// Transient; callers retry with backoff
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid input: {0}")]
    Invalid(String),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotAuthorized(_) => ErrorKind::NotAuthorized,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AttachmentUnavailable(_) => ErrorKind::AttachmentUnavailable,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Invalid(_) => ErrorKind::Invalid,
        }
    }
}

/// Unique/check constraint violations are the storage-level backstop for
/// uniqueness invariants, so they surface as `Conflict`.
impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
                Self::Conflict(e.to_string())
            }
            _ => Self::StoreUnavailable(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
