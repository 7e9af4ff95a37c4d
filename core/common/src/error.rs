//! Common error types for tablesync.

use thiserror::Error;

/// Error codes returned by the remote collaborator that drive local
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The uuid of a created object is already taken on the server.
    #[error("uuid already in use")]
    UuidAlreadyInUse,

    /// The object does not exist on the server.
    #[error("table object does not exist")]
    TableObjectDoesNotExist,

    /// The session user may not perform this action.
    #[error("action not allowed")]
    ActionNotAllowed,

    /// The access token expired and must be renewed.
    #[error("session expired")]
    SessionExpired,

    /// No user-access record exists for the object.
    #[error("table object user access does not exist")]
    UserAccessDoesNotExist,

    /// Any other server error.
    #[error("remote error {code}: {message}")]
    Other { code: i32, message: String },
}

/// Top-level error type for tablesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server rejected the request.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Network or transport failure talking to the server.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No session is stored locally.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The session could not be renewed; the user must log in again.
    #[error("Session invalid")]
    SessionInvalid,

    /// The sync scheduler is not running.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Storage(msg) => Error::Storage(msg.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Serialization(msg) => Error::Serialization(msg.clone()),
            Error::InvalidInput(msg) => Error::InvalidInput(msg.clone()),
            Error::NotFound(msg) => Error::NotFound(msg.clone()),
            Error::Remote(e) => Error::Remote(e.clone()),
            Error::Transport(msg) => Error::Transport(msg.clone()),
            Error::NotAuthenticated => Error::NotAuthenticated,
            Error::SessionInvalid => Error::SessionInvalid,
            Error::Scheduler(msg) => Error::Scheduler(msg.clone()),
        }
    }
}

impl Error {
    /// The remote error code carried by this error, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Error::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
