use thiserror::Error;

/// Errors surfaced by the event log, repositories and the cache manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Lookup, update or delete against an ID that does not exist.
    #[error("entity not found in {namespace}: {id}")]
    NotFound { namespace: String, id: String },

    /// Create against an ID that already exists.
    #[error("entity already exists in {namespace}: {id}")]
    AlreadyExists { namespace: String, id: String },

    /// The transaction was already committed or rolled back.
    #[error("transaction done")]
    TxDone,

    /// Commit or rollback without a transaction in the context.
    #[error("no transaction found in context")]
    NoTransaction,

    /// An optional capability is missing on the collaborator.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// The request context was cancelled.
    #[error("context canceled")]
    Cancelled,

    /// The request context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The entity has no ID and none could be generated for its ID type.
    #[error("missing id: {0}")]
    MissingId(String),

    /// Encoding or decoding an event payload failed.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("lock poisoned during {0}")]
    LockPoisoned(&'static str),

    /// Subscription setup or delivery failed.
    #[error("subscription error: {0}")]
    Subscription(String),
}

impl Error {
    pub(crate) fn not_found(namespace: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            namespace: namespace.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn already_exists(namespace: &str, id: impl std::fmt::Display) -> Self {
        Error::AlreadyExists {
            namespace: namespace.to_string(),
            id: id.to_string(),
        }
    }

    /// Whether this error is a `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether this error came from the request context.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
