use thiserror::Error;

/// Failures produced by a backend adapter.
///
/// `Unsupported` means the backend has no notion of the requested concept
/// (e.g. ad-hoc statements on Redis). `Driver` wraps the native driver's
/// message verbatim; this layer never retries.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Driver(String),
}

impl BackendError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    pub fn driver(err: impl std::fmt::Display) -> Self {
        Self::Driver(err.to_string())
    }
}

/// Errors surfaced to the caller through the response envelope.
///
/// Everything here is recovered — it becomes an error envelope, never a
/// process exit. The display strings are the user-visible messages (the
/// dispatcher prefixes them with "Error: ").
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("statement is not a read-only query: {0}")]
    InvalidStatementClass(String),
    #[error("write operations are disabled: server is running in read-only mode")]
    PolicyViolation,
    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Backend(String),
}

impl From<BackendError> for ToolError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unsupported(what) => ToolError::Unsupported(what),
            BackendError::Driver(msg) => ToolError::Backend(msg),
        }
    }
}

/// Startup-only failures. These terminate the process with a non-zero
/// status; nothing else does.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("POLYSTORE_BACKEND is not set")]
    MissingBackend,
    #[error("unrecognized backend '{0}' (expected postgres, mysql, sqlite, redis, mongodb, or ldap)")]
    UnknownBackend(String),
    #[error("no connection string: set {key} or DATABASE_URL")]
    MissingConnection { key: &'static str },
    #[error("duplicate operation name in catalog: {0}")]
    DuplicateOperation(String),
}
