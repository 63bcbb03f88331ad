use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

/// Domain errors for Strata. Variants map directly onto the HTTP status
/// codes the server answers with, so kinds survive a network hop.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("divergent data: {0}")]
    Divergent(String),

    #[error("cancelled")]
    Cancelled,

    #[error("transient: {0}")]
    Transient(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl StrataError {
    /// Transient errors are retried inside long-running loops; everything
    /// else bubbles to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, StrataError::Transient(_) | StrataError::Http(_))
    }

    /// Status code the server answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            StrataError::InvalidArgument(_) => 400,
            StrataError::PermissionDenied(_) => 403,
            StrataError::NotFound(_) => 404,
            StrataError::AlreadyExists(_) => 409,
            StrataError::Divergent(_) => 409,
            StrataError::Cancelled => 499,
            StrataError::Transient(_) | StrataError::Http(_) => 503,
            _ => 500,
        }
    }

    /// Reconstruct an error kind from a remote node's status code, so the
    /// kind survives the hop through the internal API.
    pub fn from_status(status: u16, message: String) -> StrataError {
        match status {
            400 => StrataError::InvalidArgument(message),
            403 => StrataError::PermissionDenied(message),
            404 => StrataError::NotFound(message),
            409 => StrataError::AlreadyExists(message),
            499 => StrataError::Cancelled,
            503 => StrataError::Transient(message),
            _ => StrataError::Internal(message),
        }
    }
}
