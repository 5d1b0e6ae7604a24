use thiserror::Error;

pub type Result<T> = std::result::Result<T, IsoError>;

/// How a failed operation should be treated by the retry wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The object is not there yet; the store may be eventually consistent.
    NotFoundYet,
    /// Network hiccup, server overload or a corrupt transfer. Retry.
    Transient,
    /// Retrying cannot help.
    Fatal,
}

#[derive(Debug, Error)]
pub enum IsoError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid manifest field '{field}': {reason}")]
    Manifest { field: String, reason: String },

    #[error("unsupported manifest version: {0}")]
    UnsupportedVersion(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("transfer of {digest} failed: {reason}")]
    Transfer { digest: String, reason: String },

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("network error: {0}")]
    Transport(String),

    #[error("{context}: HTTP {status}")]
    Http { status: u16, context: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not enough space: {0}")]
    NoMoreSpace(String),

    #[error("manifest {0} is included recursively")]
    RecursiveInclude(String),

    #[error("{digest} could not be retrieved: {source}")]
    Unretrievable {
        digest: String,
        #[source]
        source: Box<IsoError>,
    },

    #[error("cache miss: {0}")]
    CacheMiss(String),

    #[error("failed to store {digest} in cache: {reason}")]
    CacheWrite { digest: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("operation aborted")]
    Aborted,

    #[error("{0}")]
    Other(String),
}

impl IsoError {
    /// Classify for the retry wrapper.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IsoError::Http { status: 404, .. } => ErrorKind::NotFoundYet,
            IsoError::Http { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::Transient
            }
            IsoError::Transport(_) | IsoError::Transfer { .. } | IsoError::Decompression(_) => {
                ErrorKind::Transient
            }
            IsoError::Io(e) if is_retryable_io(e) => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Fatal
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
