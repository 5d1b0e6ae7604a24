pub mod fs_backend;
pub mod http_backend;
pub mod http_util;
pub mod retry;

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use iso_types::error::{IsoError, Result};
use iso_types::{Digest, Namespace};

pub use fs_backend::FileSystemStore;
pub use http_backend::IsolateServer;

/// A content-addressed object store holding the blobs of one namespace.
///
/// Implementations do not retry on their own; they classify failures through
/// [`IsoError::kind`] and let the caller's worker pool decide.
pub trait RemoteObjectStore: Send + Sync {
    /// Human readable location (URL or directory) for log lines.
    fn location(&self) -> &str;

    fn namespace(&self) -> &Namespace;

    /// Check which of `digests` are missing from the store.
    ///
    /// Returns the index into `digests` of every missing blob together with
    /// the ticket a later [`push`](Self::push) of that blob must be given.
    fn contains(&self, digests: &[Digest]) -> Result<Vec<(usize, PushTicket)>>;

    /// Upload one blob. `content` is already compressed when the namespace
    /// requires it. The same ticket may be passed again when retrying.
    fn push(&self, digest: &Digest, ticket: &PushTicket, content: &[u8]) -> Result<()>;

    /// Stream a blob starting at byte `offset` of its stored (possibly
    /// compressed) form.
    fn fetch(&self, digest: &Digest, offset: u64) -> Result<Box<dyn Read + Send>>;
}

/// Opaque per-blob upload state handed out by [`RemoteObjectStore::contains`].
///
/// Tracks which upload steps already succeeded so a retried push skips them.
#[derive(Debug)]
pub struct PushTicket {
    inner: TicketInner,
}

#[derive(Debug)]
enum TicketInner {
    Http {
        upload_url: String,
        finalize_url: Option<String>,
        uploaded: AtomicBool,
        finalized: AtomicBool,
    },
    Local,
}

impl PushTicket {
    /// Ticket for stores that need no negotiation, such as a directory.
    pub fn local() -> Self {
        Self {
            inner: TicketInner::Local,
        }
    }

    pub(crate) fn http(upload_url: String, finalize_url: Option<String>) -> Self {
        Self {
            inner: TicketInner::Http {
                upload_url,
                finalize_url,
                uploaded: AtomicBool::new(false),
                finalized: AtomicBool::new(false),
            },
        }
    }

    /// Whether every upload step has completed.
    pub fn is_done(&self) -> bool {
        match &self.inner {
            TicketInner::Http {
                finalize_url,
                uploaded,
                finalized,
                ..
            } => {
                uploaded.load(Ordering::Acquire)
                    && (finalize_url.is_none() || finalized.load(Ordering::Acquire))
            }
            TicketInner::Local => false,
        }
    }
}

/// Retry settings with exponential backoff and jitter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_retries() -> usize {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Everything needed to build a [`RemoteObjectStore`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// `http(s)://` server URL, `file://` URL or plain directory path.
    pub url: String,
    pub namespace: Namespace,
    pub token: Option<String>,
    pub read_timeout_secs: u64,
    pub allow_insecure_http: bool,
}

impl StorageConfig {
    pub fn new(url: impl Into<String>, namespace: Namespace) -> Self {
        Self {
            url: url.into(),
            namespace,
            token: None,
            read_timeout_secs: 300,
            allow_insecure_http: false,
        }
    }
}

/// Build the store matching the URL scheme of `cfg.url`.
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Box<dyn RemoteObjectStore>> {
    let url = cfg.url.trim();
    if url.is_empty() {
        return Err(IsoError::Config("server.url must not be empty".into()));
    }
    if url.starts_with("https://") {
        return Ok(Box::new(IsolateServer::new(cfg)?));
    }
    if let Some(rest) = url.strip_prefix("http://") {
        if !cfg.allow_insecure_http && !is_loopback_host(rest) {
            return Err(IsoError::Config(format!(
                "refusing plain HTTP to '{url}'; use https:// or set allow_insecure_http"
            )));
        }
        return Ok(Box::new(IsolateServer::new(cfg)?));
    }
    if url.contains("://") && !url.starts_with("file://") {
        return Err(IsoError::Config(format!("unsupported server url scheme: '{url}'")));
    }
    let path = url.strip_prefix("file://").unwrap_or(url);
    Ok(Box::new(FileSystemStore::new(path, cfg.namespace.clone())?))
}

fn is_loopback_host(rest: &str) -> bool {
    let authority = rest.split('/').next().unwrap_or("");
    let host = match authority.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or(""),
        None => authority.split(':').next().unwrap_or(""),
    };
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}
