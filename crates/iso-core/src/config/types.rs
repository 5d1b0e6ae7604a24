use serde::{Deserialize, Serialize};

use iso_storage::RetryConfig;
use iso_types::Namespace;

use super::defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub threads: ThreadsConfig,
    /// Seconds without progress before thread state is dumped.
    #[serde(default = "default_deadlock_timeout_secs")]
    pub deadlock_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// `http(s)://` isolate server, `file://` URL or plain directory.
    pub url: String,
    #[serde(default)]
    pub namespace: Namespace,
    /// Bearer token sent to the server, if any.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Allow `http://` to hosts other than loopback.
    #[serde(default)]
    pub allow_insecure_http: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache directory. Default: platform cache dir + "isolate".
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// 0 keeps entries regardless of age.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_size: default_max_size(),
            min_free_space: default_min_free_space(),
            max_items: default_max_items(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadsConfig {
    #[serde(default = "default_net_threads")]
    pub net_threads: usize,
    #[serde(default = "default_cpu_threads")]
    pub cpu_threads: usize,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            net_threads: default_net_threads(),
            cpu_threads: default_cpu_threads(),
        }
    }
}
