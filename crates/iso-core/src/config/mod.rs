mod defaults;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use iso_storage::{backend_from_config, StorageConfig};

use crate::cache::{CachePolicy, ContentAddressedCache, DiskCache, MemoryCache};
use crate::error::{IsoError, Result};
use crate::storage::{Storage, StorageOptions};

pub use self::types::*;

/// Read and validate a YAML client configuration.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| IsoError::Config(format!("cannot read '{}': {e}", path.display())))?;
    let config = ClientConfig::from_yaml(&contents)
        .map_err(|e| IsoError::Config(format!("invalid config '{}': {e}", path.display())))?;
    debug!(path = %path.display(), "config loaded");
    Ok(config)
}

impl ClientConfig {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: ClientConfig =
            serde_yaml::from_str(contents).map_err(|e| IsoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.url.trim().is_empty() {
            return Err(IsoError::Config("server.url must not be empty".into()));
        }
        if self.threads.net_threads == 0 {
            return Err(IsoError::Config("threads.net_threads must be at least 1".into()));
        }
        if self.threads.cpu_threads == 0 {
            return Err(IsoError::Config("threads.cpu_threads must be at least 1".into()));
        }
        if self.deadlock_timeout_secs == 0 {
            return Err(IsoError::Config(
                "deadlock_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn storage_config(&self) -> Result<StorageConfig> {
        Ok(StorageConfig {
            url: self.server.url.clone(),
            namespace: self.server.namespace.clone(),
            token: self.server.token.clone(),
            read_timeout_secs: self.server.read_timeout_secs,
            allow_insecure_http: self.server.allow_insecure_http,
        })
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            net_threads: self.threads.net_threads,
            cpu_threads: self.threads.cpu_threads,
            retry: self.retry.clone(),
            deadlock_timeout: Duration::from_secs(self.deadlock_timeout_secs),
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            max_size: self.cache.max_size,
            min_free_space: self.cache.min_free_space,
            max_items: self.cache.max_items,
            max_age: (self.cache.max_age_secs > 0)
                .then(|| Duration::from_secs(self.cache.max_age_secs)),
        }
    }

    /// Configured cache directory, else the platform default. `None` when
    /// the platform has no cache directory.
    pub fn cache_dir(&self) -> Option<PathBuf> {
        match &self.cache.dir {
            Some(dir) => Some(PathBuf::from(dir)),
            None => dirs::cache_dir().map(|base| base.join("isolate")),
        }
    }

    /// Build the [`Storage`] for the configured server.
    pub fn connect(&self) -> Result<Storage> {
        let backend = backend_from_config(&self.storage_config()?)?;
        Ok(Storage::new(Arc::from(backend), self.storage_options()))
    }

    /// Open the local cache, falling back to memory without a directory.
    pub fn open_cache(&self) -> Result<Arc<dyn ContentAddressedCache>> {
        let algo = self.server.namespace.hash_algorithm();
        match self.cache_dir() {
            Some(dir) => Ok(Arc::new(DiskCache::open(dir, self.cache_policy(), algo)?)),
            None => Ok(Arc::new(MemoryCache::new(self.cache_policy()))),
        }
    }
}
