use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use iso_storage::{PushTicket, RemoteObjectStore, RetryConfig};
use iso_types::error::{IsoError, Result};
use iso_types::{Digest, Namespace};

use crate::compress::{zip_compress, DEFAULT_LEVEL};
use crate::storage::{Storage, StorageOptions};

/// In-memory object store for testing. Records every existence-check batch
/// and every push.
pub struct MemoryStore {
    namespace: Namespace,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub batches: Mutex<Vec<usize>>,
    pub pushes: Mutex<Vec<String>>,
    pub fetches: Mutex<Vec<String>>,
    /// Number of upcoming fetches that fail with a transient error.
    pub flaky_fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: Namespace::new(namespace).unwrap(),
            blobs: Mutex::new(HashMap::new()),
            batches: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
            flaky_fetches: AtomicUsize::new(0),
        }
    }

    /// Store `data` as a client would have pushed it; returns its digest.
    pub fn put(&self, data: &[u8]) -> Digest {
        let digest = Digest::of_bytes(self.namespace.hash_algorithm(), data);
        let stored = if self.namespace.uses_compression() {
            zip_compress(&mut &data[..], DEFAULT_LEVEL).unwrap()
        } else {
            data.to_vec()
        };
        self.put_raw(&digest, stored);
        digest
    }

    /// Store bytes as-is under `digest`, bypassing encoding.
    pub fn put_raw(&self, digest: &Digest, stored: Vec<u8>) {
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.hex().to_string(), stored);
    }

    pub fn has(&self, digest: &Digest) -> bool {
        self.blobs.lock().unwrap().contains_key(digest.hex())
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

impl RemoteObjectStore for MemoryStore {
    fn location(&self) -> &str {
        "memory://"
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn contains(&self, digests: &[Digest]) -> Result<Vec<(usize, PushTicket)>> {
        self.batches.lock().unwrap().push(digests.len());
        let blobs = self.blobs.lock().unwrap();
        Ok(digests
            .iter()
            .enumerate()
            .filter(|(_, d)| !blobs.contains_key(d.hex()))
            .map(|(i, _)| (i, PushTicket::local()))
            .collect())
    }

    fn push(&self, digest: &Digest, _ticket: &PushTicket, content: &[u8]) -> Result<()> {
        self.pushes.lock().unwrap().push(digest.hex().to_string());
        self.put_raw(digest, content.to_vec());
        Ok(())
    }

    fn fetch(&self, digest: &Digest, offset: u64) -> Result<Box<dyn Read + Send>> {
        self.fetches.lock().unwrap().push(digest.hex().to_string());
        let flaky = self
            .flaky_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if flaky {
            return Err(IsoError::Transport("simulated connection reset".into()));
        }
        let blobs = self.blobs.lock().unwrap();
        let data = blobs.get(digest.hex()).ok_or_else(|| {
            IsoError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", digest.hex()),
            ))
        })?;
        let start = (offset as usize).min(data.len());
        Ok(Box::new(Cursor::new(data[start..].to_vec())))
    }
}

/// Options with near-instant retries so failure tests stay fast.
pub fn fast_options() -> StorageOptions {
    StorageOptions {
        net_threads: 4,
        cpu_threads: 2,
        retry: RetryConfig {
            max_retries: 2,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        },
        deadlock_timeout: Duration::from_secs(60),
    }
}

pub fn memory_storage(namespace: &str) -> (Arc<MemoryStore>, Arc<Storage>) {
    let store = Arc::new(MemoryStore::new(namespace));
    let storage = Arc::new(Storage::new(store.clone(), fast_options()));
    (store, storage)
}
