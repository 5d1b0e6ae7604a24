use std::collections::HashSet;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use iso_storage::retry::retry_call;
use iso_storage::{PushTicket, RemoteObjectStore, RetryConfig};
use iso_types::{Digest, HashAlgorithm, Namespace};

use crate::compress::{zip_compress, ZipDecompress, DISK_FILE_CHUNK, NET_IO_FILE_CHUNK};
use crate::error::{IsoError, Result};
use crate::item::Item;
use crate::platform::thread_report;
use crate::pool::{
    DeadlockDetector, TaskChannel, WorkerPool, PRIORITY_HIGH, PRIORITY_MED,
};
use crate::verify::{ReaderChunks, VerifiedStream};

/// Existence-check batch sizes; the last one repeats.
pub const ITEMS_PER_CONTAINS_QUERIES: [usize; 6] = [20, 20, 50, 50, 50, 100];

/// Chunks of a fetched blob, already decompressed and verified.
pub type ChunkStream = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

/// Consumer of a fetched blob, typically a cache write.
pub type FetchSink =
    Arc<dyn Fn(&Digest, &mut dyn Iterator<Item = Result<Vec<u8>>>) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub net_threads: usize,
    pub cpu_threads: usize,
    pub retry: RetryConfig,
    pub deadlock_timeout: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            net_threads: 16,
            cpu_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .clamp(2, 16),
            retry: RetryConfig::default(),
            deadlock_timeout: Duration::from_secs(300),
        }
    }
}

/// Moves deduplicated blobs between local producers/consumers and one
/// namespace of a [`RemoteObjectStore`].
///
/// Network calls run on a retrying I/O pool, compression on a separate CPU
/// pool, both created on first use. The namespace fixes the hash algorithm
/// and whether blobs are stored zlib-compressed.
pub struct Storage {
    store: Arc<dyn RemoteObjectStore>,
    algo: HashAlgorithm,
    use_zip: bool,
    options: StorageOptions,
    net_pool: Mutex<Option<Arc<WorkerPool>>>,
    cpu_pool: Mutex<Option<Arc<WorkerPool>>>,
    aborted: Arc<AtomicBool>,
}

impl Storage {
    pub fn new(store: Arc<dyn RemoteObjectStore>, options: StorageOptions) -> Self {
        let namespace = store.namespace();
        Self {
            algo: namespace.hash_algorithm(),
            use_zip: namespace.uses_compression(),
            store,
            options,
            net_pool: Mutex::new(None),
            cpu_pool: Mutex::new(None),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.algo
    }

    pub fn location(&self) -> &str {
        self.store.location()
    }

    pub fn namespace(&self) -> &Namespace {
        self.store.namespace()
    }

    /// Watchdog for a long transfer loop. Its report appends the state of
    /// the pools that exist when it starts to the thread list.
    pub fn deadlock_detector(&self) -> DeadlockDetector {
        DeadlockDetector::with_reporter(self.options.deadlock_timeout, self.pool_reporter())
    }

    pub(crate) fn pool_reporter(&self) -> impl Fn() -> String + Send + 'static {
        let pools: Vec<Weak<WorkerPool>> = [&self.net_pool, &self.cpu_pool]
            .into_iter()
            .filter_map(|slot| slot.lock().unwrap().as_ref().map(Arc::downgrade))
            .collect();
        move || {
            let mut report = thread_report();
            for pool in pools.iter().filter_map(Weak::upgrade) {
                report.push('\n');
                report.push_str(&pool.describe());
            }
            report
        }
    }

    fn net_pool(&self) -> Result<Arc<WorkerPool>> {
        let mut slot = self.net_pool.lock().unwrap();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(WorkerPool::new(
            "net",
            1,
            self.options.net_threads,
            self.options.retry.clone(),
        )?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn cpu_pool(&self) -> Result<Arc<WorkerPool>> {
        let mut slot = self.cpu_pool.lock().unwrap();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(WorkerPool::new(
            "zip",
            2,
            self.options.cpu_threads,
            RetryConfig {
                max_retries: 0,
                ..self.options.retry.clone()
            },
        )?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Make queued and future transfers fail with [`IsoError::Aborted`].
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            warn!("aborting, it can take a while");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Wait for every queued task, then stop the pools.
    pub fn close(&self) {
        let cpu = self.cpu_pool.lock().unwrap().take();
        let net = self.net_pool.lock().unwrap().take();
        if cpu.is_none() && net.is_none() {
            return;
        }
        info!("waiting for all threads to die");
        // Compression jobs queue uploads, so they drain first.
        if let Some(pool) = cpu {
            pool.join();
            pool.close();
        }
        if let Some(pool) = net {
            pool.join();
            pool.close();
        }
        debug!("storage closed");
    }

    /// Upload whatever of `items` the store does not have yet.
    ///
    /// Items sharing a digest are collapsed to the first one. Returns the
    /// items that were actually pushed.
    pub fn upload_items(&self, items: &[Arc<Item>]) -> Result<Vec<Arc<Item>>> {
        info!(items = items.len(), "upload_items");
        let algo = self.algo;
        items
            .par_iter()
            .try_for_each(|item| item.prepare(algo).map(|_| ()))?;

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(items.len());
        for item in items {
            let digest = item.digest().cloned().ok_or_else(|| {
                IsoError::Other("item digest missing after prepare".into())
            })?;
            if seen.insert(digest) {
                unique.push(Arc::clone(item));
            }
        }
        let duplicates = items.len() - unique.len();
        if duplicates > 0 {
            info!("skipped {duplicates} files with duplicated content");
        }

        let channel = TaskChannel::new();
        let mut missing = Vec::new();
        for found in self.missing_items(&unique)? {
            let (item, ticket) = found?;
            self.async_push(&channel, Arc::clone(&item), ticket)?;
            missing.push(item);
        }

        let mut uploaded = Vec::with_capacity(missing.len());
        if !missing.is_empty() {
            let detector = self.deadlock_detector();
            while let Some(result) = channel.pull() {
                detector.ping();
                let item = result?;
                debug!(
                    "uploaded {} / {}: {}",
                    uploaded.len() + 1,
                    missing.len(),
                    item.digest().map(Digest::short).unwrap_or("?")
                );
                uploaded.push(item);
            }
        }
        info!("all files are uploaded");

        log_upload_stats(&unique, &missing);
        Ok(uploaded)
    }

    /// Stream the items missing from the store, each with its push ticket.
    ///
    /// One existence check is issued per batch (see
    /// [`batch_items_for_check`]); batches race and results arrive as each
    /// check completes.
    pub fn missing_items(&self, items: &[Arc<Item>]) -> Result<MissingItems> {
        for item in items {
            item.prepare(self.algo)?;
        }
        let net = self.net_pool()?;
        let channel = TaskChannel::new();
        for batch in batch_items_for_check(items) {
            let store = Arc::clone(&self.store);
            let aborted = Arc::clone(&self.aborted);
            net.add_task_with_retry(PRIORITY_HIGH, &channel, "contains", move || {
                if aborted.load(Ordering::SeqCst) {
                    return Err(IsoError::Aborted);
                }
                let digests: Vec<Digest> = batch
                    .iter()
                    .filter_map(|item| item.digest().cloned())
                    .collect();
                let missing = store.contains(&digests)?;
                missing
                    .into_iter()
                    .map(|(i, ticket)| {
                        batch
                            .get(i)
                            .map(|item| (Arc::clone(item), ticket))
                            .ok_or_else(|| {
                                IsoError::Other(format!("contains returned bad index {i}"))
                            })
                    })
                    .collect::<Result<Vec<_>>>()
            });
        }
        Ok(MissingItems {
            channel,
            current: Vec::new().into_iter(),
        })
    }

    /// Queue the upload of one item reported missing by
    /// [`missing_items`](Self::missing_items). `channel` receives the item
    /// once it landed.
    pub fn async_push(
        &self,
        channel: &TaskChannel<Arc<Item>>,
        item: Arc<Item>,
        ticket: PushTicket,
    ) -> Result<()> {
        let priority = if item.is_high_priority() {
            PRIORITY_HIGH
        } else {
            PRIORITY_MED
        };
        let digest = item.prepare(self.algo)?.clone();
        let net = self.net_pool()?;
        let store = Arc::clone(&self.store);
        let aborted = Arc::clone(&self.aborted);

        if !self.use_zip {
            net.add_task_with_retry(priority, channel, "push", move || {
                if aborted.load(Ordering::SeqCst) {
                    return Err(IsoError::Aborted);
                }
                let mut content = Vec::new();
                item.content()?.read_to_end(&mut content)?;
                store.push(&digest, &ticket, &content)?;
                Ok(Arc::clone(&item))
            });
            return Ok(());
        }

        let sender = channel.sender();
        let cpu = self.cpu_pool()?;
        cpu.add_job(priority, move || {
            if aborted.load(Ordering::SeqCst) {
                sender.send(Err(IsoError::Aborted));
                return;
            }
            let zipped = item
                .content()
                .and_then(|mut r| zip_compress(&mut r, item.compression_level()));
            let data = match zipped {
                Ok(data) => data,
                Err(e) => {
                    error!("failed to zip '{}': {e}", digest.short());
                    sender.send(Err(e));
                    return;
                }
            };
            net.add_retry_task_to(priority, sender, "push", move || {
                if aborted.load(Ordering::SeqCst) {
                    return Err(IsoError::Aborted);
                }
                store.push(&digest, &ticket, &data)?;
                Ok(Arc::clone(&item))
            });
        })
    }

    /// Upload a single item synchronously.
    pub fn push(&self, item: Arc<Item>, ticket: PushTicket) -> Result<Arc<Item>> {
        let channel = TaskChannel::new();
        self.async_push(&channel, item, ticket)?;
        let _detector = self.deadlock_detector();
        channel
            .pull()
            .unwrap_or_else(|| Err(IsoError::Other("push finished without a result".into())))
    }

    /// Queue a fetch of `digest`; the verified content is handed to `sink`
    /// and `channel` receives the digest once the sink accepted it.
    ///
    /// Transient failures are retried on the network pool. Errors raised by
    /// the sink itself become [`IsoError::CacheWrite`] and are not retried;
    /// anything else still failing after the retries is reported as
    /// [`IsoError::Unretrievable`].
    pub fn async_fetch(
        &self,
        channel: &TaskChannel<Digest>,
        priority: u32,
        digest: Digest,
        sink: FetchSink,
    ) -> Result<()> {
        let net = self.net_pool()?;
        let store = Arc::clone(&self.store);
        let aborted = Arc::clone(&self.aborted);
        let use_zip = self.use_zip;
        let retry = net.retry_config().clone();
        net.add_task(priority, channel, move || {
            let attempt = || -> Result<Digest> {
                if aborted.load(Ordering::SeqCst) {
                    return Err(IsoError::Aborted);
                }
                let chunks = open_stream(store.as_ref(), &digest, use_zip)?;
                let mut verified = VerifiedStream::new(chunks, digest.clone());
                match sink(&digest, &mut verified) {
                    Ok(()) => Ok(digest.clone()),
                    Err(e) if verified.failed() => Err(e),
                    Err(e @ IsoError::CacheWrite { .. }) => Err(e),
                    Err(e) => Err(IsoError::CacheWrite {
                        digest: digest.hex().to_string(),
                        reason: e.to_string(),
                    }),
                }
            };
            retry_call(&retry, "fetch", "net", attempt).map_err(|e| match e {
                IsoError::CacheWrite { .. } | IsoError::Aborted => e,
                other => {
                    error!("failed to fetch {}: {other}", digest.short());
                    IsoError::Unretrievable {
                        digest: digest.hex().to_string(),
                        source: Box::new(other),
                    }
                }
            })
        });
        Ok(())
    }

    /// Fetch a blob on the calling thread.
    ///
    /// With `offset == 0` the stream is decompressed and verified. A non-zero
    /// offset resumes a partial download of an uncompressed namespace and the
    /// caller is responsible for verifying the stitched result.
    pub fn fetch(&self, digest: &Digest, offset: u64) -> Result<ChunkStream> {
        if offset == 0 {
            let chunks = open_stream(self.store.as_ref(), digest, self.use_zip)?;
            return Ok(Box::new(VerifiedStream::new(chunks, digest.clone())));
        }
        if self.use_zip {
            return Err(IsoError::Config(format!(
                "cannot resume {} at offset {offset}: namespace {} is compressed",
                digest.short(),
                self.namespace()
            )));
        }
        let reader = self.store.fetch(digest, offset)?;
        Ok(Box::new(ReaderChunks::new(reader, NET_IO_FILE_CHUNK)))
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(store: &dyn RemoteObjectStore, digest: &Digest, use_zip: bool) -> Result<ChunkStream> {
    let reader = store.fetch(digest, 0)?;
    if use_zip {
        Ok(Box::new(ZipDecompress::new(reader, DISK_FILE_CHUNK)))
    } else {
        Ok(Box::new(ReaderChunks::new(reader, NET_IO_FILE_CHUNK)))
    }
}

/// Results of [`Storage::missing_items`], yielded as existence checks finish.
pub struct MissingItems {
    channel: TaskChannel<Vec<(Arc<Item>, PushTicket)>>,
    current: std::vec::IntoIter<(Arc<Item>, PushTicket)>,
}

impl Iterator for MissingItems {
    type Item = Result<(Arc<Item>, PushTicket)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(found) = self.current.next() {
                return Some(Ok(found));
            }
            match self.channel.pull()? {
                Ok(batch) => self.current = batch.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Split items into existence-check batches, largest items first.
///
/// Batch sizes follow [`ITEMS_PER_CONTAINS_QUERIES`]: small first batches
/// keep the first round trip short, later ones amortize request overhead.
pub fn batch_items_for_check(items: &[Arc<Item>]) -> Vec<Vec<Arc<Item>>> {
    let mut sorted: Vec<Arc<Item>> = items.to_vec();
    sorted.sort_by(|a, b| b.size().unwrap_or(0).cmp(&a.size().unwrap_or(0)));

    let mut batches = Vec::new();
    let mut limit = ITEMS_PER_CONTAINS_QUERIES[0];
    let mut next = Vec::with_capacity(limit);
    for item in sorted {
        next.push(item);
        if next.len() == limit {
            batches.push(std::mem::take(&mut next));
            limit = ITEMS_PER_CONTAINS_QUERIES[batches.len().min(ITEMS_PER_CONTAINS_QUERIES.len() - 1)];
        }
    }
    if !next.is_empty() {
        batches.push(next);
    }
    batches
}

fn log_upload_stats(items: &[Arc<Item>], missing: &[Arc<Item>]) {
    let size_of = |list: &[Arc<Item>]| list.iter().map(|i| i.size().unwrap_or(0)).sum::<u64>();
    let total = items.len();
    let total_size = size_of(items);
    let miss_size = size_of(missing);
    let hit = total - missing.len();
    let hit_size = total_size.saturating_sub(miss_size);
    let pct = |n: u64, d: u64| if d == 0 { 0.0 } else { n as f64 * 100.0 / d as f64 };
    info!("Total:      {total:6}, {:9.1}kb", total_size as f64 / 1024.0);
    info!(
        "cache hit:  {hit:6}, {:9.1}kb, {:6.2}% files, {:6.2}% size",
        hit_size as f64 / 1024.0,
        pct(hit as u64, total as u64),
        pct(hit_size, total_size)
    );
    info!(
        "cache miss: {:6}, {:9.1}kb, {:6.2}% files, {:6.2}% size",
        missing.len(),
        miss_size as f64 / 1024.0,
        pct(missing.len() as u64, total as u64),
        pct(miss_size, total_size)
    );
}
