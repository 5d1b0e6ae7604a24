use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use iso_types::Digest;

use crate::cache::ContentAddressedCache;
use crate::error::{IsoError, Result};
use crate::pool::TaskChannel;
use crate::storage::{FetchSink, Storage};

#[derive(Default)]
struct QueueState {
    /// Fetches issued and not yet pulled from the channel.
    pending: HashSet<Digest>,
    /// Everything ever passed to `add`.
    accessed: HashSet<Digest>,
    /// Known to be in the cache.
    fetched: HashSet<Digest>,
    waiting_on: HashSet<Digest>,
    /// Waited-on digests that were already fetched.
    ready: VecDeque<Digest>,
}

/// Makes digests available in a local cache, issuing at most one fetch per
/// digest at a time.
///
/// Callers `add` what they need, `wait_on` the subset they are blocked on,
/// then `wait` to be handed whichever of those lands first.
pub struct FetchQueue {
    storage: Arc<Storage>,
    cache: Arc<dyn ContentAddressedCache>,
    channel: TaskChannel<Digest>,
    state: Mutex<QueueState>,
}

impl FetchQueue {
    pub fn new(storage: Arc<Storage>, cache: Arc<dyn ContentAddressedCache>) -> Self {
        let state = QueueState {
            fetched: cache.cached_digests().into_iter().collect(),
            ..QueueState::default()
        };
        Self {
            storage,
            cache,
            channel: TaskChannel::new(),
            state: Mutex::new(state),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<dyn ContentAddressedCache> {
        &self.cache
    }

    /// Start fetching `digest` unless it is cached or already in flight.
    pub fn add(&self, digest: Digest, priority: u32) -> Result<()> {
        {
            let mut st = self.state.lock().unwrap();
            if st.pending.contains(&digest) {
                return Ok(());
            }
            st.accessed.insert(digest.clone());
            if st.fetched.contains(&digest) {
                if self.cache.touch(&digest) {
                    return Ok(());
                }
                error!("{} is corrupted", digest.short());
                st.fetched.remove(&digest);
            }
            st.pending.insert(digest.clone());
        }

        let cache = Arc::clone(&self.cache);
        let sink: FetchSink = Arc::new(
            move |digest: &Digest, chunks: &mut dyn Iterator<Item = Result<Vec<u8>>>| {
                cache.write(digest, chunks)
            },
        );
        if let Err(e) = self
            .storage
            .async_fetch(&self.channel, priority, digest.clone(), sink)
        {
            self.state.lock().unwrap().pending.remove(&digest);
            return Err(e);
        }
        Ok(())
    }

    /// Hash a local file and store it in the cache as if it was fetched.
    pub fn inject_local_file(&self, path: &Path) -> Result<Digest> {
        let data = std::fs::read(path)?;
        let digest = Digest::of_bytes(self.storage.hash_algorithm(), &data);
        self.cache
            .write(&digest, &mut std::iter::once(Ok::<_, IsoError>(data)))?;
        self.state.lock().unwrap().fetched.insert(digest.clone());
        debug!("injected {} as {}", path.display(), digest.short());
        Ok(digest)
    }

    /// Register interest in `digest` for the next [`wait`](Self::wait).
    pub fn wait_on(&self, digest: Digest) {
        let mut st = self.state.lock().unwrap();
        if st.fetched.contains(&digest) {
            if !st.ready.contains(&digest) {
                st.ready.push_back(digest);
            }
        } else {
            st.waiting_on.insert(digest);
        }
    }

    /// Block until one waited-on digest is in the cache and return it.
    pub fn wait(&self) -> Result<Digest> {
        {
            let mut st = self.state.lock().unwrap();
            if let Some(digest) = st.ready.pop_front() {
                return Ok(digest);
            }
            if st.waiting_on.is_empty() {
                return Err(IsoError::Other("nothing to wait on".into()));
            }
        }
        loop {
            if self.state.lock().unwrap().pending.is_empty() {
                return Err(IsoError::Other(
                    "waiting on digests that are not being fetched".into(),
                ));
            }
            let digest = self.pull()?;
            let mut st = self.state.lock().unwrap();
            if st.waiting_on.remove(&digest) {
                return Ok(digest);
            }
        }
    }

    /// Block until every issued fetch completed.
    pub fn wait_queue_empty(&self) -> Result<()> {
        while !self.state.lock().unwrap().pending.is_empty() {
            let digest = self.pull()?;
            let mut st = self.state.lock().unwrap();
            if st.waiting_on.remove(&digest) {
                st.ready.push_back(digest);
            }
        }
        Ok(())
    }

    fn pull(&self) -> Result<Digest> {
        let digest = match self.channel.pull() {
            Some(result) => result?,
            None => return Err(IsoError::Other("fetch channel exhausted".into())),
        };
        let mut st = self.state.lock().unwrap();
        st.pending.remove(&digest);
        st.fetched.insert(digest.clone());
        Ok(digest)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Whether everything ever added is still in the cache.
    pub fn verify_all_cached(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.accessed.iter().all(|d| self.cache.contains(d))
    }
}
