//! Priority worker pools.
//!
//! A pool owns a growing set of threads pulling jobs from one priority queue.
//! Lower priority values run first; jobs with equal priority run in
//! submission order. Results flow back through a [`TaskChannel`].

mod channel;
pub mod deadlock;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error};

use iso_storage::retry::retry_call;
use iso_storage::RetryConfig;

use crate::error::{IsoError, Result};

pub use channel::{TaskChannel, TaskSender};
pub use deadlock::DeadlockDetector;

pub const PRIORITY_HIGH: u32 = 1 << 8;
pub const PRIORITY_MED: u32 = 2 << 8;
pub const PRIORITY_LOW: u32 = 3 << 8;

/// A queued unit of work. The flag is `true` when the pool is closed and the
/// job must only report its cancellation.
type Job = Box<dyn FnOnce(bool) + Send + 'static>;

struct QueuedJob {
    priority: u32,
    seq: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // BinaryHeap pops the greatest element; invert so the smallest
    // (priority, seq) pair wins.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

#[derive(Default)]
struct PoolState {
    queue: BinaryHeap<QueuedJob>,
    next_seq: u64,
    threads: usize,
    idle: usize,
    running: usize,
    closed: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
    drained: Condvar,
}

pub struct WorkerPool {
    name: String,
    max_threads: usize,
    retry: RetryConfig,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool starting `initial_threads` workers and growing up to
    /// `max_threads` as queued work exceeds idle capacity.
    pub fn new(
        name: impl Into<String>,
        initial_threads: usize,
        max_threads: usize,
        retry: RetryConfig,
    ) -> Result<Self> {
        let max_threads = max_threads.max(1);
        let pool = Self {
            name: name.into(),
            max_threads,
            retry,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                work_ready: Condvar::new(),
                drained: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        };
        for _ in 0..initial_threads.min(max_threads) {
            pool.shared.state.lock().unwrap().threads += 1;
            pool.spawn_worker()?;
        }
        Ok(pool)
    }

    fn spawn_worker(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut handles = self.handles.lock().unwrap();
        let thread_name = format!("{}-{}", self.name, handles.len());
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(shared));
        match spawned {
            Ok(handle) => {
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.state.lock().unwrap().threads -= 1;
                Err(IsoError::Io(e))
            }
        }
    }

    /// Returns `false` when the pool was closed and the job got cancelled.
    fn enqueue(&self, priority: u32, job: Job) -> bool {
        let grow = {
            let mut st = self.shared.state.lock().unwrap();
            if st.closed {
                drop(st);
                job(true);
                return false;
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            st.queue.push(QueuedJob { priority, seq, job });
            let grow = st.queue.len() > st.idle && st.threads < self.max_threads;
            if grow {
                st.threads += 1;
            }
            grow
        };
        self.shared.work_ready.notify_one();
        if grow {
            if let Err(e) = self.spawn_worker() {
                // Existing workers still drain the queue.
                debug!(pool = %self.name, "could not grow pool: {e}");
            }
        }
        true
    }

    /// Queue a closure with no result. Fails with [`IsoError::Aborted`] once
    /// the pool is closed.
    pub fn add_job<F>(&self, priority: u32, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = self.name.clone();
        let accepted = self.enqueue(
            priority,
            Box::new(move |cancelled| {
                if cancelled {
                    return;
                }
                if let Err(p) = catch_unwind(AssertUnwindSafe(f)) {
                    error!(pool = %name, "{}", panic_message(&*p));
                }
            }),
        );
        if accepted {
            Ok(())
        } else {
            Err(IsoError::Aborted)
        }
    }

    /// Queue a task producing one result into `channel`.
    pub fn add_task<T, F>(&self, priority: u32, channel: &TaskChannel<T>, f: F)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.add_task_to(priority, channel.sender(), f)
    }

    /// Queue a task reporting through an already registered sender.
    pub fn add_task_to<T, F>(&self, priority: u32, sender: TaskSender<T>, f: F)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.enqueue(
            priority,
            Box::new(move |cancelled| {
                if cancelled {
                    sender.send(Err(IsoError::Aborted));
                    return;
                }
                let result = catch_unwind(AssertUnwindSafe(f))
                    .unwrap_or_else(|p| Err(IsoError::Other(panic_message(&*p))));
                sender.send(result);
            }),
        );
    }

    /// Queue a task whose results are produced lazily by an iterator; each
    /// item is forwarded to `channel` as soon as it is yielded.
    pub fn add_task_streaming<T, I, F>(&self, priority: u32, channel: &TaskChannel<T>, f: F)
    where
        T: Send + 'static,
        I: Iterator<Item = Result<T>>,
        F: FnOnce() -> I + Send + 'static,
    {
        let sender = channel.sender();
        self.enqueue(
            priority,
            Box::new(move |cancelled| {
                if cancelled {
                    sender.send(Err(IsoError::Aborted));
                    return;
                }
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    for item in f() {
                        sender.send(item);
                    }
                }));
                if let Err(p) = outcome {
                    sender.send(Err(IsoError::Other(panic_message(&*p))));
                }
            }),
        );
    }

    /// Queue a task that is retried with backoff on transient and
    /// not-found-yet errors before its error is surfaced.
    pub fn add_task_with_retry<T, F>(
        &self,
        priority: u32,
        channel: &TaskChannel<T>,
        op_name: impl Into<String>,
        f: F,
    ) where
        T: Send + 'static,
        F: FnMut() -> Result<T> + Send + 'static,
    {
        self.add_retry_task_to(priority, channel.sender(), op_name, f)
    }

    pub fn add_retry_task_to<T, F>(
        &self,
        priority: u32,
        sender: TaskSender<T>,
        op_name: impl Into<String>,
        f: F,
    ) where
        T: Send + 'static,
        F: FnMut() -> Result<T> + Send + 'static,
    {
        let retry = self.retry.clone();
        let label = self.name.clone();
        let op_name = op_name.into();
        let mut f = f;
        self.add_task_to(priority, sender, move || {
            retry_call(&retry, &op_name, &label, &mut f)
        })
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Block until the queue is empty and no task is running.
    pub fn join(&self) {
        let mut st = self.shared.state.lock().unwrap();
        while !(st.queue.is_empty() && st.running == 0) {
            st = self.shared.drained.wait(st).unwrap();
        }
    }

    /// Stop accepting work, let workers drain what is queued and join them.
    pub fn close(&self) {
        self.shared.state.lock().unwrap().closed = true;
        self.shared.work_ready.notify_all();
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!(pool = %self.name, "worker thread panicked");
            }
        }
    }

    /// One-line state summary for diagnostics.
    pub fn describe(&self) -> String {
        let st = self.shared.state.lock().unwrap();
        format!(
            "{}: {} threads ({} idle), {} running, {} queued",
            self.name,
            st.threads,
            st.idle,
            st.running,
            st.queue.len()
        )
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut st = shared.state.lock().unwrap();
            loop {
                if let Some(queued) = st.queue.pop() {
                    st.running += 1;
                    break queued.job;
                }
                if st.closed {
                    st.threads -= 1;
                    return;
                }
                st.idle += 1;
                st = shared.work_ready.wait(st).unwrap();
                st.idle -= 1;
            }
        };
        // Task closures catch their own panics; this guards the bookkeeping.
        let _ = catch_unwind(AssertUnwindSafe(move || job(false)));
        let mut st = shared.state.lock().unwrap();
        st.running -= 1;
        if st.running == 0 && st.queue.is_empty() {
            shared.drained.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    format!("task panicked: {msg}")
}
