use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, warn};

struct WatchState {
    last_ping: Instant,
    fired: bool,
    stopped: bool,
}

struct Watch {
    state: Mutex<WatchState>,
    wake: Condvar,
}

/// Watchdog for a long operation that is expected to make steady progress.
///
/// The operation calls [`ping`](Self::ping) whenever it advances. If no ping
/// arrives within the timeout the thread report is logged once; the detector
/// never cancels anything. Dropping it stops the watchdog thread.
pub struct DeadlockDetector {
    watch: Arc<Watch>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    /// Start watching. `report` produces the diagnostics, typically
    /// built on [`thread_report`](crate::platform::thread_report).
    pub fn with_reporter<F>(timeout: Duration, report: F) -> Self
    where
        F: Fn() -> String + Send + 'static,
    {
        let watch = Arc::new(Watch {
            state: Mutex::new(WatchState {
                last_ping: Instant::now(),
                fired: false,
                stopped: false,
            }),
            wake: Condvar::new(),
        });
        let thread_watch = Arc::clone(&watch);
        let handle = std::thread::Builder::new()
            .name("deadlock-detector".into())
            .spawn(move || watch_loop(&thread_watch, timeout, report));
        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("deadlock detector disabled: {e}");
                None
            }
        };
        Self { watch, handle }
    }

    pub fn ping(&self) {
        self.watch.state.lock().unwrap().last_ping = Instant::now();
    }

    /// Whether the diagnostics were dumped.
    pub fn has_fired(&self) -> bool {
        self.watch.state.lock().unwrap().fired
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        self.watch.state.lock().unwrap().stopped = true;
        self.watch.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn watch_loop(watch: &Watch, timeout: Duration, report: impl Fn() -> String) {
    let mut st = watch.state.lock().unwrap();
    while !st.stopped {
        if st.fired {
            st = watch.wake.wait(st).unwrap();
            continue;
        }
        let deadline = st.last_ping + timeout;
        let now = Instant::now();
        if now >= deadline {
            st.fired = true;
            let idle = now - st.last_ping;
            drop(st);
            let dump = report();
            error!(
                "no progress for {:.0}s, possible deadlock; threads:\n{dump}",
                idle.as_secs_f64()
            );
            st = watch.state.lock().unwrap();
            continue;
        }
        st = watch.wake.wait_timeout(st, deadline - now).unwrap().0;
    }
}
