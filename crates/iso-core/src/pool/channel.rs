use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::error::Result;

enum Msg<T> {
    Item(Result<T>),
    Done,
}

/// Result channel shared by any number of tasks.
///
/// Every task gets its own [`TaskSender`] and may send zero or more results.
/// The channel counts live senders, so a consumer can pull until every task
/// that was ever given a sender has finished.
pub struct TaskChannel<T> {
    tx: Sender<Msg<T>>,
    rx: Receiver<Msg<T>>,
    outstanding: Arc<AtomicUsize>,
}

/// Producer half handed to one task. Dropping it marks the task finished,
/// including when the task panicked or was never run. Cloning registers a
/// follow-up task, e.g. an upload queued by a compression job.
pub struct TaskSender<T> {
    tx: Sender<Msg<T>>,
    outstanding: Arc<AtomicUsize>,
}

impl<T> Clone for TaskSender<T> {
    fn clone(&self) -> Self {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Self {
            tx: self.tx.clone(),
            outstanding: Arc::clone(&self.outstanding),
        }
    }
}

impl<T> TaskSender<T> {
    pub fn send(&self, result: Result<T>) {
        // Fails only once the channel itself is gone.
        let _ = self.tx.send(Msg::Item(result));
    }
}

impl<T> Drop for TaskSender<T> {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Done);
    }
}

impl<T> Default for TaskChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskChannel<T> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register one more producing task.
    pub fn sender(&self) -> TaskSender<T> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        TaskSender {
            tx: self.tx.clone(),
            outstanding: Arc::clone(&self.outstanding),
        }
    }

    /// Tasks registered but not yet finished.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Block for the next result. `None` once every registered task finished
    /// and all of their results were pulled.
    pub fn pull(&self) -> Option<Result<T>> {
        loop {
            if self.outstanding() == 0 {
                return None;
            }
            match self.rx.recv() {
                Ok(Msg::Item(r)) => return Some(r),
                Ok(Msg::Done) => {
                    self.outstanding.fetch_sub(1, Ordering::SeqCst);
                }
                Err(_) => return None,
            }
        }
    }

    /// Iterate until exhaustion.
    pub fn iter(&self) -> impl Iterator<Item = Result<T>> + '_ {
        std::iter::from_fn(move || self.pull())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IsoError;
    use std::time::Duration;

    #[test]
    fn empty_channel_is_exhausted() {
        let ch: TaskChannel<u32> = TaskChannel::new();
        assert!(ch.pull().is_none());
    }

    #[test]
    fn pulls_until_every_sender_dropped() {
        let ch: TaskChannel<u32> = TaskChannel::new();
        let a = ch.sender();
        let b = ch.sender();
        let t = std::thread::spawn(move || {
            a.send(Ok(1));
            a.send(Ok(2));
            drop(a);
            b.send(Err(IsoError::Aborted));
        });
        let mut got = Vec::new();
        for r in ch.iter() {
            got.push(r.map_err(|e| e.to_string()));
        }
        t.join().unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], Ok(1));
        assert_eq!(got[1], Ok(2));
        assert!(got[2].is_err());
        assert_eq!(ch.outstanding(), 0);
    }

    #[test]
    fn cloned_sender_keeps_channel_open() {
        let ch: TaskChannel<u32> = TaskChannel::new();
        let first = ch.sender();
        let follow_up = first.clone();
        drop(first);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            follow_up.send(Ok(7));
        });
        assert_eq!(ch.pull().unwrap().unwrap(), 7);
        assert!(ch.pull().is_none());
        t.join().unwrap();
    }
}
