use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use iso_storage::RetryConfig;

use crate::error::IsoError;
use crate::pool::{TaskChannel, WorkerPool, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MED};

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        retry_delay_ms: 1,
        retry_max_delay_ms: 2,
    }
}

#[test]
fn serves_lowest_priority_value_first_then_fifo() {
    let pool = WorkerPool::new("order", 1, 1, fast_retry()).unwrap();
    let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(0);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    pool.add_job(PRIORITY_HIGH, move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    })
    .unwrap();
    started_rx.recv().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for (priority, label) in [
        (PRIORITY_LOW, "low"),
        (PRIORITY_MED, "med"),
        (PRIORITY_HIGH, "high-1"),
        (PRIORITY_HIGH, "high-2"),
    ] {
        let order = Arc::clone(&order);
        pool.add_job(priority, move || order.lock().unwrap().push(label))
            .unwrap();
    }
    release_tx.send(()).unwrap();
    pool.join();
    assert_eq!(*order.lock().unwrap(), vec!["high-1", "high-2", "med", "low"]);
}

#[test]
fn tasks_report_through_channel() {
    let pool = WorkerPool::new("tasks", 1, 4, fast_retry()).unwrap();
    let channel = TaskChannel::new();
    for i in 0..10u32 {
        pool.add_task(PRIORITY_MED, &channel, move || Ok(i * 2));
    }
    let mut got: Vec<u32> = channel.iter().map(|r| r.unwrap()).collect();
    got.sort_unstable();
    assert_eq!(got, (0..10).map(|i| i * 2).collect::<Vec<_>>());
}

#[test]
fn streaming_task_yields_every_item() {
    let pool = WorkerPool::new("stream", 1, 2, fast_retry()).unwrap();
    let channel = TaskChannel::new();
    pool.add_task_streaming(PRIORITY_MED, &channel, || (1..=3).map(Ok));
    let got: Vec<i32> = channel.iter().map(|r| r.unwrap()).collect();
    assert_eq!(got, vec![1, 2, 3]);
}

#[test]
fn retries_transient_errors() {
    let pool = WorkerPool::new("retry", 1, 1, fast_retry()).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let channel = TaskChannel::new();
    pool.add_task_with_retry(PRIORITY_HIGH, &channel, "flaky", move || {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(IsoError::Transport("reset".into()))
        } else {
            Ok("done")
        }
    });
    assert_eq!(channel.pull().unwrap().unwrap(), "done");
    assert!(channel.pull().is_none());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn fatal_errors_are_not_retried() {
    let pool = WorkerPool::new("fatal", 1, 1, fast_retry()).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let channel: TaskChannel<()> = TaskChannel::new();
    pool.add_task_with_retry(PRIORITY_HIGH, &channel, "bad", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(IsoError::Http {
            status: 403,
            context: "forbidden".into(),
        })
    });
    let err = channel.pull().unwrap().unwrap_err();
    assert!(matches!(err, IsoError::Http { status: 403, .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn retries_give_up_after_budget() {
    let pool = WorkerPool::new("budget", 1, 1, fast_retry()).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let channel: TaskChannel<()> = TaskChannel::new();
    pool.add_task_with_retry(PRIORITY_HIGH, &channel, "down", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(IsoError::Http {
            status: 503,
            context: "unavailable".into(),
        })
    });
    assert!(channel.pull().unwrap().is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[test]
fn panicking_task_reports_error() {
    let pool = WorkerPool::new("panic", 1, 1, fast_retry()).unwrap();
    let channel: TaskChannel<u8> = TaskChannel::new();
    pool.add_task(PRIORITY_MED, &channel, || panic!("boom"));
    let err = channel.pull().unwrap().unwrap_err();
    assert!(err.to_string().contains("boom"), "{err}");
    // The worker survived.
    pool.add_task(PRIORITY_MED, &channel, || Ok(1));
    assert_eq!(channel.pull().unwrap().unwrap(), 1);
}

#[test]
fn closed_pool_rejects_work() {
    let pool = WorkerPool::new("closed", 1, 1, fast_retry()).unwrap();
    pool.close();
    assert!(matches!(
        pool.add_job(PRIORITY_LOW, || {}),
        Err(IsoError::Aborted)
    ));
    let channel: TaskChannel<u8> = TaskChannel::new();
    pool.add_task(PRIORITY_LOW, &channel, || Ok(1));
    assert!(matches!(channel.pull(), Some(Err(IsoError::Aborted))));
    assert!(channel.pull().is_none());
}

#[test]
fn join_waits_for_queued_jobs() {
    let pool = WorkerPool::new("join", 2, 4, fast_retry()).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let done = Arc::clone(&done);
        pool.add_job(PRIORITY_MED, move || {
            std::thread::sleep(std::time::Duration::from_millis(2));
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    pool.join();
    assert_eq!(done.load(Ordering::SeqCst), 20);
    assert!(pool.describe().contains("0 queued"), "{}", pool.describe());
}
