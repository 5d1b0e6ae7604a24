use std::sync::atomic::Ordering;
use std::sync::Arc;

use iso_types::{Digest, HashAlgorithm};

use crate::cache::{ContentAddressedCache, MemoryCache};
use crate::error::{IsoError, Result};
use crate::item::Item;
use crate::pool::{TaskChannel, PRIORITY_HIGH};
use crate::storage::{batch_items_for_check, FetchSink};
use crate::testutil::{memory_storage, MemoryStore};

fn buffers(sizes: impl IntoIterator<Item = usize>) -> Vec<Arc<Item>> {
    sizes
        .into_iter()
        .enumerate()
        .map(|(i, n)| {
            let mut data = vec![b'x'; n];
            data.extend_from_slice(&(i as u64).to_le_bytes());
            Arc::new(Item::buffer(data))
        })
        .collect()
}

fn cache_sink(cache: Arc<MemoryCache>) -> FetchSink {
    Arc::new(
        move |digest: &Digest, chunks: &mut dyn Iterator<Item = Result<Vec<u8>>>| {
            cache.write(digest, chunks)
        },
    )
}

fn fetch_into(
    storage: &crate::storage::Storage,
    cache: &Arc<MemoryCache>,
    digest: &Digest,
) -> Result<Digest> {
    let channel = TaskChannel::new();
    storage.async_fetch(&channel, PRIORITY_HIGH, digest.clone(), cache_sink(Arc::clone(cache)))?;
    channel.pull().unwrap()
}

#[test]
fn existence_checks_follow_batch_schedule() {
    let items = buffers((0..130).map(|i| i * 3));
    let batches = batch_items_for_check(&items);
    let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![20, 20, 50, 40]);

    // Largest items go first.
    let flat: Vec<u64> = batches.iter().flatten().map(|i| i.size().unwrap()).collect();
    assert!(flat.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn batches_grow_to_the_last_schedule_step() {
    let items = buffers(std::iter::repeat(1).take(500));
    let sizes: Vec<usize> = batch_items_for_check(&items).iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![20, 20, 50, 50, 50, 100, 100, 100, 10]);
    assert!(batch_items_for_check(&[]).is_empty());
}

#[test]
fn missing_items_issues_one_check_per_batch() {
    let (store, storage) = memory_storage("default");
    let items = buffers(0..130);
    let missing: Vec<_> = storage
        .missing_items(&items)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(missing.len(), 130);
    let mut batches = store.batches.lock().unwrap().clone();
    batches.sort_unstable();
    assert_eq!(batches, vec![20, 20, 40, 50]);
}

#[test]
fn upload_deduplicates_and_is_idempotent() {
    for namespace in ["default", "default-gzip", "sha256-gzip"] {
        let (store, storage) = memory_storage(namespace);
        let items = vec![
            Arc::new(Item::buffer(b"same".to_vec())),
            Arc::new(Item::buffer(b"other".to_vec())),
            Arc::new(Item::buffer(b"same".to_vec())),
        ];
        let uploaded = storage.upload_items(&items).unwrap();
        assert_eq!(uploaded.len(), 2, "{namespace}");
        assert_eq!(store.pushes.lock().unwrap().len(), 2, "{namespace}");
        assert!(!uploaded.iter().any(|u| Arc::ptr_eq(u, &items[2])));

        let again = storage.upload_items(&items).unwrap();
        assert!(again.is_empty(), "{namespace}");
        assert_eq!(store.pushes.lock().unwrap().len(), 2, "{namespace}");
    }
}

#[test]
fn upload_of_nothing_is_a_no_op() {
    let (store, storage) = memory_storage("default-gzip");
    assert!(storage.upload_items(&[]).unwrap().is_empty());
    assert!(store.batches.lock().unwrap().is_empty());
}

#[test]
fn stall_report_describes_live_pools() {
    let (_store, storage) = memory_storage("default-gzip");
    assert!(!storage.pool_reporter()().contains("queued"));

    let items = vec![Arc::new(Item::buffer(b"payload".to_vec()))];
    storage.upload_items(&items).unwrap();
    let report = storage.pool_reporter();
    let text = report();
    assert!(text.contains("net: "), "{text}");
    assert!(text.contains("zip: "), "{text}");
    assert!(text.contains("0 queued"), "{text}");

    // The report does not keep the pools alive.
    drop(storage);
    assert!(!report().contains("queued"));
}

#[test]
fn pushed_blobs_fetch_back_identically() {
    for namespace in ["default", "default-gzip"] {
        let (_store, storage) = memory_storage(namespace);
        let data = b"round trip payload ".repeat(1000);
        let item = Arc::new(Item::buffer(data.clone()));
        storage.upload_items(&[Arc::clone(&item)]).unwrap();

        let cache = Arc::new(MemoryCache::default());
        let digest = item.digest().unwrap().clone();
        assert_eq!(fetch_into(&storage, &cache, &digest).unwrap(), digest);
        assert_eq!(cache.read(&digest).unwrap(), data, "{namespace}");
    }
}

#[test]
fn compressed_namespace_stores_zlib() {
    let (store, storage) = memory_storage("default-gzip");
    let data = vec![0u8; 64 * 1024];
    let item = Arc::new(Item::buffer(data.clone()));
    storage.upload_items(&[Arc::clone(&item)]).unwrap();
    let digest = item.digest().unwrap();
    let mut raw = Vec::new();
    use iso_storage::RemoteObjectStore;
    std::io::Read::read_to_end(&mut store.fetch(digest, 0).unwrap(), &mut raw).unwrap();
    assert!(raw.len() < data.len() / 10);
}

#[test]
fn corrupted_blob_is_retried_then_unretrievable() {
    let (store, storage) = memory_storage("default");
    let digest = Digest::of_bytes(HashAlgorithm::Sha1, b"expected");
    store.put_raw(&digest, b"tampered".to_vec());
    let cache = Arc::new(MemoryCache::default());

    let err = fetch_into(&storage, &cache, &digest).unwrap_err();
    match err {
        IsoError::Unretrievable { digest: hex, source } => {
            assert_eq!(hex, digest.hex());
            assert!(matches!(*source, IsoError::Transfer { .. }), "{source}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.fetches.lock().unwrap().len(), 3);
    assert!(!cache.contains(&digest));
}

#[test]
fn transient_fetch_failures_are_retried() {
    let (store, storage) = memory_storage("default-gzip");
    let digest = store.put(b"flaky content");
    store.flaky_fetches.store(2, Ordering::SeqCst);
    let cache = Arc::new(MemoryCache::default());
    fetch_into(&storage, &cache, &digest).unwrap();
    assert_eq!(cache.read(&digest).unwrap(), b"flaky content");
    assert_eq!(store.fetches.lock().unwrap().len(), 3);
}

#[test]
fn missing_blob_fails_without_retry() {
    let (store, storage) = memory_storage("default");
    let digest = Digest::of_bytes(HashAlgorithm::Sha1, b"absent");
    let cache = Arc::new(MemoryCache::default());
    let err = fetch_into(&storage, &cache, &digest).unwrap_err();
    assert!(matches!(err, IsoError::Unretrievable { .. }), "{err}");
    assert_eq!(store.fetches.lock().unwrap().len(), 1);
}

#[test]
fn sink_failures_become_cache_write_errors() {
    let (store, storage) = memory_storage("default");
    let digest = store.put(b"payload");
    let sink: FetchSink = Arc::new(
        |_: &Digest, chunks: &mut dyn Iterator<Item = Result<Vec<u8>>>| {
            for chunk in chunks {
                chunk?;
            }
            Err(IsoError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only cache",
            )))
        },
    );
    let channel = TaskChannel::new();
    storage
        .async_fetch(&channel, PRIORITY_HIGH, digest.clone(), sink)
        .unwrap();
    let err = channel.pull().unwrap().unwrap_err();
    assert!(matches!(err, IsoError::CacheWrite { .. }), "{err}");
    assert_eq!(store.fetches.lock().unwrap().len(), 1);
}

#[test]
fn resumed_fetch_returns_the_tail() {
    let (store, storage) = memory_storage("default");
    let digest = store.put(b"0123456789");
    let tail: Vec<u8> = storage
        .fetch(&digest, 4)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap()
        .concat();
    assert_eq!(tail, b"456789");

    let (zstore, zstorage) = memory_storage("default-gzip");
    let zdigest = zstore.put(b"0123456789");
    assert!(zstorage.fetch(&zdigest, 4).is_err());
    let whole: Vec<u8> = zstorage
        .fetch(&zdigest, 0)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap()
        .concat();
    assert_eq!(whole, b"0123456789");
}

#[test]
fn single_push_lands_in_store() {
    let (store, storage) = memory_storage("default-gzip");
    let item = Arc::new(Item::buffer(b"single".to_vec()).high_priority());
    let (found, ticket) = storage
        .missing_items(&[Arc::clone(&item)])
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    let pushed = storage.push(found, ticket).unwrap();
    assert!(Arc::ptr_eq(&pushed, &item));
    assert!(store.has(item.digest().unwrap()));
}

#[test]
fn aborted_storage_refuses_transfers() {
    let (_store, storage) = memory_storage("default");
    storage.abort();
    assert!(storage.is_aborted());
    let err = storage
        .upload_items(&[Arc::new(Item::buffer(b"late".to_vec()))])
        .unwrap_err();
    assert!(matches!(err, IsoError::Aborted), "{err}");
}

#[test]
fn memory_store_counts_blobs() {
    let store = MemoryStore::new("default");
    store.put(b"a");
    store.put(b"a");
    store.put(b"b");
    assert_eq!(store.len(), 2);
}
