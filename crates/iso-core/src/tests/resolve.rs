use std::path::MAIN_SEPARATOR;
use std::sync::Arc;

use iso_types::{Digest, HashAlgorithm};

use crate::cache::MemoryCache;
use crate::error::IsoError;
use crate::fetch_queue::FetchQueue;
use crate::manifest::{resolve, FileEntry, FileKind, Manifest, ReadOnly};
use crate::testutil::{memory_storage, MemoryStore};

fn setup() -> (Arc<MemoryStore>, FetchQueue) {
    let (store, storage) = memory_storage("default-gzip");
    let queue = FetchQueue::new(storage, Arc::new(MemoryCache::default()));
    (store, queue)
}

fn file(digest: &Digest, mode: Option<u32>) -> FileEntry {
    FileEntry::Regular {
        digest: digest.clone(),
        mode,
        kind: FileKind::Basic,
    }
}

fn put_manifest(store: &MemoryStore, manifest: &Manifest) -> Digest {
    store.put(&manifest.to_bytes().unwrap())
}

fn was_fetched(store: &MemoryStore, digest: &Digest) -> bool {
    store
        .fetches
        .lock()
        .unwrap()
        .iter()
        .any(|h| h == digest.hex())
}

#[test]
fn single_manifest() {
    let (store, queue) = setup();
    let data = store.put(b"print('hi')");
    let mut m = Manifest::new(HashAlgorithm::Sha1);
    m.command = vec!["python".into(), "main.py".into()];
    m.files.insert("main.py".into(), file(&data, Some(0o644)));
    m.files.insert(
        "link".into(),
        FileEntry::Symlink {
            target: "main.py".into(),
        },
    );
    let root = put_manifest(&store, &m);

    let bundle = resolve(&queue, root.clone()).unwrap();
    assert_eq!(bundle.root, root);
    assert_eq!(bundle.command, vec!["python", "main.py"]);
    assert_eq!(bundle.files.len(), 2);
    assert_eq!(bundle.relative_cwd, "");
    assert!(!bundle.is_read_only());

    queue.wait_queue_empty().unwrap();
    assert!(was_fetched(&store, &data));
}

#[test]
fn earlier_include_overrides_later() {
    let (store, queue) = setup();
    let from_a = store.put(b"from a");
    let from_b = store.put(b"from b");
    let only_b = store.put(b"only in b");
    let from_root = store.put(b"from root");

    let mut a = Manifest::new(HashAlgorithm::Sha1);
    a.files.insert("f".into(), file(&from_a, None));
    a.files.insert("r".into(), file(&from_a, None));
    let mut b = Manifest::new(HashAlgorithm::Sha1);
    b.files.insert("f".into(), file(&from_b, None));
    b.files.insert("g".into(), file(&only_b, None));
    let mut root = Manifest::new(HashAlgorithm::Sha1);
    root.files.insert("r".into(), file(&from_root, None));
    root.includes = vec![put_manifest(&store, &a), put_manifest(&store, &b)];
    let root = put_manifest(&store, &root);

    let bundle = resolve(&queue, root).unwrap();
    assert_eq!(bundle.files["f"].digest(), Some(&from_a));
    assert_eq!(bundle.files["g"].digest(), Some(&only_b));
    assert_eq!(bundle.files["r"].digest(), Some(&from_root));

    queue.wait_queue_empty().unwrap();
    assert!(was_fetched(&store, &only_b));
    assert!(!was_fetched(&store, &from_b));
}

#[test]
fn nested_includes_follow_preorder() {
    let (store, queue) = setup();
    let deep = store.put(b"deep");
    let shallow = store.put(b"shallow");

    // root -> [left -> [leaf], right]; leaf comes before right.
    let mut leaf = Manifest::new(HashAlgorithm::Sha1);
    leaf.files.insert("x".into(), file(&deep, None));
    let mut left = Manifest::new(HashAlgorithm::Sha1);
    left.includes = vec![put_manifest(&store, &leaf)];
    let mut right = Manifest::new(HashAlgorithm::Sha1);
    right.files.insert("x".into(), file(&shallow, None));
    let mut root = Manifest::new(HashAlgorithm::Sha1);
    root.includes = vec![put_manifest(&store, &left), put_manifest(&store, &right)];
    let root = put_manifest(&store, &root);

    let bundle = resolve(&queue, root).unwrap();
    assert_eq!(bundle.files["x"].digest(), Some(&deep));
}

#[test]
fn first_command_cwd_and_read_only_win() {
    let (store, queue) = setup();
    let tool = store.put(b"#!/bin/sh\n");

    let mut child = Manifest::new(HashAlgorithm::Sha1);
    child.command = vec!["bin/tool".into(), "--flag".into()];
    child.read_only = Some(ReadOnly::Files);
    child.relative_cwd = Some("other".into());
    child.files.insert("tool".into(), file(&tool, Some(0o755)));
    let mut other = Manifest::new(HashAlgorithm::Sha1);
    other.command = vec!["ignored".into()];
    other.read_only = Some(ReadOnly::Writable);

    let mut root = Manifest::new(HashAlgorithm::Sha1);
    root.relative_cwd = Some("src".into());
    root.includes = vec![put_manifest(&store, &child), put_manifest(&store, &other)];
    let root = put_manifest(&store, &root);

    let bundle = resolve(&queue, root).unwrap();
    assert_eq!(
        bundle.command,
        vec![format!("bin{MAIN_SEPARATOR}tool"), "--flag".to_string()]
    );
    assert_eq!(bundle.relative_cwd, "src");
    assert_eq!(bundle.read_only, Some(ReadOnly::Files));
    assert!(bundle.is_read_only());
    assert_eq!(
        bundle.files["tool"],
        FileEntry::Regular {
            digest: tool,
            mode: Some(0o555),
            kind: FileKind::Basic,
        }
    );
}

#[test]
fn repeated_include_is_rejected() {
    let (store, queue) = setup();
    let shared = put_manifest(&store, &Manifest::new(HashAlgorithm::Sha1));
    let mut root = Manifest::new(HashAlgorithm::Sha1);
    root.includes = vec![shared.clone(), shared.clone()];
    let root = put_manifest(&store, &root);

    match resolve(&queue, root) {
        Err(IsoError::RecursiveInclude(hex)) => assert_eq!(hex, shared.hex()),
        other => panic!("expected RecursiveInclude, got {other:?}"),
    }
}

#[test]
fn diamond_include_is_rejected() {
    let (store, queue) = setup();
    let bottom = put_manifest(&store, &Manifest::new(HashAlgorithm::Sha1));
    let mut left = Manifest::new(HashAlgorithm::Sha1);
    left.includes = vec![bottom.clone()];
    left.command = vec!["left".into()];
    let mut right = Manifest::new(HashAlgorithm::Sha1);
    right.includes = vec![bottom];
    let mut root = Manifest::new(HashAlgorithm::Sha1);
    root.includes = vec![put_manifest(&store, &left), put_manifest(&store, &right)];
    let root = put_manifest(&store, &root);

    assert!(matches!(
        resolve(&queue, root),
        Err(IsoError::RecursiveInclude(_))
    ));
}

#[test]
fn missing_root_is_unretrievable() {
    let (store, queue) = setup();
    let absent = Digest::of_bytes(HashAlgorithm::Sha1, b"never uploaded");
    let err = resolve(&queue, absent).unwrap_err();
    assert!(matches!(err, IsoError::Unretrievable { .. }), "{err}");
    assert_eq!(store.fetches.lock().unwrap().len(), 1);
}

#[test]
fn malformed_manifest_is_rejected() {
    let (store, queue) = setup();
    let root = store.put(br#"{"version":"1.4","files":{"a":{"h":"00"}}}"#);
    let err = resolve(&queue, root).unwrap_err();
    assert!(matches!(err, IsoError::Manifest { .. }), "{err}");
}
