use std::path::Path;

use crate::compress::{compression_level_for, zip_compress, ZipDecompress, DEFAULT_LEVEL};
use crate::error::IsoError;

fn decompress_all(data: &[u8], chunk: usize) -> Result<Vec<Vec<u8>>, IsoError> {
    ZipDecompress::new(data, chunk).collect()
}

#[test]
fn roundtrip_all_levels() {
    let data = b"hello world, zlib compression test data here".repeat(50);
    for level in [0, 1, 7, 9] {
        let compressed = zip_compress(&mut data.as_slice(), level).unwrap();
        let out: Vec<u8> = decompress_all(&compressed, 1024).unwrap().concat();
        assert_eq!(out, data, "level {level}");
    }
}

#[test]
fn empty_input_roundtrips_to_nothing() {
    let compressed = zip_compress(&mut &b""[..], DEFAULT_LEVEL).unwrap();
    assert!(!compressed.is_empty());
    let chunks = decompress_all(&compressed, 16).unwrap();
    assert!(chunks.iter().all(|c| c.is_empty()));
}

#[test]
fn repetitive_data_actually_compresses() {
    let data = vec![0x42u8; 100_000];
    let compressed = zip_compress(&mut data.as_slice(), DEFAULT_LEVEL).unwrap();
    assert!(compressed.len() < data.len() / 10);
}

#[test]
fn chunks_never_exceed_limit() {
    // A tiny compressed payload inflating to 4 MiB.
    let data = vec![0u8; 4 * 1024 * 1024];
    let compressed = zip_compress(&mut data.as_slice(), 9).unwrap();
    let mut total = 0usize;
    for chunk in ZipDecompress::new(compressed.as_slice(), 4096) {
        let chunk = chunk.unwrap();
        assert!(chunk.len() <= 4096, "chunk of {} bytes", chunk.len());
        total += chunk.len();
    }
    assert_eq!(total, data.len());
}

#[test]
fn trailing_garbage_rejected() {
    let mut compressed = zip_compress(&mut &b"payload"[..], DEFAULT_LEVEL).unwrap();
    compressed.extend_from_slice(b"junk");
    let err = decompress_all(&compressed, 1024).unwrap_err();
    match err {
        IsoError::Decompression(msg) => assert_eq!(msg, "Not all data was decompressed"),
        other => panic!("expected Decompression error, got: {other}"),
    }
}

#[test]
fn truncated_stream_rejected() {
    let data = b"some data that will be cut short".repeat(100);
    let compressed = zip_compress(&mut data.as_slice(), DEFAULT_LEVEL).unwrap();
    let cut = &compressed[..compressed.len() / 2];
    let err = decompress_all(cut, 1024).unwrap_err();
    assert!(matches!(err, IsoError::Decompression(_)), "got: {err}");
    assert!(err.is_retryable());
}

#[test]
fn corrupt_stream_rejected() {
    let err = decompress_all(b"definitely not zlib", 1024).unwrap_err();
    assert!(matches!(err, IsoError::Decompression(_)), "got: {err}");
}

#[test]
fn level_by_extension() {
    assert_eq!(compression_level_for(Path::new("photo.JPG")), 0);
    assert_eq!(compression_level_for(Path::new("dir/archive.zip")), 0);
    assert_eq!(compression_level_for(Path::new("video.mp4")), 0);
    assert_eq!(compression_level_for(Path::new("main.rs")), DEFAULT_LEVEL);
    assert_eq!(compression_level_for(Path::new("Makefile")), DEFAULT_LEVEL);
}
