use std::io::Read;

use iso_types::{Digest, Hasher};

use crate::error::{IsoError, Result};

/// Splits a reader into owned chunks of at most `chunk_size` bytes.
pub struct ReaderChunks<R> {
    reader: R,
    chunk_size: usize,
    done: bool,
}

impl<R: Read> ReaderChunks<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }
}

impl<R: Read> Iterator for ReaderChunks<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.done = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        if filled == 0 {
            return None;
        }
        buf.truncate(filled);
        Some(Ok(buf))
    }
}

/// Checks a fetched stream against its digest before the consumer sees the
/// end of it.
///
/// One chunk is held back; the last chunk is only released after the total
/// size and the hash matched, so a cache writer never commits a corrupt blob.
pub struct VerifiedStream<I> {
    inner: I,
    expected: Digest,
    hasher: Option<Hasher>,
    size: u64,
    held: Option<Vec<u8>>,
    done: bool,
    failed: bool,
}

impl<I> VerifiedStream<I>
where
    I: Iterator<Item = Result<Vec<u8>>>,
{
    pub fn new(inner: I, expected: Digest) -> Self {
        Self {
            hasher: Some(expected.algorithm().hasher()),
            inner,
            expected,
            size: 0,
            held: None,
            done: false,
            failed: false,
        }
    }

    /// Whether this stream (rather than its consumer) produced an error.
    pub fn failed(&self) -> bool {
        self.failed
    }

    fn fail(&mut self, err: IsoError) -> Option<Result<Vec<u8>>> {
        self.done = true;
        self.failed = true;
        self.held = None;
        Some(Err(err))
    }

    fn mismatch(&self, reason: String) -> IsoError {
        IsoError::Transfer {
            digest: self.expected.hex().to_string(),
            reason,
        }
    }

    fn finish(&mut self) -> Option<Result<Vec<u8>>> {
        self.done = true;
        if let Some(want) = self.expected.size() {
            if want != self.size {
                let err = self.mismatch(format!(
                    "Incorrect file size: want {want}, got {}",
                    self.size
                ));
                return self.fail(err);
            }
        }
        let actual = self.hasher.take().map(Hasher::finalize_hex).unwrap_or_default();
        if actual != self.expected.hex() {
            let err = self.mismatch(format!(
                "Incorrect digest: want {}, got {actual}",
                self.expected.hex()
            ));
            return self.fail(err);
        }
        self.held.take().map(Ok)
    }
}

impl<I> Iterator for VerifiedStream<I>
where
    I: Iterator<Item = Result<Vec<u8>>>,
{
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next() {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.size += chunk.len() as u64;
                    if let Some(h) = self.hasher.as_mut() {
                        h.update(&chunk);
                    }
                    if let Some(want) = self.expected.size() {
                        if self.size > want {
                            let err = self.mismatch(format!(
                                "Incorrect file size: want {want}, got at least {}",
                                self.size
                            ));
                            return self.fail(err);
                        }
                    }
                    if let Some(prev) = self.held.replace(chunk) {
                        return Some(Ok(prev));
                    }
                }
                Some(Err(e)) => return self.fail(e),
                None => return self.finish(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iso_types::HashAlgorithm;

    fn chunks(data: &[u8], n: usize) -> Vec<Result<Vec<u8>>> {
        data.chunks(n).map(|c| Ok(c.to_vec())).collect()
    }

    #[test]
    fn good_stream_passes_through() {
        let data = b"0123456789abcdef".repeat(10);
        let d = Digest::of_bytes(HashAlgorithm::Sha1, &data);
        let out: Result<Vec<Vec<u8>>> = VerifiedStream::new(chunks(&data, 7).into_iter(), d).collect();
        assert_eq!(out.unwrap().concat(), data);
    }

    #[test]
    fn empty_blob_yields_nothing() {
        let d = Digest::of_bytes(HashAlgorithm::Sha1, b"");
        let mut s = VerifiedStream::new(std::iter::empty(), d);
        assert!(s.next().is_none());
        assert!(!s.failed());
    }

    #[test]
    fn wrong_size_is_caught_before_last_chunk() {
        let d = Digest::of_bytes(HashAlgorithm::Sha1, b"hello").with_size(Some(4));
        let mut s = VerifiedStream::new(chunks(b"hello", 2).into_iter(), d);
        let mut seen = Vec::new();
        let err = loop {
            match s.next() {
                Some(Ok(c)) => seen.extend(c),
                Some(Err(e)) => break e,
                None => panic!("expected an error"),
            }
        };
        assert!(seen.len() < 5);
        assert!(matches!(err, IsoError::Transfer { .. }), "got: {err}");
        assert!(s.failed());
    }

    #[test]
    fn wrong_content_is_rejected() {
        let d = Digest::of_bytes(HashAlgorithm::Sha1, b"hello");
        let out: Result<Vec<Vec<u8>>> =
            VerifiedStream::new(chunks(b"jello", 2).into_iter(), d).collect();
        let err = out.unwrap_err().to_string();
        assert!(err.contains("Incorrect digest"), "got: {err}");
    }

    #[test]
    fn reader_chunks_split_input() {
        let data = vec![1u8; 2500];
        let parts: Vec<Vec<u8>> = ReaderChunks::new(data.as_slice(), 1000)
            .collect::<Result<_>>()
            .unwrap();
        let sizes: Vec<usize> = parts.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }
}
