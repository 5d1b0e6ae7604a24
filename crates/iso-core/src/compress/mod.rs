use std::io::{Read, Write};
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::{Decompress, FlushDecompress, Status};

use crate::error::{IsoError, Result};

/// Read size for files on local disk.
pub const DISK_FILE_CHUNK: usize = 1024 * 1024;

/// Read size for compressed bytes coming off the network.
pub const NET_IO_FILE_CHUNK: usize = 16 * 1024;

/// Default zlib level for content that is not already compressed.
pub const DEFAULT_LEVEL: u32 = 7;

/// Extensions of formats that do not shrink any further; stored at level 0.
const ALREADY_COMPRESSED: &[&str] = &[
    "7z", "avi", "cur", "gif", "h264", "jar", "jpeg", "jpg", "mp4", "pdf", "png", "wav", "zip",
];

/// zlib level to use for a file, chosen by its extension.
pub fn compression_level_for(path: &Path) -> u32 {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if ALREADY_COMPRESSED.contains(&ext.as_str()) {
        0
    } else {
        DEFAULT_LEVEL
    }
}

/// Compress everything `content` yields into one zlib stream.
pub fn zip_compress(content: &mut dyn Read, level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
    let mut buf = vec![0u8; DISK_FILE_CHUNK.min(64 * 1024)];
    loop {
        let n = content.read(&mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
    }
    Ok(encoder.finish()?)
}

/// Streaming zlib decoder yielding chunks of at most `chunk_size` bytes.
///
/// Output is bounded per step so a small compressed object that inflates to
/// gigabytes never needs more than one chunk of memory at a time. The stream
/// fails if input ends before the zlib trailer or if bytes follow it.
pub struct ZipDecompress<R: Read> {
    reader: R,
    inflater: Decompress,
    input: Vec<u8>,
    pos: usize,
    chunk_size: usize,
    eof: bool,
    stream_end: bool,
    done: bool,
}

impl<R: Read> ZipDecompress<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            inflater: Decompress::new(true),
            input: Vec::with_capacity(NET_IO_FILE_CHUNK),
            pos: 0,
            chunk_size: chunk_size.max(1),
            eof: false,
            stream_end: false,
            done: false,
        }
    }

    fn refill(&mut self) -> Result<()> {
        self.input.resize(NET_IO_FILE_CHUNK, 0);
        let n = loop {
            match self.reader.read(&mut self.input) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.input.clear();
                    return Err(e.into());
                }
            }
        };
        self.input.truncate(n);
        self.pos = 0;
        if n == 0 {
            self.eof = true;
        }
        Ok(())
    }

    fn fail(&mut self, msg: String) -> Option<Result<Vec<u8>>> {
        self.done = true;
        Some(Err(IsoError::Decompression(msg)))
    }
}

impl<R: Read> Iterator for ZipDecompress<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.stream_end {
                if self.pos < self.input.len() {
                    return self.fail("Not all data was decompressed".into());
                }
                if !self.eof {
                    if let Err(e) = self.refill() {
                        self.done = true;
                        return Some(Err(e));
                    }
                    continue;
                }
                self.done = true;
                return None;
            }
            if self.pos == self.input.len() && !self.eof {
                if let Err(e) = self.refill() {
                    self.done = true;
                    return Some(Err(e));
                }
                continue;
            }

            let mut out = Vec::with_capacity(self.chunk_size);
            let before = self.inflater.total_in();
            let status = self.inflater.decompress_vec(
                &self.input[self.pos..],
                &mut out,
                FlushDecompress::None,
            );
            let status = match status {
                Ok(s) => s,
                Err(e) => {
                    let read = self.inflater.total_in();
                    return self.fail(format!("Corrupted zip stream (read {read} bytes) - {e}"));
                }
            };
            let consumed = (self.inflater.total_in() - before) as usize;
            self.pos += consumed;
            if status == Status::StreamEnd {
                self.stream_end = true;
            }
            if !out.is_empty() {
                return Some(Ok(out));
            }
            if self.eof && !self.stream_end && self.pos == self.input.len() {
                let read = self.inflater.total_in();
                return self.fail(format!("Truncated zip stream (read {read} bytes)"));
            }
            if consumed == 0 && !self.stream_end && self.pos < self.input.len() {
                return self.fail("zip stream made no progress".into());
            }
        }
    }
}
