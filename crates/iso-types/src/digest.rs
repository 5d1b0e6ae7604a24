use std::fmt;
use std::hash::{Hash, Hasher as StdHasher};

use sha1::Sha1;
use sha2::Digest as _;
use sha2::{Sha256, Sha512};

use crate::error::{IsoError, Result};

/// Hash algorithm naming blobs in a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Raw digest length in bytes. The hex form is twice as long.
    pub fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Name used in the manifest `algo` field.
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha-1",
            HashAlgorithm::Sha256 => "sha-256",
            HashAlgorithm::Sha512 => "sha-512",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sha-1" => Ok(HashAlgorithm::Sha1),
            "sha-256" => Ok(HashAlgorithm::Sha256),
            "sha-512" => Ok(HashAlgorithm::Sha512),
            other => Err(IsoError::Manifest {
                field: "algo".into(),
                reason: format!("unsupported hash algorithm '{other}'"),
            }),
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    /// Whether `hex` has the right length and alphabet for this algorithm.
    pub fn is_valid_hex(self, hex: &str) -> bool {
        hex.len() == 2 * self.digest_size()
            && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

/// Incremental hasher over one of the supported algorithms.
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Content fingerprint of a blob: algorithm, lowercase hex digest and, when
/// known, the uncompressed byte size.
///
/// Equality and hashing only consider the algorithm and the hex string, so a
/// digest with an unknown size matches the same digest with its size filled in.
#[derive(Clone)]
pub struct Digest {
    algo: HashAlgorithm,
    hex: String,
    size: Option<u64>,
}

impl Digest {
    /// Build a digest from its hex form, validating length and alphabet.
    pub fn new(algo: HashAlgorithm, hex: impl Into<String>, size: Option<u64>) -> Result<Self> {
        let hex = hex.into();
        if !algo.is_valid_hex(&hex) {
            return Err(IsoError::InvalidDigest(format!(
                "'{hex}' is not a valid {} digest",
                algo.name()
            )));
        }
        Ok(Self { algo, hex, size })
    }

    /// Hash an in-memory buffer.
    pub fn of_bytes(algo: HashAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algo.hasher();
        hasher.update(data);
        Self {
            algo,
            hex: hasher.finalize_hex(),
            size: Some(data.len() as u64),
        }
    }

    /// Hash everything a reader yields.
    pub fn of_reader(algo: HashAlgorithm, reader: &mut dyn std::io::Read) -> Result<Self> {
        let mut hasher = algo.hasher();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok(Self {
            algo,
            hex: hasher.finalize_hex(),
            size: Some(size),
        })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algo
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Same digest with the size replaced.
    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    /// First 16 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.hex[..self.hex.len().min(16)]
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        self.algo == other.algo && self.hex == other.hex
    }
}

impl Eq for Digest {}

impl Hash for Digest {
    fn hash<H: StdHasher>(&self, state: &mut H) {
        self.algo.hash(state);
        self.hex.hash(state);
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size {
            Some(size) => write!(f, "Digest({}:{}, {size}B)", self.algo.name(), self.short()),
            None => write!(f, "Digest({}:{}, ?)", self.algo.name(), self.short()),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}
