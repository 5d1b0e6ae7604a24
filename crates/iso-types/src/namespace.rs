use std::fmt;

use serde::{Deserialize, Serialize};

use crate::digest::HashAlgorithm;
use crate::error::{IsoError, Result};

/// Isolate server namespace. The name fixes both the hash algorithm and
/// whether blobs are stored zlib-compressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(IsoError::Config("namespace must not be empty".into()));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            return Err(IsoError::Config(format!(
                "namespace '{name}' contains invalid characters"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        if self.0.starts_with("sha256-") {
            HashAlgorithm::Sha256
        } else if self.0.starts_with("sha512-") {
            HashAlgorithm::Sha512
        } else {
            HashAlgorithm::Sha1
        }
    }

    pub fn uses_compression(&self) -> bool {
        self.0.ends_with("-gzip") || self.0.ends_with("-deflate")
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self("default-gzip".into())
    }
}

impl TryFrom<String> for Namespace {
    type Error = IsoError;

    fn try_from(name: String) -> Result<Self> {
        Self::new(name)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_and_compression_from_name() {
        let ns = Namespace::default();
        assert_eq!(ns.hash_algorithm(), HashAlgorithm::Sha1);
        assert!(ns.uses_compression());

        let ns = Namespace::new("sha256-deflate").unwrap();
        assert_eq!(ns.hash_algorithm(), HashAlgorithm::Sha256);
        assert!(ns.uses_compression());

        let ns = Namespace::new("sha512-flat").unwrap();
        assert_eq!(ns.hash_algorithm(), HashAlgorithm::Sha512);
        assert!(!ns.uses_compression());

        let ns = Namespace::new("default").unwrap();
        assert!(!ns.uses_compression());
    }

    #[test]
    fn rejects_empty_and_odd_names() {
        assert!(Namespace::new("").is_err());
        assert!(Namespace::new("a/b").is_err());
        assert!(Namespace::new("with space").is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let ns: Namespace = serde_json::from_str("\"sha256-gzip\"").unwrap();
        assert_eq!(ns.hash_algorithm(), HashAlgorithm::Sha256);
        assert_eq!(serde_json::to_string(&ns).unwrap(), "\"sha256-gzip\"");

        let err = serde_json::from_str::<Namespace>("\"bad/name\"").unwrap_err();
        assert!(err.to_string().contains("invalid characters"), "{err}");
        assert!(serde_json::from_str::<Namespace>("\"\"").is_err());
    }
}
