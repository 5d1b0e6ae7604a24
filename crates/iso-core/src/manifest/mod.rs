//! Manifest (`.isolated`) format.
//!
//! A manifest is a JSON record naming a command, a working directory and the
//! files a task needs, optionally delegating part of that to child manifests
//! listed in `includes`. Records are validated once when decoded; unknown
//! keys are rejected.

pub mod resolve;

use std::collections::BTreeMap;
use std::path::MAIN_SEPARATOR;

use serde::{Deserialize, Serialize};

use iso_types::{Digest, HashAlgorithm};

use crate::error::{IsoError, Result};

pub use resolve::{resolve, ResolvedBundle};

/// Version written into generated manifests.
pub const MANIFEST_VERSION: &str = "1.4";
const SUPPORTED_MAJOR: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Basic,
    /// A tar archive to unpack next to the entry's path.
    Tar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEntry {
    Regular {
        digest: Digest,
        mode: Option<u32>,
        kind: FileKind,
    },
    Symlink {
        target: String,
    },
}

impl FileEntry {
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            FileEntry::Regular { digest, .. } => Some(digest),
            FileEntry::Symlink { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOnly {
    Writable,
    /// Files are read-only, directories stay writable.
    Files,
    /// The whole tree is read-only.
    Tree,
}

impl ReadOnly {
    pub fn is_read_only(self) -> bool {
        self != ReadOnly::Writable
    }

    fn from_level(level: u8) -> Result<Self> {
        match level {
            0 => Ok(ReadOnly::Writable),
            1 => Ok(ReadOnly::Files),
            2 => Ok(ReadOnly::Tree),
            other => Err(field_err("read_only", format!("expected 0, 1 or 2, got {other}"))),
        }
    }

    fn level(self) -> u8 {
        match self {
            ReadOnly::Writable => 0,
            ReadOnly::Files => 1,
            ReadOnly::Tree => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub algo: HashAlgorithm,
    pub version: String,
    pub command: Vec<String>,
    pub files: BTreeMap<String, FileEntry>,
    pub includes: Vec<Digest>,
    pub read_only: Option<ReadOnly>,
    pub relative_cwd: Option<String>,
}

// Field order is alphabetical so the encoded JSON has sorted keys.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    algo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<BTreeMap<String, RawFile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    includes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    read_only: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relative_cwd: Option<String>,
    version: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    h: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    m: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t: Option<String>,
}

fn field_err(field: impl Into<String>, reason: impl Into<String>) -> IsoError {
    IsoError::Manifest {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Host separators for a manifest path, rejecting anything that could
/// escape the output directory.
fn normalize_path(field: &str, path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    if unified.is_empty() {
        return Err(field_err(field, "empty path"));
    }
    if unified.starts_with('/') || unified.as_bytes().get(1) == Some(&b':') {
        return Err(field_err(field, format!("'{path}' is absolute")));
    }
    if unified.split('/').any(|part| part == "..") {
        return Err(field_err(field, format!("'{path}' escapes the tree")));
    }
    Ok(unified.replace('/', &MAIN_SEPARATOR.to_string()))
}

impl Manifest {
    pub fn new(algo: HashAlgorithm) -> Self {
        Self {
            algo,
            version: MANIFEST_VERSION.to_string(),
            command: Vec::new(),
            files: BTreeMap::new(),
            includes: Vec::new(),
            read_only: None,
            relative_cwd: None,
        }
    }

    /// Decode and validate a manifest stored in a namespace hashing with
    /// `algo`.
    pub fn parse(data: &[u8], algo: HashAlgorithm) -> Result<Self> {
        let raw: RawManifest =
            serde_json::from_slice(data).map_err(|e| field_err("manifest", e.to_string()))?;

        let version = raw
            .version
            .ok_or_else(|| field_err("version", "missing"))?;
        if version.split('.').next() != Some(SUPPORTED_MAJOR) || !version.contains('.') {
            return Err(IsoError::UnsupportedVersion(version));
        }

        let declared = match raw.algo.as_deref() {
            Some(name) => HashAlgorithm::from_name(name)?,
            None => HashAlgorithm::Sha1,
        };
        if declared != algo {
            return Err(field_err(
                "algo",
                format!("expected {}, got {}", algo.name(), declared.name()),
            ));
        }

        let mut files = BTreeMap::new();
        for (path, raw_file) in raw.files.unwrap_or_default() {
            let field = format!("files.{path}");
            let entry = Self::parse_file(&field, algo, raw_file)?;
            files.insert(normalize_path(&field, &path)?, entry);
        }

        let includes = raw
            .includes
            .unwrap_or_default()
            .into_iter()
            .map(|h| Digest::new(algo, h, None).map_err(|e| field_err("includes", e.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let read_only = raw.read_only.map(ReadOnly::from_level).transpose()?;

        let relative_cwd = match raw.relative_cwd {
            Some(cwd) if cwd.is_empty() || cwd == "." => Some(String::new()),
            Some(cwd) => Some(normalize_path("relative_cwd", &cwd)?),
            None => None,
        };

        Ok(Self {
            algo,
            version,
            command: raw.command.unwrap_or_default(),
            files,
            includes,
            read_only,
            relative_cwd,
        })
    }

    fn parse_file(field: &str, algo: HashAlgorithm, raw: RawFile) -> Result<FileEntry> {
        match (raw.h, raw.l) {
            (Some(_), Some(_)) => Err(field_err(field, "has both 'h' and 'l'")),
            (None, None) => Err(field_err(field, "needs one of 'h' or 'l'")),
            (None, Some(target)) => {
                if raw.s.is_some() || raw.t.is_some() || raw.m.is_some() {
                    return Err(field_err(field, "a symlink only carries 'l'"));
                }
                Ok(FileEntry::Symlink { target })
            }
            (Some(h), None) => {
                let size = raw.s.ok_or_else(|| field_err(field, "'h' requires 's'"))?;
                let digest =
                    Digest::new(algo, h, Some(size)).map_err(|e| field_err(field, e.to_string()))?;
                let kind = match raw.t.as_deref() {
                    None | Some("basic") => FileKind::Basic,
                    Some("tar") => FileKind::Tar,
                    Some(other) => {
                        return Err(field_err(field, format!("unknown file type '{other}'")))
                    }
                };
                Ok(FileEntry::Regular {
                    digest,
                    mode: raw.m,
                    kind,
                })
            }
        }
    }

    /// Compact JSON with sorted keys, paths using `/`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let files = self
            .files
            .iter()
            .map(|(path, entry)| {
                let raw = match entry {
                    FileEntry::Regular { digest, mode, kind } => RawFile {
                        h: Some(digest.hex().to_string()),
                        l: None,
                        m: *mode,
                        s: Some(digest.size().unwrap_or(0)),
                        t: (*kind == FileKind::Tar).then(|| "tar".to_string()),
                    },
                    FileEntry::Symlink { target } => RawFile {
                        h: None,
                        l: Some(target.clone()),
                        m: None,
                        s: None,
                        t: None,
                    },
                };
                (path.replace(MAIN_SEPARATOR, "/"), raw)
            })
            .collect();
        let raw = RawManifest {
            algo: Some(self.algo.name().to_string()),
            command: (!self.command.is_empty()).then(|| self.command.clone()),
            files: Some(files),
            includes: (!self.includes.is_empty())
                .then(|| self.includes.iter().map(|d| d.hex().to_string()).collect()),
            read_only: self.read_only.map(ReadOnly::level),
            relative_cwd: self
                .relative_cwd
                .as_ref()
                .map(|cwd| cwd.replace(MAIN_SEPARATOR, "/")),
            version: Some(self.version.clone()),
        };
        Ok(serde_json::to_vec(&raw)?)
    }
}
