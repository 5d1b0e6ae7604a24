use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::MAIN_SEPARATOR;

use tracing::debug;

use iso_types::Digest;

use super::{FileEntry, Manifest, ReadOnly};
use crate::error::{IsoError, Result};
use crate::fetch_queue::FetchQueue;
use crate::pool::{PRIORITY_HIGH, PRIORITY_MED};

/// Flattened view of a manifest tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBundle {
    pub root: Digest,
    pub command: Vec<String>,
    pub files: BTreeMap<String, FileEntry>,
    pub read_only: Option<ReadOnly>,
    pub relative_cwd: String,
}

impl ResolvedBundle {
    pub fn is_read_only(&self) -> bool {
        self.read_only.is_some_and(ReadOnly::is_read_only)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Unfetched,
    Fetched,
    FilesContributed,
}

struct Node {
    digest: Digest,
    state: NodeState,
    manifest: Option<Manifest>,
    children: Vec<usize>,
}

/// Accumulates the bundle while nodes are visited in pre-order.
struct Builder {
    command: Vec<String>,
    files: BTreeMap<String, FileEntry>,
    read_only: Option<ReadOnly>,
    relative_cwd: Option<String>,
}

impl Builder {
    fn absorb(&mut self, manifest: &Manifest, queue: &FetchQueue) -> Result<()> {
        if self.command.is_empty() && !manifest.command.is_empty() {
            self.command = manifest.command.clone();
            self.command[0] = self.command[0].replace('/', &MAIN_SEPARATOR.to_string());
        }
        if self.read_only.is_none() {
            self.read_only = manifest.read_only;
        }
        if self.relative_cwd.is_none() {
            self.relative_cwd = manifest.relative_cwd.clone();
        }

        let strip_write = self.read_only.is_some_and(ReadOnly::is_read_only);
        for (path, entry) in &manifest.files {
            // Earlier manifests win; overridden files are never fetched.
            if self.files.contains_key(path) {
                continue;
            }
            let mut entry = entry.clone();
            if let FileEntry::Regular { digest, mode, .. } = &mut entry {
                if strip_write {
                    *mode = mode.map(|m| m & !0o222);
                }
                queue.add(digest.clone(), PRIORITY_MED)?;
            }
            self.files.insert(path.clone(), entry);
        }
        Ok(())
    }
}

/// Fetch the manifest `root` and everything it includes, starting fetches of
/// the data files as soon as their manifest is allowed to contribute.
///
/// Included manifests are all fetched eagerly at high priority, but a node
/// only contributes once every node before it in pre-order has, so an
/// earlier manifest always overrides a later one. Data files are queued at
/// medium priority and not waited for.
pub fn resolve(queue: &FetchQueue, root: Digest) -> Result<ResolvedBundle> {
    let algo = queue.storage().hash_algorithm();
    let mut arena = vec![Node {
        digest: root.clone(),
        state: NodeState::Unfetched,
        manifest: None,
        children: Vec::new(),
    }];
    let mut pending: HashMap<Digest, usize> = HashMap::new();
    let mut seen: HashSet<Digest> = HashSet::new();
    let mut builder = Builder {
        command: Vec::new(),
        files: BTreeMap::new(),
        read_only: None,
        relative_cwd: None,
    };

    let mut retrieve = |idx: usize, digest: &Digest, pending: &mut HashMap<Digest, usize>| {
        if !seen.insert(digest.clone()) {
            return Err(IsoError::RecursiveInclude(digest.hex().to_string()));
        }
        pending.insert(digest.clone(), idx);
        queue.wait_on(digest.clone());
        queue.add(digest.clone(), PRIORITY_HIGH)
    };
    retrieve(0, &root, &mut pending)?;

    while !pending.is_empty() {
        let digest = queue.wait()?;
        let idx = pending
            .remove(&digest)
            .ok_or_else(|| IsoError::Other(format!("unexpected manifest {}", digest.short())))?;
        let manifest = Manifest::parse(&queue.cache().read(&digest)?, algo)?;

        for include in &manifest.includes {
            let child = arena.len();
            arena.push(Node {
                digest: include.clone(),
                state: NodeState::Unfetched,
                manifest: None,
                children: Vec::new(),
            });
            arena[idx].children.push(child);
            retrieve(child, include, &mut pending)?;
        }
        arena[idx].manifest = Some(manifest);
        arena[idx].state = NodeState::Fetched;

        for node in preorder(&arena) {
            match arena[node].state {
                NodeState::FilesContributed => continue,
                NodeState::Unfetched => break,
                NodeState::Fetched => {}
            }
            if let Some(manifest) = &arena[node].manifest {
                debug!(
                    "fetch_files({}, {})",
                    arena[node].digest.short(),
                    manifest.files.len()
                );
                builder.absorb(manifest, queue)?;
            }
            arena[node].state = NodeState::FilesContributed;
        }
    }

    if let Some(node) = arena
        .iter()
        .find(|n| n.state != NodeState::FilesContributed)
    {
        return Err(IsoError::Other(format!(
            "manifest {} was never processed",
            node.digest.short()
        )));
    }

    Ok(ResolvedBundle {
        root,
        command: builder.command,
        files: builder.files,
        read_only: builder.read_only,
        relative_cwd: builder.relative_cwd.unwrap_or_default(),
    })
}

fn preorder(arena: &[Node]) -> Vec<usize> {
    let mut order = Vec::with_capacity(arena.len());
    let mut stack = vec![0];
    while let Some(idx) = stack.pop() {
        order.push(idx);
        stack.extend(arena[idx].children.iter().rev());
    }
    order
}
