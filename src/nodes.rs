//! FUSE nodeid ↔ logical path table.
//!
//! The transport addresses objects by nodeid; the union core thinks in
//! mount-relative paths. Nodeids are allocated sequentially and held
//! alive by the kernel's lookup count. The root is nodeid 1, path `""`,
//! and is never forgotten.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;

use nix::errno::Errno;

pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct Node {
    path: PathBuf,
    nlookup: u64,
}

#[derive(Debug)]
pub struct NodeTable {
    by_ino: HashMap<u64, Node>,
    by_path: HashMap<PathBuf, u64>,
    next: u64,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    pub fn new() -> NodeTable {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(
            ROOT_INO,
            Node {
                path: PathBuf::new(),
                nlookup: 1,
            },
        );
        by_path.insert(PathBuf::new(), ROOT_INO);
        NodeTable {
            by_ino,
            by_path,
            next: ROOT_INO + 1,
        }
    }

    pub fn path_of(&self, ino: u64) -> Result<PathBuf, Errno> {
        self.by_ino
            .get(&ino)
            .map(|n| n.path.clone())
            .ok_or(Errno::ENOENT)
    }

    /// Logical path of `name` under the node `parent`.
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf, Errno> {
        if name == OsStr::new(".") || name == OsStr::new("..") {
            return Err(Errno::EINVAL);
        }
        Ok(self.path_of(parent)?.join(name))
    }

    /// Get-or-assign a nodeid for `path` and take one lookup reference.
    pub fn remember(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            if let Some(node) = self.by_ino.get_mut(&ino) {
                node.nlookup += 1;
            }
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(
            ino,
            Node {
                path: path.to_path_buf(),
                nlookup: 1,
            },
        );
        self.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let remove = match self.by_ino.get_mut(&ino) {
            Some(node) => {
                node.nlookup = node.nlookup.saturating_sub(nlookup);
                node.nlookup == 0
            }
            None => false,
        };
        if remove {
            if let Some(node) = self.by_ino.remove(&ino) {
                // only drop the reverse mapping if it still points here
                if self.by_path.get(&node.path) == Some(&ino) {
                    self.by_path.remove(&node.path);
                }
            }
        }
    }

    /// Re-root a node and all its descendants after a rename.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        let mut moves = Vec::new();
        for (ino, node) in &self.by_ino {
            if node.path == from || node.path.starts_with(from) {
                let rel = node.path.strip_prefix(from).unwrap_or(Path::new(""));
                let renamed = if rel.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rel)
                };
                moves.push((*ino, node.path.clone(), renamed));
            }
        }
        for (ino, old, new) in moves {
            if self.by_path.get(&old) == Some(&ino) {
                self.by_path.remove(&old);
            }
            if let Some(node) = self.by_ino.get_mut(&ino) {
                node.path = new.clone();
            }
            self.by_path.insert(new, ino);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_ino.len()
    }
}
