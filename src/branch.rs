//! Branch model and the copy-on-write branch registry.
//!
//! A branch is one backing directory. The registry publishes an
//! immutable `Arc<Branches>`; readers snapshot it once per operation and
//! never lock while iterating. Writers rebuild the list and publish it
//! atomically.

use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::RwLock;

use crate::num;
use crate::sys;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BranchMode {
    /// Fully writable.
    ReadWrite,
    /// Writes are refused with EROFS.
    ReadOnly,
    /// Writable, but never selected by create policies.
    NoCreate,
}

impl FromStr for BranchMode {
    type Err = Errno;

    fn from_str(s: &str) -> Result<Self, Errno> {
        match s.to_ascii_uppercase().as_str() {
            "RW" => Ok(BranchMode::ReadWrite),
            "RO" => Ok(BranchMode::ReadOnly),
            "NC" => Ok(BranchMode::NoCreate),
            _ => Err(Errno::EINVAL),
        }
    }
}

impl fmt::Display for BranchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchMode::ReadWrite => write!(f, "RW"),
            BranchMode::ReadOnly => write!(f, "RO"),
            BranchMode::NoCreate => write!(f, "NC"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Branch {
    pub path: PathBuf,
    pub mode: BranchMode,
    /// Per-branch override of the global minfreespace.
    pub minfreespace: Option<u64>,
    pub enabled: bool,
    /// st_dev of the branch root, cached at registration.
    pub dev: u64,
}

impl Branch {
    fn new(path: PathBuf, mode: BranchMode, minfreespace: Option<u64>) -> Result<Branch, Errno> {
        let meta = sys::stat(&path)?;
        if !meta.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        let path = path.canonicalize().map_err(|e| sys::errno_from_io(&e))?;
        Ok(Branch {
            path,
            mode,
            minfreespace,
            enabled: true,
            dev: meta.dev(),
        })
    }

    /// Backing path of a logical (mount-relative) path on this branch.
    pub fn full_path(&self, rel: &Path) -> PathBuf {
        debug_assert!(!rel.is_absolute());
        self.path.join(rel)
    }

    pub fn minfree(&self, global: u64) -> u64 {
        self.minfreespace.unwrap_or(global)
    }

    pub fn ro(&self) -> bool {
        self.mode == BranchMode::ReadOnly
    }

    pub fn ro_or_nc(&self) -> bool {
        matches!(self.mode, BranchMode::ReadOnly | BranchMode::NoCreate)
    }

    fn to_spec(&self) -> String {
        let mut s = format!("{}={}", self.path.display(), self.mode);
        if let Some(minfree) = self.minfreespace {
            s.push(',');
            s.push_str(&num::humanize(minfree));
        }
        s
    }
}

#[derive(Clone, Debug, Default)]
pub struct Branches {
    pub list: Vec<Branch>,
}

impl Branches {
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Branch> {
        self.list.iter()
    }

    /// User-facing string form, `:`-joined specs.
    pub fn to_spec(&self) -> String {
        let specs: Vec<String> = self.list.iter().map(Branch::to_spec).collect();
        specs.join(":")
    }

    /// Parse `PATH[=MODE[,MINFREE]]` repeated with `:` (or `+`) between
    /// entries. Globs expand to zero or more branches. An empty result
    /// is EINVAL; a non-glob path that does not exist is ENOENT.
    pub fn parse(spec: &str) -> Result<Branches, Errno> {
        let mut list = Vec::new();
        for part in spec.split([':', '+']).filter(|p| !p.is_empty()) {
            for branch in parse_one(part)? {
                list.push(branch);
            }
        }
        if list.is_empty() {
            return Err(Errno::EINVAL);
        }
        let mut seen = std::collections::HashSet::new();
        list.retain(|b: &Branch| seen.insert(b.path.clone()));
        Ok(Branches { list })
    }
}

fn parse_one(part: &str) -> Result<Vec<Branch>, Errno> {
    let (path_str, mode, minfree) = match part.split_once('=') {
        None => (part, BranchMode::ReadWrite, None),
        Some((path, tail)) => match tail.split_once(',') {
            None => (path, tail.parse()?, None),
            Some((mode, minfree)) => (path, mode.parse()?, Some(num::parse_size(minfree)?)),
        },
    };

    let is_glob = path_str.contains(['*', '?', '[']);
    if !is_glob {
        return Ok(vec![Branch::new(PathBuf::from(path_str), mode, minfree)?]);
    }

    let mut out = Vec::new();
    for hit in sys::glob(Path::new(path_str))? {
        // globs may match non-directories; skip them silently
        if let Ok(branch) = Branch::new(hit, mode, minfree) {
            out.push(branch);
        }
    }
    Ok(out)
}

/// Copy-on-write holder of the branch list.
#[derive(Debug)]
pub struct BranchRegistry {
    current: RwLock<Arc<Branches>>,
}

impl BranchRegistry {
    pub fn new(branches: Branches) -> BranchRegistry {
        BranchRegistry {
            current: RwLock::new(Arc::new(branches)),
        }
    }

    /// O(1) immutable snapshot; safe to hold across syscalls.
    pub fn snapshot(&self) -> Arc<Branches> {
        self.current.read().clone()
    }

    pub fn set(&self, branches: Branches) {
        *self.current.write() = Arc::new(branches);
    }

    pub fn set_from_spec(&self, spec: &str) -> Result<(), Errno> {
        self.set(Branches::parse(spec)?);
        Ok(())
    }

    pub fn add_spec(&self, spec: &str) -> Result<(), Errno> {
        let additions = Branches::parse(spec)?;
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        for branch in additions.list {
            if !next.list.iter().any(|b| b.path == branch.path) {
                next.list.push(branch);
            }
        }
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn remove_path(&self, path: &Path) -> Result<(), Errno> {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        let before = next.list.len();
        next.list.retain(|b| b.path != path);
        if next.list.len() == before {
            return Err(Errno::ENOENT);
        }
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn set_mode(&self, path: &Path, mode: BranchMode) -> Result<(), Errno> {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        let branch = next
            .list
            .iter_mut()
            .find(|b| b.path == path)
            .ok_or(Errno::ENOENT)?;
        branch.mode = mode;
        *guard = Arc::new(next);
        Ok(())
    }
}
