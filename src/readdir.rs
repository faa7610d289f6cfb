//! Readdir union: merge directory streams from every branch holding the
//! directory, first occurrence of a name wins.
//!
//! No policy applies here. Dedup is a name set, so the result is
//! order-independent; "first occurrence" is defined by branch order even
//! in concurrent mode because per-branch buffers are merged in order.

use std::collections::HashSet;
use std::ffi::OsString;
use std::os::unix::fs::DirEntryExt;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use fuser::FileType;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::branch::Branches;
use crate::config::ReaddirMode;
use crate::sys;

#[derive(Clone, Debug)]
pub struct DirEntryOut {
    pub name: OsString,
    /// Index of the branch that produced the entry.
    pub branch: usize,
    /// st_dev of that branch, st_ino of the backing entry.
    pub dev: u64,
    pub ino: u64,
    pub kind: FileType,
}

pub(crate) fn filetype(t: std::fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt;
    if t.is_dir() {
        FileType::Directory
    } else if t.is_symlink() {
        FileType::Symlink
    } else if t.is_fifo() {
        FileType::NamedPipe
    } else if t.is_char_device() {
        FileType::CharDevice
    } else if t.is_block_device() {
        FileType::BlockDevice
    } else if t.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn read_branch(dir: &Path) -> Result<Vec<(OsString, FileType, u64)>, Errno> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| sys::errno_from_io(&e))? {
        let entry = entry.map_err(|e| sys::errno_from_io(&e))?;
        let kind = match entry.file_type() {
            Ok(t) => filetype(t),
            Err(_) => FileType::RegularFile,
        };
        out.push((entry.file_name(), kind, entry.ino()));
    }
    Ok(out)
}

/// Branches containing `rel` as a directory, in branch order.
fn holders(branches: &Branches, rel: &Path) -> Result<Vec<usize>, Errno> {
    let mut out = Vec::new();
    let mut not_dir = false;
    for (idx, branch) in branches.iter().enumerate() {
        if !branch.enabled {
            continue;
        }
        match sys::lstat(&branch.full_path(rel)) {
            Ok(meta) if meta.is_dir() => out.push(idx),
            Ok(_) => not_dir = true,
            Err(_) => {}
        }
    }
    if out.is_empty() {
        return Err(if not_dir { Errno::ENOTDIR } else { Errno::ENOENT });
    }
    Ok(out)
}

/// The deduplicated union of `rel`'s listings across all branches that
/// hold it.
pub fn readdir_union(
    branches: &Branches,
    rel: &Path,
    mode: ReaddirMode,
    threads: usize,
) -> Result<Vec<DirEntryOut>, Errno> {
    let holder_idxs = holders(branches, rel)?;

    let per_branch: Vec<Result<Vec<(OsString, FileType, u64)>, Errno>> = match mode {
        ReaddirMode::Seq => holder_idxs
            .iter()
            .map(|&idx| read_branch(&branches.list[idx].full_path(rel)))
            .collect(),
        ReaddirMode::Cor => read_concurrent(branches, rel, &holder_idxs, threads),
    };

    let mut seen: HashSet<OsString> = HashSet::new();
    let mut out = Vec::new();
    let mut first_err = None;
    let mut any_ok = false;
    for (slot, result) in holder_idxs.iter().zip(per_branch) {
        match result {
            Ok(entries) => {
                any_ok = true;
                let dev = branches.list[*slot].dev;
                for (name, kind, ino) in entries {
                    if seen.insert(name.clone()) {
                        out.push(DirEntryOut {
                            name,
                            branch: *slot,
                            dev,
                            ino,
                            kind,
                        });
                    }
                }
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    if !any_ok {
        return Err(first_err.unwrap_or(Errno::ENOENT));
    }
    Ok(out)
}

/// Fan branches out over a bounded worker pool; buffers land in their
/// branch-ordered slots so the merge stays deterministic.
fn read_concurrent(
    branches: &Branches,
    rel: &Path,
    holder_idxs: &[usize],
    threads: usize,
) -> Vec<Result<Vec<(OsString, FileType, u64)>, Errno>> {
    let workers = if threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        threads
    }
    .min(holder_idxs.len())
    .max(1);

    let slots: Mutex<Vec<Result<Vec<(OsString, FileType, u64)>, Errno>>> =
        Mutex::new((0..holder_idxs.len()).map(|_| Ok(Vec::new())).collect());
    let cursor = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let slot = cursor.fetch_add(1, Ordering::Relaxed);
                if slot >= holder_idxs.len() {
                    break;
                }
                let idx = holder_idxs[slot];
                let result = read_branch(&branches.list[idx].full_path(rel));
                slots.lock()[slot] = result;
            });
        }
    });

    slots.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Branches) {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(a.join("d")).unwrap();
        std::fs::create_dir_all(b.join("d")).unwrap();
        std::fs::write(a.join("d/one"), b"a").unwrap();
        std::fs::write(a.join("d/both"), b"a").unwrap();
        std::fs::write(b.join("d/both"), b"b").unwrap();
        std::fs::write(b.join("d/two"), b"b").unwrap();
        let branches = Branches::parse(&format!("{}:{}", a.display(), b.display())).unwrap();
        (dir, branches)
    }

    fn names(entries: &[DirEntryOut]) -> Vec<String> {
        let mut names: Vec<String> = entries
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn union_dedups_by_name() {
        let (_dir, branches) = fixture();
        for mode in [ReaddirMode::Seq, ReaddirMode::Cor] {
            let entries = readdir_union(&branches, Path::new("d"), mode, 2).unwrap();
            assert_eq!(names(&entries), vec!["both", "one", "two"], "{mode:?}");
            // first occurrence wins: "both" must come from branch 0
            let both = entries.iter().find(|e| e.name == "both").unwrap();
            assert_eq!(both.branch, 0);
        }
    }

    #[test]
    fn union_of_partial_holders() {
        let (_dir, branches) = fixture();
        // only branch 1 has this directory
        let sub = branches.list[1].full_path(Path::new("d/only2"));
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("x"), b"").unwrap();
        let entries =
            readdir_union(&branches, Path::new("d/only2"), ReaddirMode::Seq, 1).unwrap();
        assert_eq!(names(&entries), vec!["x"]);
        assert_eq!(entries[0].branch, 1);
    }

    #[test]
    fn missing_everywhere_is_enoent() {
        let (_dir, branches) = fixture();
        assert_eq!(
            readdir_union(&branches, Path::new("ghost"), ReaddirMode::Seq, 1)
                .err()
                .unwrap(),
            Errno::ENOENT
        );
    }

    #[test]
    fn file_in_the_way_is_enotdir() {
        let (_dir, branches) = fixture();
        assert_eq!(
            readdir_union(&branches, Path::new("d/one"), ReaddirMode::Seq, 1)
                .err()
                .unwrap(),
            Errno::ENOTDIR
        );
    }

    #[test]
    fn concurrent_matches_sequential() {
        let (_dir, branches) = fixture();
        let seq = readdir_union(&branches, Path::new("d"), ReaddirMode::Seq, 1).unwrap();
        let cor = readdir_union(&branches, Path::new("d"), ReaddirMode::Cor, 8).unwrap();
        assert_eq!(names(&seq), names(&cor));
    }
}
