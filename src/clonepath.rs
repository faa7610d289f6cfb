//! Path cloning: reproduce an ancestor chain on a target branch.
//!
//! Non-path-preserving create policies may pick a branch where the
//! parent directory does not exist yet. Before the create syscall the
//! missing ancestors are rebuilt there, copying mode, ownership, times
//! and xattrs from whichever branch the search policy finds them on.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;

use nix::errno::Errno;

use crate::policy;
use crate::policy::Policy;
use crate::policy::PolicyCtx;
use crate::sys;

/// Clone one directory, attributes included. EEXIST is success: another
/// worker may have cloned it between our probe and the mkdir.
fn clone_dir(src: &Path, dst: &Path) -> Result<(), Errno> {
    let meta = sys::lstat(src)?;
    if !meta.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    match sys::mkdir(dst, meta.mode() & 0o7777) {
        Ok(()) => {
            // mkdir is subject to the umask; restate the exact mode
            sys::chmod(dst, meta.mode() & 0o7777)?;
        }
        Err(Errno::EEXIST) => {}
        Err(e) => return Err(e),
    }
    // ownership may fail when unprivileged; times and xattrs are
    // best-effort the same way
    let _ = sys::lchown(dst, Some(meta.uid()), Some(meta.gid()));
    if let Ok(xattrs) = sys::lxattrs(src) {
        for (name, value) in xattrs {
            let _ = sys::lsetxattr(dst, &name, &value, 0);
        }
    }
    let _ = sys::lutimens(
        dst,
        libc::timespec {
            tv_sec: meta.atime() as libc::time_t,
            tv_nsec: meta.atime_nsec() as libc::c_long,
        },
        libc::timespec {
            tv_sec: meta.mtime() as libc::time_t,
            tv_nsec: meta.mtime_nsec() as libc::c_long,
        },
    );
    Ok(())
}

/// Ensure every ancestor of `rel` (itself excluded) exists on the branch
/// at `dst_idx`, cloning missing ones from wherever `search` finds them.
pub fn clonepath(
    ctx: &PolicyCtx<'_>,
    search: Policy,
    dst_idx: usize,
    rel: &Path,
) -> Result<(), Errno> {
    let parent = match rel.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => return Ok(()),
    };
    let dst_branch = &ctx.branches.list[dst_idx];

    let mut ancestor = PathBuf::new();
    for component in parent.components() {
        ancestor.push(component);
        let dst = dst_branch.full_path(&ancestor);
        if sys::lstat(&dst).is_ok() {
            continue;
        }
        let src_idx = policy::search(ctx, search, &ancestor)?;
        let src = ctx.branches.list[src_idx].full_path(&ancestor);
        clone_dir(&src, &dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Branches;
    use crate::statcache::StatvfsCache;

    struct Fixture {
        _dir: tempfile::TempDir,
        branches: Branches,
        cache: StatvfsCache,
    }

    impl Fixture {
        fn new() -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            let a = dir.path().join("a");
            let b = dir.path().join("b");
            std::fs::create_dir(&a).unwrap();
            std::fs::create_dir(&b).unwrap();
            let branches =
                Branches::parse(&format!("{}:{}", a.display(), b.display())).unwrap();
            Fixture {
                _dir: dir,
                branches,
                cache: StatvfsCache::new(0),
            }
        }

        fn ctx(&self) -> PolicyCtx<'_> {
            PolicyCtx {
                branches: &self.branches,
                cache: &self.cache,
                minfreespace: 0,
            }
        }
    }

    #[test]
    fn clones_missing_ancestors_with_modes() {
        let fx = Fixture::new();
        let src_p = fx.branches.list[0].full_path(Path::new("p"));
        let src_q = fx.branches.list[0].full_path(Path::new("p/q"));
        std::fs::create_dir(&src_p).unwrap();
        std::fs::create_dir(&src_q).unwrap();
        sys::chmod(&src_p, 0o750).unwrap();
        sys::chmod(&src_q, 0o700).unwrap();

        clonepath(&fx.ctx(), Policy::Ff, 1, Path::new("p/q/r")).unwrap();

        let dst_p = fx.branches.list[1].full_path(Path::new("p"));
        let dst_q = fx.branches.list[1].full_path(Path::new("p/q"));
        assert_eq!(sys::lstat(&dst_p).unwrap().mode() & 0o7777, 0o750);
        assert_eq!(sys::lstat(&dst_q).unwrap().mode() & 0o7777, 0o700);
        // the leaf itself is not created
        assert!(sys::lstat(&fx.branches.list[1].full_path(Path::new("p/q/r"))).is_err());
    }

    #[test]
    fn missing_ancestor_everywhere_is_enoent() {
        let fx = Fixture::new();
        assert_eq!(
            clonepath(&fx.ctx(), Policy::Ff, 1, Path::new("ghost/child")),
            Err(Errno::ENOENT)
        );
    }

    #[test]
    fn existing_ancestors_are_left_alone() {
        let fx = Fixture::new();
        let dst_p = fx.branches.list[1].full_path(Path::new("p"));
        std::fs::create_dir(&dst_p).unwrap();
        sys::chmod(&dst_p, 0o711).unwrap();
        // source side has a different mode; must not be re-applied
        std::fs::create_dir(fx.branches.list[0].full_path(Path::new("p"))).unwrap();

        clonepath(&fx.ctx(), Policy::Ff, 1, Path::new("p/new")).unwrap();
        assert_eq!(sys::lstat(&dst_p).unwrap().mode() & 0o7777, 0o711);
    }

    #[test]
    fn direct_child_of_root_needs_no_cloning() {
        let fx = Fixture::new();
        clonepath(&fx.ctx(), Policy::Ff, 1, Path::new("top")).unwrap();
    }
}
