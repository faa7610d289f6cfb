//! Move-on-ENOSPC: migrate an open file to a branch with room.
//!
//! Invoked when a write fails with ENOSPC or EDQUOT. The client's file
//! descriptor never changes; only the backing descriptor inside the
//! handle is swapped once the copy has landed. Any failure leaves the
//! file where it was and the caller reports the original error.

use std::ffi::OsString;
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;

use crate::clonepath::clonepath;
use crate::copydata::copyattrs;
use crate::copydata::copydata;
use crate::policy;
use crate::policy::PolicyCtx;
use crate::pool::OpenHandle;
use crate::pool::Pool;
use crate::sys;

/// At most one attempt per write call; concurrent attempts on the same
/// handle see EBUSY and fall back to the original error.
pub fn move_file(pool: &Pool, handle: &mut OpenHandle) -> Result<(), Errno> {
    if handle.spilling {
        return Err(Errno::EBUSY);
    }
    handle.spilling = true;
    let result = move_file_inner(pool, handle);
    handle.spilling = false;
    result
}

fn move_file_inner(pool: &Pool, handle: &mut OpenHandle) -> Result<(), Errno> {
    let (policy, search, minfree) = {
        let config = pool.config.read();
        let policy = config.moveonenospc.ok_or(Errno::ENOSPC)?;
        (policy, config.funcs.getattr, config.minfreespace)
    };
    let branches = pool.branches.snapshot();
    let ctx = PolicyCtx {
        branches: &branches,
        cache: &pool.statcache,
        minfreespace: minfree,
    };
    let exclude: Vec<usize> = branches
        .iter()
        .enumerate()
        .filter(|(_, b)| b.path == handle.branch_path)
        .map(|(idx, _)| idx)
        .collect();

    let dst_idx = policy::create(&ctx, policy, &handle.rel, &exclude)?;
    clonepath(&ctx, search, dst_idx, &handle.rel)?;

    let dst_branch = &branches.list[dst_idx];
    let src_full = handle.full_path();
    let dst_full = dst_branch.full_path(&handle.rel);

    let name = handle.rel.file_name().ok_or(Errno::EINVAL)?;
    let mut tmp_name = OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(format!(
        ".poolfs.{}.{}",
        std::process::id(),
        handle.file.as_raw_fd()
    ));
    let tmp_full = dst_full.parent().ok_or(Errno::EINVAL)?.join(&tmp_name);

    // the handle may be write-only; read the source by path
    let src_read = sys::open(&src_full, libc::O_RDONLY, 0)?;
    let len = src_read
        .metadata()
        .map_err(|e| sys::errno_from_io(&e))?
        .len();
    let tmp = sys::open(
        &tmp_full,
        libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY,
        0o600,
    )?;

    if let Err(e) = copydata(&src_read, &tmp, len).and_then(|()| copyattrs(&src_full, &tmp_full)) {
        let _ = std::fs::remove_file(&tmp_full);
        return Err(e);
    }
    drop(tmp);

    if let Err(e) = std::fs::rename(&tmp_full, &dst_full) {
        let _ = std::fs::remove_file(&tmp_full);
        return Err(sys::errno_from_io(&e));
    }

    let reopen_flags = handle.flags & !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);
    let new_file = match sys::open(&dst_full, reopen_flags, 0) {
        Ok(file) => file,
        Err(e) => {
            let _ = std::fs::remove_file(&dst_full);
            return Err(e);
        }
    };

    let _ = std::fs::remove_file(&src_full);
    handle.file = new_file;
    handle.branch_path = dst_branch.path.clone();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Branches;
    use crate::config::Config;
    use crate::policy::Policy;
    use std::os::unix::fs::FileExt;
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;
    use std::path::PathBuf;

    fn pool_with_two_branches() -> (tempfile::TempDir, Pool, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        let branches = Branches::parse(&format!("{}:{}", a.display(), b.display())).unwrap();
        let mut config = Config::default();
        config.minfreespace = 0;
        config.moveonenospc = Some(Policy::Ff);
        let pool = Pool::new(config, branches);
        let a = dir.path().join("a").canonicalize().unwrap();
        let b = dir.path().join("b").canonicalize().unwrap();
        (dir, pool, a, b)
    }

    fn open_handle(branch: &Path, rel: &str, contents: &[u8]) -> OpenHandle {
        let full = branch.join(rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, contents).unwrap();
        let file = sys::open(&full, libc::O_WRONLY, 0).unwrap();
        OpenHandle {
            file,
            branch_path: branch.to_path_buf(),
            rel: PathBuf::from(rel),
            flags: libc::O_WRONLY,
            writable: true,
            spilling: false,
        }
    }

    #[test]
    fn moves_file_and_swaps_descriptor() {
        let (_dir, pool, a, b) = pool_with_two_branches();
        let mut handle = open_handle(&a, "f", b"payload");

        move_file(&pool, &mut handle).unwrap();

        assert!(!a.join("f").exists());
        assert_eq!(std::fs::read(b.join("f")).unwrap(), b"payload");
        assert_eq!(handle.branch_path, b);
        // size unchanged through the client-visible handle
        assert_eq!(handle.file.metadata().unwrap().len(), 7);
        // the swapped descriptor accepts the retried write
        handle.file.write_all_at(b"PAY", 0).unwrap();
        assert_eq!(std::fs::read(b.join("f")).unwrap(), b"PAYload");
    }

    #[test]
    fn clones_parents_and_keeps_attrs() {
        let (_dir, pool, a, b) = pool_with_two_branches();
        let mut handle = open_handle(&a, "d/f", b"x");
        sys::chmod(&a.join("d"), 0o700).unwrap();
        sys::chmod(&a.join("d/f"), 0o604).unwrap();

        move_file(&pool, &mut handle).unwrap();

        assert_eq!(sys::lstat(&b.join("d")).unwrap().mode() & 0o7777, 0o700);
        assert_eq!(sys::lstat(&b.join("d/f")).unwrap().mode() & 0o7777, 0o604);
        assert!(!a.join("d/f").exists());
    }

    #[test]
    fn disabled_feature_reports_enospc() {
        let (_dir, pool, a, _b) = pool_with_two_branches();
        pool.config.write().moveonenospc = None;
        let mut handle = open_handle(&a, "f", b"x");
        assert_eq!(move_file(&pool, &mut handle), Err(Errno::ENOSPC));
        assert!(a.join("f").exists());
    }

    #[test]
    fn no_other_branch_means_failure() {
        let (_dir, pool, a, b) = pool_with_two_branches();
        pool.branches.remove_path(&b).unwrap();
        let mut handle = open_handle(&a, "f", b"x");
        assert!(move_file(&pool, &mut handle).is_err());
        assert!(a.join("f").exists());
    }
}
