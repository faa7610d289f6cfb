//! The union core: path-based operation handlers.
//!
//! Every handler takes mount-relative paths, consults the policy engine
//! against a branch snapshot, and performs the backing syscalls. Nothing
//! here knows about FUSE; the dispatcher in `fuse` translates nodeids
//! and replies. That split keeps the union semantics testable against
//! plain temp directories.

use std::ffi::OsStr;
use std::ffi::OsString;
use std::fs::File;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;

use nix::errno::Errno;
use parking_lot::RwLock;

use crate::branch::BranchRegistry;
use crate::branch::Branches;
use crate::clonepath::clonepath;
use crate::config::Config;
use crate::config::FollowSymlinks;
use crate::config::LinkExdev;
use crate::config::NfsOpenHack;
use crate::config::RenameExdev;
use crate::config::StatfsIgnore;
use crate::config::StatfsMode;
use crate::config::XattrMode;
use crate::policy;
use crate::policy::Policy;
use crate::policy::PolicyCtx;
use crate::readdir;
use crate::readdir::DirEntryOut;
use crate::statcache::StatFs;
use crate::statcache::StatvfsCache;
use crate::sys;

/// Shadow directory used by the rename-exdev workaround.
pub const RENAME_EXDEV_DIR: &str = ".poolfs_rename_exdev";

/// State of one open file.
pub struct OpenHandle {
    pub file: File,
    /// Branch root the backing file lives under; a path, not an index,
    /// so branch-list mutation cannot misdirect the handle.
    pub branch_path: PathBuf,
    pub rel: PathBuf,
    pub flags: i32,
    pub writable: bool,
    /// Guards against re-entering the spill path.
    pub spilling: bool,
}

impl OpenHandle {
    pub fn full_path(&self) -> PathBuf {
        self.branch_path.join(&self.rel)
    }
}

pub struct Pool {
    pub config: RwLock<Config>,
    pub branches: BranchRegistry,
    pub statcache: StatvfsCache,
}

impl Pool {
    pub fn new(config: Config, branches: Branches) -> Pool {
        let statcache = StatvfsCache::new(config.cache_statfs);
        Pool {
            config: RwLock::new(config),
            branches: BranchRegistry::new(branches),
            statcache,
        }
    }

    pub(crate) fn with_ctx<T>(
        &self,
        f: impl FnOnce(&Config, &PolicyCtx<'_>) -> Result<T, Errno>,
    ) -> Result<T, Errno> {
        let config = self.config.read();
        let branches = self.branches.snapshot();
        let ctx = PolicyCtx {
            branches: &branches,
            cache: &self.statcache,
            minfreespace: config.minfreespace,
        };
        f(&config, &ctx)
    }

    // ---- search-category operations -------------------------------------

    /// Locate `rel` and stat it. Returns the metadata, the branch index
    /// in the snapshot used, and the backing path.
    pub fn getattr(&self, rel: &Path) -> Result<(Metadata, PathBuf), Errno> {
        self.with_ctx(|config, ctx| {
            let idx = policy::search(ctx, config.funcs.getattr, rel)?;
            let full = ctx.branches.list[idx].full_path(rel);
            let mut meta = sys::lstat(&full)?;
            if meta.is_symlink() && config.follow_symlinks != FollowSymlinks::Never {
                if let Ok(target) = sys::stat(&full) {
                    let follow = match config.follow_symlinks {
                        FollowSymlinks::Never => false,
                        FollowSymlinks::Directory => target.is_dir(),
                        FollowSymlinks::Regular => target.is_file(),
                        FollowSymlinks::All => true,
                    };
                    if follow {
                        meta = target;
                    }
                }
            }
            Ok((meta, full))
        })
    }

    pub fn access(&self, rel: &Path, mask: i32) -> Result<(), Errno> {
        self.with_ctx(|config, ctx| {
            let idx = policy::search(ctx, config.funcs.access, rel)?;
            sys::eaccess(&ctx.branches.list[idx].full_path(rel), mask)
        })
    }

    pub fn readlink(&self, rel: &Path) -> Result<OsString, Errno> {
        self.with_ctx(|config, ctx| {
            let idx = policy::search(ctx, config.funcs.readlink, rel)?;
            let full = ctx.branches.list[idx].full_path(rel);
            let meta = sys::lstat(&full)?;
            if meta.is_file() {
                if config.symlinkify && symlinkify_stale(&meta, config.symlinkify_timeout) {
                    return Ok(full.into_os_string());
                }
                return Err(Errno::EINVAL);
            }
            std::fs::read_link(&full)
                .map(PathBuf::into_os_string)
                .map_err(|e| sys::errno_from_io(&e))
        })
    }

    pub fn getxattr(&self, rel: &Path, name: &OsStr) -> Result<Vec<u8>, Errno> {
        self.with_ctx(|config, ctx| {
            match config.xattr {
                XattrMode::Passthrough => {}
                XattrMode::NoSys => return Err(Errno::ENOSYS),
                XattrMode::NoAttr => return Err(Errno::ENODATA),
            }
            let idx = policy::search(ctx, config.funcs.getxattr, rel)?;
            let full = ctx.branches.list[idx].full_path(rel);
            // size probe then fetch; retry once if the value grew between
            let mut size = sys::lgetxattr(&full, name, &mut [])?;
            loop {
                let mut buf = vec![0u8; size.max(1)];
                match sys::lgetxattr(&full, name, &mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        return Ok(buf);
                    }
                    Err(Errno::ERANGE) => {
                        size = sys::lgetxattr(&full, name, &mut [])?;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    pub fn listxattr(&self, rel: &Path) -> Result<Vec<u8>, Errno> {
        self.with_ctx(|config, ctx| {
            match config.xattr {
                XattrMode::Passthrough => {}
                XattrMode::NoSys => return Err(Errno::ENOSYS),
                XattrMode::NoAttr => return Ok(Vec::new()),
            }
            let idx = policy::search(ctx, config.funcs.listxattr, rel)?;
            let full = ctx.branches.list[idx].full_path(rel);
            let mut size = sys::llistxattr(&full, &mut [])?;
            loop {
                let mut buf = vec![0u8; size.max(1)];
                match sys::llistxattr(&full, &mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        return Ok(buf);
                    }
                    Err(Errno::ERANGE) => {
                        size = sys::llistxattr(&full, &mut [])?;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    /// Open an existing file. The nfsopenhack turns qualifying ENOENTs
    /// on write-opens into creates (NFS clients drop O_CREAT).
    pub fn open(&self, rel: &Path, flags: i32) -> Result<OpenHandle, Errno> {
        let result = self.with_ctx(|config, ctx| {
            let idx = policy::search(ctx, config.funcs.open, rel)?;
            let branch = &ctx.branches.list[idx];
            let full = branch.full_path(rel);
            let file = sys::open(&full, flags & !libc::O_CREAT, 0)?;
            Ok(OpenHandle {
                file,
                branch_path: branch.path.clone(),
                rel: rel.to_path_buf(),
                flags,
                writable: (flags & libc::O_ACCMODE) != libc::O_RDONLY,
                spilling: false,
            })
        });
        match result {
            Err(Errno::ENOENT) if self.nfsopenhack_applies(rel, flags) => {
                self.create(rel, 0o600, flags)
            }
            other => other,
        }
    }

    fn nfsopenhack_applies(&self, rel: &Path, flags: i32) -> bool {
        if (flags & libc::O_ACCMODE) == libc::O_RDONLY {
            return false;
        }
        match self.config.read().nfsopenhack {
            NfsOpenHack::Off => false,
            NfsOpenHack::All => true,
            NfsOpenHack::Git => rel
                .components()
                .any(|c| c.as_os_str() == OsStr::new(".git")),
        }
    }

    // ---- create-category operations -------------------------------------

    /// Run the create policy, clone ancestors when the policy is not
    /// path-preserving, apply `op`, and retry once on ENOSPC/EDQUOT with
    /// the failing branch excluded.
    fn create_on<T>(
        &self,
        policy_for: impl Fn(&Config) -> Policy,
        rel: &Path,
        op: impl Fn(&Path) -> Result<T, Errno>,
    ) -> Result<(T, PathBuf, PathBuf), Errno> {
        self.with_ctx(|config, ctx| {
            let policy = policy_for(config);
            let mut excluded: Vec<usize> = Vec::new();
            loop {
                let idx = policy::create(ctx, policy, rel, &excluded)?;
                if !policy.path_preserving() {
                    clonepath(ctx, config.funcs.getattr, idx, rel)?;
                }
                let branch = &ctx.branches.list[idx];
                let full = branch.full_path(rel);
                match op(&full) {
                    Ok(v) => return Ok((v, full, branch.path.clone())),
                    Err(e @ (Errno::ENOSPC | Errno::EDQUOT)) => {
                        if !excluded.is_empty() {
                            return Err(e);
                        }
                        excluded.push(idx);
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    pub fn create(&self, rel: &Path, mode: u32, flags: i32) -> Result<OpenHandle, Errno> {
        let (file, _full, branch_path) = self.create_on(
            |c| c.funcs.create,
            rel,
            |full| sys::open(full, flags | libc::O_CREAT, mode),
        )?;
        Ok(OpenHandle {
            file,
            branch_path,
            rel: rel.to_path_buf(),
            flags,
            writable: true,
            spilling: false,
        })
    }

    pub fn mkdir(&self, rel: &Path, mode: u32) -> Result<PathBuf, Errno> {
        self.create_on(|c| c.funcs.mkdir, rel, |full| sys::mkdir(full, mode))
            .map(|((), full, _)| full)
    }

    pub fn mknod(&self, rel: &Path, mode: u32, rdev: u64) -> Result<PathBuf, Errno> {
        self.create_on(|c| c.funcs.mknod, rel, |full| sys::mknod(full, mode, rdev))
            .map(|((), full, _)| full)
    }

    pub fn symlink(&self, target: &Path, rel: &Path) -> Result<PathBuf, Errno> {
        self.create_on(
            |c| c.funcs.symlink,
            rel,
            |full| std::os::unix::fs::symlink(target, full).map_err(|e| sys::errno_from_io(&e)),
        )
        .map(|((), full, _)| full)
    }

    // ---- action-category operations -------------------------------------

    /// Apply `op` on every branch the action policy returns. ENOENT on
    /// a branch is expected in a union: the call succeeds if anything
    /// succeeded and every failure was ENOENT.
    fn action_on(
        &self,
        policy_for: impl Fn(&Config) -> Policy,
        rel: &Path,
        op: impl Fn(&Path) -> Result<(), Errno>,
    ) -> Result<(), Errno> {
        self.with_ctx(|config, ctx| {
            let idxs = policy::action(ctx, policy_for(config), rel)?;
            let mut first_err = None;
            let mut any_success = false;
            let mut non_enoent = false;
            for idx in idxs {
                match op(&ctx.branches.list[idx].full_path(rel)) {
                    Ok(()) => any_success = true,
                    Err(e) => {
                        if e != Errno::ENOENT {
                            non_enoent = true;
                        }
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
            match first_err {
                None => Ok(()),
                Some(_) if any_success && !non_enoent => Ok(()),
                Some(e) => Err(e),
            }
        })
    }

    pub fn unlink(&self, rel: &Path) -> Result<(), Errno> {
        self.action_on(
            |c| c.funcs.unlink,
            rel,
            |full| std::fs::remove_file(full).map_err(|e| sys::errno_from_io(&e)),
        )
    }

    pub fn rmdir(&self, rel: &Path) -> Result<(), Errno> {
        self.action_on(
            |c| c.funcs.rmdir,
            rel,
            |full| std::fs::remove_dir(full).map_err(|e| sys::errno_from_io(&e)),
        )
    }

    pub fn chmod(&self, rel: &Path, mode: u32) -> Result<(), Errno> {
        self.action_on(|c| c.funcs.chmod, rel, |full| sys::chmod(full, mode))
    }

    pub fn chown(&self, rel: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), Errno> {
        self.action_on(|c| c.funcs.chown, rel, |full| sys::lchown(full, uid, gid))
    }

    pub fn truncate(&self, rel: &Path, size: u64) -> Result<(), Errno> {
        self.action_on(|c| c.funcs.truncate, rel, |full| sys::truncate(full, size))
    }

    pub fn utimens(
        &self,
        rel: &Path,
        atime: libc::timespec,
        mtime: libc::timespec,
    ) -> Result<(), Errno> {
        self.action_on(|c| c.funcs.utimens, rel, |full| {
            sys::lutimens(full, atime, mtime)
        })
    }

    pub fn setxattr(
        &self,
        rel: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), Errno> {
        match self.config.read().xattr {
            XattrMode::Passthrough => {}
            XattrMode::NoSys => return Err(Errno::ENOSYS),
            XattrMode::NoAttr => return Err(Errno::ENODATA),
        }
        self.action_on(|c| c.funcs.setxattr, rel, |full| {
            sys::lsetxattr(full, name, value, flags)
        })
    }

    pub fn removexattr(&self, rel: &Path, name: &OsStr) -> Result<(), Errno> {
        match self.config.read().xattr {
            XattrMode::Passthrough => {}
            XattrMode::NoSys => return Err(Errno::ENOSYS),
            XattrMode::NoAttr => return Err(Errno::ENODATA),
        }
        self.action_on(|c| c.funcs.removexattr, rel, |full| {
            sys::lremovexattr(full, name)
        })
    }

    // ---- rename / link ---------------------------------------------------

    fn holders(branches: &Branches, rel: &Path) -> Vec<usize> {
        branches
            .iter()
            .enumerate()
            .filter(|(_, b)| b.enabled && sys::lstat(&b.full_path(rel)).is_ok())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Logical rename. The create policy names the branch where `dst`
    /// belongs; if that branch holds `src` the rename is a plain
    /// rename(2) there and stale copies elsewhere are removed. When no
    /// direct rename is possible the `rename-exdev` setting decides
    /// between EXDEV and the shadow-dir symlink workaround.
    pub fn rename(&self, src: &Path, dst: &Path) -> Result<(), Errno> {
        self.with_ctx(|config, ctx| {
            let holders = Self::holders(ctx.branches, src);
            if holders.is_empty() {
                return Err(Errno::ENOENT);
            }
            let target = policy::create(ctx, config.funcs.create, dst, &[])?;
            if !holders.contains(&target) {
                return match config.rename_exdev {
                    RenameExdev::Passthrough => Err(Errno::EXDEV),
                    RenameExdev::RelSymlink | RenameExdev::AbsSymlink => {
                        self.rename_exdev_workaround(config, ctx, &holders, src, dst)
                    }
                };
            }

            let branch = &ctx.branches.list[target];
            std::fs::rename(branch.full_path(src), branch.full_path(dst))
                .map_err(|e| sys::errno_from_io(&e))?;

            // the rename succeeded. Directories are a union of all
            // their holders, so each copy is renamed in place; stale
            // file copies are simply removed.
            for idx in holders {
                if idx == target {
                    continue;
                }
                let other = &ctx.branches.list[idx];
                let stale = other.full_path(src);
                match sys::lstat(&stale) {
                    Ok(meta) if meta.is_dir() => {
                        let to = other.full_path(dst);
                        if std::fs::rename(&stale, &to).is_err() {
                            let _ = clonepath(ctx, config.funcs.getattr, idx, dst);
                            let _ = std::fs::rename(&stale, &to);
                        }
                    }
                    Ok(_) => {
                        let _ = std::fs::remove_file(&stale);
                    }
                    Err(_) => {}
                }
            }
            Ok(())
        })
    }

    /// Move `src` into the shadow directory on its own branch and leave
    /// a symlink at `dst`. Keeps the data on-branch while giving the
    /// namespace the rename it asked for.
    fn rename_exdev_workaround(
        &self,
        config: &Config,
        ctx: &PolicyCtx<'_>,
        holders: &[usize],
        src: &Path,
        dst: &Path,
    ) -> Result<(), Errno> {
        let shadow_rel = Path::new(RENAME_EXDEV_DIR).join(dst);
        let idx = holders[0];
        let branch = &ctx.branches.list[idx];
        let src_full = branch.full_path(src);
        let shadow_full = branch.full_path(&shadow_rel);

        if let Some(parent) = shadow_full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| sys::errno_from_io(&e))?;
        }
        std::fs::rename(&src_full, &shadow_full).map_err(|e| sys::errno_from_io(&e))?;

        let target = match config.rename_exdev {
            RenameExdev::AbsSymlink => config.mountpoint.join(&shadow_rel),
            _ => relative_target(dst, &shadow_rel),
        };
        clonepath(ctx, config.funcs.getattr, idx, dst)?;
        let dst_full = branch.full_path(dst);
        if let Err(e) = std::os::unix::fs::symlink(&target, &dst_full) {
            // put the file back; the namespace must not lose it
            let _ = std::fs::rename(&shadow_full, &src_full);
            return Err(sys::errno_from_io(&e));
        }

        for &other in &holders[1..] {
            let stale = ctx.branches.list[other].full_path(src);
            if std::fs::remove_file(&stale).is_err() {
                let _ = std::fs::remove_dir_all(&stale);
            }
        }
        Ok(())
    }

    /// Hard link `src` to `dst` on every branch holding `src`. A branch
    /// whose `dst` parent is missing gets the parent cloned first unless
    /// the policy is path-preserving, which turns it into EXDEV and the
    /// `link-exdev` fallback.
    pub fn link(&self, src: &Path, dst: &Path) -> Result<(Metadata, PathBuf), Errno> {
        self.with_ctx(|config, ctx| {
            let idxs = policy::action(ctx, config.funcs.link, src)?;
            let policy = config.funcs.link;
            let mut errs: Vec<Errno> = Vec::new();
            let mut linked: Option<PathBuf> = None;
            let mut exdev = false;

            for idx in idxs {
                let branch = &ctx.branches.list[idx];
                let dst_full = branch.full_path(dst);
                let parent_ok = dst_full
                    .parent()
                    .map(|p| sys::lstat(p).is_ok())
                    .unwrap_or(true);
                if !parent_ok {
                    if policy.path_preserving() {
                        exdev = true;
                        errs.push(Errno::EXDEV);
                        continue;
                    }
                    if let Err(e) = clonepath(ctx, config.funcs.getattr, idx, dst) {
                        errs.push(e);
                        continue;
                    }
                }
                match std::fs::hard_link(branch.full_path(src), &dst_full) {
                    Ok(()) => linked = Some(dst_full),
                    Err(e) => errs.push(sys::errno_from_io(&e)),
                }
            }

            if let Some(full) = linked {
                if let Some(err) = errs.iter().find(|e| **e != Errno::ENOENT) {
                    return Err(*err);
                }
                let meta = sys::lstat(&full)?;
                return Ok((meta, full));
            }
            if exdev
                && errs
                    .iter()
                    .all(|e| matches!(e, Errno::EXDEV | Errno::ENOENT))
            {
                return self.link_exdev_fallback(config, ctx, src, dst);
            }
            Err(errs.first().copied().unwrap_or(Errno::ENOENT))
        })
    }

    fn link_exdev_fallback(
        &self,
        config: &Config,
        ctx: &PolicyCtx<'_>,
        src: &Path,
        dst: &Path,
    ) -> Result<(Metadata, PathBuf), Errno> {
        let holders = Self::holders(ctx.branches, src);
        let idx = *holders.first().ok_or(Errno::ENOENT)?;
        let branch = &ctx.branches.list[idx];
        let target = match config.link_exdev {
            LinkExdev::Passthrough => return Err(Errno::EXDEV),
            LinkExdev::RelSymlink => relative_target(dst, src),
            LinkExdev::AbsBaseSymlink => config.mountpoint.join(src),
            LinkExdev::AbsPoolSymlink => branch.full_path(src),
        };
        clonepath(ctx, config.funcs.getattr, idx, dst)?;
        let dst_full = branch.full_path(dst);
        std::os::unix::fs::symlink(&target, &dst_full).map_err(|e| sys::errno_from_io(&e))?;
        let meta = sys::lstat(&dst_full)?;
        Ok((meta, dst_full))
    }

    // ---- statfs / readdir ------------------------------------------------

    /// Aggregate statvfs across branches, one contribution per unique
    /// backing device, block counts normalized to the smallest fragment
    /// size. `statfs-ignore` zeroes the free counts of RO/NC branches.
    pub fn statfs(&self, rel: &Path) -> Result<StatFs, Errno> {
        let config = self.config.read();
        let branches = self.branches.snapshot();

        let mut picked: Vec<(StatFs, bool)> = Vec::new();
        let mut seen_devs = std::collections::HashSet::new();
        let mut first_err = None;
        for branch in branches.iter().filter(|b| b.enabled) {
            let path = match config.statfs {
                StatfsMode::Base => branch.path.clone(),
                StatfsMode::Full => {
                    let full = branch.full_path(rel);
                    if sys::lstat(&full).is_err() {
                        continue;
                    }
                    full
                }
            };
            let st = match self.statcache.statfs(&path) {
                Ok(st) => st,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    continue;
                }
            };
            if !seen_devs.insert(branch.dev) {
                continue;
            }
            let ignore_free = match config.statfs_ignore {
                StatfsIgnore::None => false,
                StatfsIgnore::Ro => branch.ro() || st.readonly,
                StatfsIgnore::Nc => branch.ro_or_nc() || st.readonly,
            };
            picked.push((st, ignore_free));
        }
        if picked.is_empty() {
            return Err(first_err.unwrap_or(Errno::ENOENT));
        }

        let min_bsize = picked.iter().map(|(st, _)| st.bsize).min().unwrap_or(512);
        let min_frsize = picked.iter().map(|(st, _)| st.frsize).min().unwrap_or(512);
        let namemax = picked
            .iter()
            .map(|(st, _)| st.namemax)
            .min()
            .unwrap_or(255);

        let mut out = StatFs {
            bsize: min_bsize,
            frsize: min_frsize,
            namemax,
            ..StatFs::default()
        };
        for (st, ignore_free) in picked {
            let scale = if min_frsize > 0 && st.frsize > min_frsize {
                st.frsize / min_frsize
            } else {
                1
            };
            out.blocks = out.blocks.saturating_add(st.blocks.saturating_mul(scale));
            out.files = out.files.saturating_add(st.files);
            if !ignore_free {
                out.bfree = out.bfree.saturating_add(st.bfree.saturating_mul(scale));
                out.bavail = out.bavail.saturating_add(st.bavail.saturating_mul(scale));
                out.ffree = out.ffree.saturating_add(st.ffree);
            }
        }
        Ok(out)
    }

    pub fn readdir(&self, rel: &Path) -> Result<Vec<DirEntryOut>, Errno> {
        let (mode, threads) = {
            let config = self.config.read();
            (config.readdir, config.threads)
        };
        let branches = self.branches.snapshot();
        readdir::readdir_union(&branches, rel, mode, threads)
    }

    // ---- runtime options -------------------------------------------------

    pub fn option_get(&self, key: &str) -> Result<String, Errno> {
        if key == "branches" {
            return Ok(self.branches.snapshot().to_spec());
        }
        self.config.read().get(key)
    }

    /// Runtime set. `branches` routes to the registry: a leading `+`
    /// appends a spec, a leading `-` removes a path, anything else
    /// replaces the whole list.
    pub fn option_set(&self, key: &str, value: &str) -> Result<(), Errno> {
        if key == "branches" {
            return if let Some(spec) = value.strip_prefix('+') {
                self.branches.add_spec(spec)
            } else if let Some(path) = value.strip_prefix('-') {
                self.branches.remove_path(Path::new(path))
            } else {
                self.branches.set_from_spec(value)
            };
        }
        let mut config = self.config.write();
        config.set_runtime(key, value)?;
        if key == "cache.statfs" {
            self.statcache.set_timeout(config.cache_statfs);
        }
        Ok(())
    }

    pub fn option_dump(&self) -> String {
        let config = self.config.read();
        let mut out = format!("branches={}\n", self.branches.snapshot().to_spec());
        for key in config.keys() {
            if let Ok(value) = config.get(&key) {
                out.push_str(&key);
                out.push('=');
                out.push_str(&value);
                out.push('\n');
            }
        }
        out
    }
}

/// Is the file old enough to be presented as a symlink?
pub fn symlinkify_stale(meta: &Metadata, timeout: u64) -> bool {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let newest = meta.mtime().max(meta.ctime());
    now.saturating_sub(newest) > timeout as i64
}

/// `../`-prefixed path from `from`'s parent to `to` (both mount-relative).
fn relative_target(from: &Path, to: &Path) -> PathBuf {
    let depth = from.parent().map(|p| p.components().count()).unwrap_or(0);
    let mut target = PathBuf::new();
    for _ in 0..depth {
        target.push("..");
    }
    target.join(to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_targets() {
        assert_eq!(
            relative_target(Path::new("a/b/c"), Path::new("x/y")),
            PathBuf::from("../../x/y")
        );
        assert_eq!(
            relative_target(Path::new("top"), Path::new("other")),
            PathBuf::from("other")
        );
    }

    #[test]
    fn symlinkify_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let meta = sys::lstat(&path).unwrap();
        // freshly written: inside any sane timeout
        assert!(!symlinkify_stale(&meta, 3600));
        // ctime cannot be backdated, so stale-ness keys off the newer of
        // the two stamps; a huge timeout still reports fresh
        assert!(!symlinkify_stale(&meta, u32::MAX as u64));
    }
}
