//! FUSE dispatcher: one method per opcode.
//!
//! Each handler swaps in the caller's credentials, translates the
//! nodeid to a logical path, runs the union core and maps the `Errno`
//! into the reply. All session state (node table, open handles) lives
//! here; the core stays stateless.

#![allow(clippy::too_many_arguments)]

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use fuser::consts::FOPEN_DIRECT_IO;
use fuser::consts::FOPEN_KEEP_CACHE;
use fuser::FileAttr;
use fuser::FileType;
use fuser::Filesystem;
use fuser::KernelConfig;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyDirectoryPlus;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyIoctl;
use fuser::ReplyLseek;
use fuser::ReplyOpen;
use fuser::ReplyStatfs;
use fuser::ReplyWrite;
use fuser::ReplyXattr;
use fuser::Request;
use fuser::TimeOrNow;
use libc::c_int;
use log::debug;
use nix::errno::Errno;

use crate::branch::Branches;
use crate::config::CacheFiles;
use crate::config::Config;
use crate::ctl;
use crate::inode;
use crate::nodes::NodeTable;
use crate::pool::symlinkify_stale;
use crate::pool::OpenHandle;
use crate::pool::Pool;
use crate::readdir::DirEntryOut;
use crate::spill;
use crate::sys;
use crate::ugid;

struct DirHandle {
    rel: PathBuf,
    /// Computed inode of the directory itself, for "." and "..".
    dir_ino: u64,
    /// Snapshot the listing was produced from; keeps entry branch
    /// indexes valid even if the registry mutates mid-stream.
    branches: Arc<Branches>,
    entries: Vec<DirEntryOut>,
}

pub struct PoolFs {
    pool: Arc<Pool>,
    nodes: NodeTable,
    files: HashMap<u64, OpenHandle>,
    dirs: HashMap<u64, DirHandle>,
    next_fh: u64,
}

fn systime(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn timespec(t: Option<TimeOrNow>) -> libc::timespec {
    match t {
        None => sys::TIMESPEC_OMIT,
        Some(TimeOrNow::Now) => sys::TIMESPEC_NOW,
        Some(TimeOrNow::SpecificTime(st)) => {
            let (secs, nsecs) = match st.duration_since(UNIX_EPOCH) {
                Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i64),
                Err(e) => (
                    -(e.duration().as_secs() as i64),
                    e.duration().subsec_nanos() as i64,
                ),
            };
            libc::timespec {
                tv_sec: secs as libc::time_t,
                tv_nsec: nsecs as libc::c_long,
            }
        }
    }
}

fn kind_of(meta: &std::fs::Metadata) -> FileType {
    crate::readdir::filetype(meta.file_type())
}

impl PoolFs {
    pub fn new(pool: Arc<Pool>) -> PoolFs {
        PoolFs {
            pool,
            nodes: NodeTable::new(),
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_fh: 1,
        }
    }

    fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    /// Logical path used for inode hashing: always absolute-looking so
    /// the root hashes as "/".
    fn hash_path(rel: &Path) -> PathBuf {
        Path::new("/").join(rel)
    }

    fn attr_for(&self, config: &Config, rel: &Path, meta: &std::fs::Metadata) -> FileAttr {
        let is_dir = meta.is_dir();
        let ino = inode::calc(
            config.inodecalc,
            &Self::hash_path(rel),
            meta.dev(),
            meta.ino(),
            is_dir,
        );
        FileAttr {
            ino,
            size: meta.size(),
            blocks: meta.blocks(),
            atime: systime(meta.atime(), meta.atime_nsec()),
            mtime: systime(meta.mtime(), meta.mtime_nsec()),
            ctime: systime(meta.ctime(), meta.ctime_nsec()),
            crtime: UNIX_EPOCH,
            kind: kind_of(meta),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            flags: 0,
        }
    }

    /// Stat `rel` and build its reply attr, applying the symlinkify
    /// presentation for old regular files.
    fn path_attr(&self, rel: &Path) -> Result<FileAttr, Errno> {
        let (meta, full) = self.pool.getattr(rel)?;
        let config = self.pool.config.read();
        let mut attr = self.attr_for(&config, rel, &meta);
        if config.symlinkify
            && meta.is_file()
            && symlinkify_stale(&meta, config.symlinkify_timeout)
        {
            attr.kind = FileType::Symlink;
            attr.perm = 0o777;
            attr.size = full.as_os_str().as_bytes().len() as u64;
        }
        Ok(attr)
    }

    fn ttl_entry(&self) -> Duration {
        Duration::from_secs(self.pool.config.read().cache_entry)
    }

    fn ttl_attr(&self) -> Duration {
        Duration::from_secs(self.pool.config.read().cache_attr)
    }

    fn reply_entry(&mut self, rel: &Path, reply: ReplyEntry) {
        match self.path_attr(rel) {
            Ok(attr) => {
                self.nodes.remember(rel);
                reply.entry(&self.ttl_entry(), &attr, 0);
            }
            Err(Errno::ENOENT) => {
                let negative = self.pool.config.read().cache_negative_entry;
                if negative > 0 {
                    let attr = FileAttr {
                        ino: 0,
                        size: 0,
                        blocks: 0,
                        atime: UNIX_EPOCH,
                        mtime: UNIX_EPOCH,
                        ctime: UNIX_EPOCH,
                        crtime: UNIX_EPOCH,
                        kind: FileType::RegularFile,
                        perm: 0,
                        nlink: 0,
                        uid: 0,
                        gid: 0,
                        rdev: 0,
                        blksize: 512,
                        flags: 0,
                    };
                    reply.entry(&Duration::from_secs(negative), &attr, 0);
                } else {
                    reply.error(Errno::ENOENT as c_int);
                }
            }
            Err(e) => reply.error(e as c_int),
        }
    }

    fn open_reply_flags(&self) -> u32 {
        match self.pool.config.read().cache_files {
            CacheFiles::Off => FOPEN_DIRECT_IO,
            CacheFiles::Partial => 0,
            CacheFiles::Full | CacheFiles::AutoFull => FOPEN_KEEP_CACHE,
        }
    }
}

impl Filesystem for PoolFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        if self.pool.config.read().cache_writeback {
            if let Err(unsupported) =
                config.add_capabilities(fuser::consts::FUSE_WRITEBACK_CACHE)
            {
                debug!("writeback cache not offered by kernel: {unsupported:#x}");
            }
        }
        Ok(())
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        self.reply_entry(&rel, reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.nodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        if let Some(handle) = fh.and_then(|fh| self.files.get(&fh)) {
            match handle.file.metadata() {
                Ok(meta) => {
                    let rel = handle.rel.clone();
                    let config = self.pool.config.read();
                    let attr = self.attr_for(&config, &rel, &meta);
                    drop(config);
                    return reply.attr(&self.ttl_attr(), &attr);
                }
                Err(e) => return reply.error(sys::errno_from_io(&e) as c_int),
            }
        }
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.path_attr(&rel) {
            Ok(attr) => reply.attr(&self.ttl_attr(), &attr),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };

        if let Some(mode) = mode {
            if let Err(e) = self.pool.chmod(&rel, mode) {
                return reply.error(e as c_int);
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = self.pool.chown(&rel, uid, gid) {
                return reply.error(e as c_int);
            }
        }
        if let Some(size) = size {
            let result = match fh.and_then(|fh| self.files.get(&fh)) {
                Some(handle) => sys::ftruncate(handle.file.as_raw_fd(), size),
                None => self.pool.truncate(&rel, size),
            };
            if let Err(e) = result {
                return reply.error(e as c_int);
            }
        }
        if atime.is_some() || mtime.is_some() {
            if let Err(e) = self.pool.utimens(&rel, timespec(atime), timespec(mtime)) {
                return reply.error(e as c_int);
            }
        }

        match self.path_attr(&rel) {
            Ok(attr) => reply.attr(&self.ttl_attr(), &attr),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.readlink(&rel) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.mknod(&rel, mode & !umask, rdev as u64) {
            Ok(_) => self.reply_entry(&rel, reply),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.mkdir(&rel, mode & !umask) {
            Ok(_) => self.reply_entry(&rel, reply),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.unlink(&rel) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.rmdir(&rel) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.child_path(parent, link_name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.symlink(target, &rel) {
            Ok(_) => self.reply_entry(&rel, reply),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        if flags != 0 {
            // RENAME_EXCHANGE / NOREPLACE are not supported across branches
            return reply.error(Errno::EINVAL as c_int);
        }
        let (src, dst) = match (
            self.nodes.child_path(parent, name),
            self.nodes.child_path(newparent, newname),
        ) {
            (Ok(src), Ok(dst)) => (src, dst),
            (Err(e), _) | (_, Err(e)) => return reply.error(e as c_int),
        };
        match self.pool.rename(&src, &dst) {
            Ok(()) => {
                self.nodes.rename(&src, &dst);
                reply.ok()
            }
            Err(e) => reply.error(e as c_int),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let (src, dst) = match (
            self.nodes.path_of(ino),
            self.nodes.child_path(newparent, newname),
        ) {
            (Ok(src), Ok(dst)) => (src, dst),
            (Err(e), _) | (_, Err(e)) => return reply.error(e as c_int),
        };
        match self.pool.link(&src, &dst) {
            Ok((meta, _full)) => {
                let config = self.pool.config.read();
                let attr = self.attr_for(&config, &dst, &meta);
                drop(config);
                self.nodes.remember(&dst);
                reply.entry(&self.ttl_entry(), &attr, 0)
            }
            Err(e) => reply.error(e as c_int),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.open(&rel, flags) {
            Ok(handle) => {
                let fh = self.alloc_fh();
                self.files.insert(fh, handle);
                reply.opened(fh, self.open_reply_flags());
            }
            Err(e) => reply.error(e as c_int),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let handle = match self.files.get(&fh) {
            Some(handle) => handle,
            None => return reply.error(Errno::EBADF as c_int),
        };
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            match handle
                .file
                .read_at(&mut buf[filled..], offset as u64 + filled as u64)
            {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return reply.error(sys::errno_from_io(&e) as c_int),
            }
        }
        reply.data(&buf[..filled]);
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let pool = self.pool.clone();
        let handle = match self.files.get_mut(&fh) {
            Some(handle) => handle,
            None => return reply.error(Errno::EBADF as c_int),
        };
        match handle.file.write_all_at(data, offset as u64) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => {
                let errno = sys::errno_from_io(&e);
                if matches!(errno, Errno::ENOSPC | Errno::EDQUOT)
                    && spill::move_file(&pool, handle).is_ok()
                {
                    match handle.file.write_all_at(data, offset as u64) {
                        Ok(()) => return reply.written(data.len() as u32),
                        Err(e) => return reply.error(sys::errno_from_io(&e) as c_int),
                    }
                }
                reply.error(errno as c_int)
            }
        }
    }

    fn flush(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let handle = match self.files.get(&fh) {
            Some(handle) => handle,
            None => return reply.error(Errno::EBADF as c_int),
        };
        let mode = self.pool.config.read().flushonclose;
        let flush = match mode {
            crate::config::FlushOnClose::Never => false,
            crate::config::FlushOnClose::OpenedForWrite => handle.writable,
            crate::config::FlushOnClose::Always => true,
        };
        if flush {
            if let Err(e) = handle.file.sync_data() {
                return reply.error(sys::errno_from_io(&e) as c_int);
            }
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.files.remove(&fh) {
            if self.pool.config.read().dropcacheonclose {
                sys::fadvise_dontneed(handle.file.as_raw_fd());
            }
        }
        reply.ok();
    }

    fn fsync(&mut self, req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let handle = match self.files.get(&fh) {
            Some(handle) => handle,
            None => return reply.error(Errno::EBADF as c_int),
        };
        let result = if datasync {
            handle.file.sync_data()
        } else {
            handle.file.sync_all()
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(sys::errno_from_io(&e) as c_int),
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        let (mode, threads) = {
            let config = self.pool.config.read();
            (config.readdir, config.threads)
        };
        let branches = self.pool.branches.snapshot();
        match crate::readdir::readdir_union(&branches, &rel, mode, threads) {
            Ok(entries) => {
                let dir_ino = self.path_attr(&rel).map(|a| a.ino).unwrap_or(ino);
                let fh = self.alloc_fh();
                self.dirs.insert(
                    fh,
                    DirHandle {
                        rel,
                        dir_ino,
                        branches,
                        entries,
                    },
                );
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e as c_int),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let handle = match self.dirs.get(&fh) {
            Some(handle) => handle,
            None => return reply.error(Errno::EBADF as c_int),
        };
        let algo = self.pool.config.read().inodecalc;

        // two synthetic entries, then the merged stream; the offset is
        // the index of the next entry in that combined sequence
        let mut index = offset;
        loop {
            let full = match index {
                0 => reply.add(handle.dir_ino, 1, FileType::Directory, "."),
                1 => reply.add(handle.dir_ino, 2, FileType::Directory, ".."),
                _ => {
                    let slot = (index - 2) as usize;
                    let entry = match handle.entries.get(slot) {
                        Some(entry) => entry,
                        None => break,
                    };
                    let child = Self::hash_path(&handle.rel.join(&entry.name));
                    let entry_ino = inode::calc(
                        algo,
                        &child,
                        entry.dev,
                        entry.ino,
                        entry.kind == FileType::Directory,
                    );
                    reply.add(entry_ino, index + 1, entry.kind, &entry.name)
                }
            };
            if full {
                break;
            }
            index += 1;
        }
        reply.ok();
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let handle = match self.dirs.get(&fh) {
            Some(handle) => handle,
            None => return reply.error(Errno::EBADF as c_int),
        };
        let ttl = self.ttl_entry();
        let config = self.pool.config.read().clone();

        // offsets are slot positions in the merged listing; entries
        // whose backing stat races away are skipped without disturbing
        // the cookies of their neighbors
        let mut remembered = Vec::new();
        for (slot, entry) in handle.entries.iter().enumerate().skip(offset as usize) {
            let child_rel = handle.rel.join(&entry.name);
            let full = handle.branches.list[entry.branch].full_path(&child_rel);
            let attr = match sys::lstat(&full) {
                Ok(meta) => self.attr_for(&config, &child_rel, &meta),
                Err(_) => continue,
            };
            if reply.add(attr.ino, (slot + 1) as i64, &entry.name, &ttl, &attr, 0) {
                break;
            }
            remembered.push(child_rel);
        }
        for child in remembered {
            self.nodes.remember(&child);
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        match self.dirs.remove(&fh) {
            Some(_) => reply.ok(),
            None => reply.error(Errno::EBADF as c_int),
        }
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.statfs(&rel) {
            Ok(st) => reply.statfs(
                st.blocks,
                st.bfree,
                st.bavail,
                st.files,
                st.ffree,
                st.bsize as u32,
                st.namemax as u32,
                st.frsize as u32,
            ),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.setxattr(&rel, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn getxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.getxattr(&rel, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32)
                } else if value.len() > size as usize {
                    reply.error(Errno::ERANGE as c_int)
                } else {
                    reply.data(&value)
                }
            }
            Err(e) => reply.error(e as c_int),
        }
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.listxattr(&rel) {
            Ok(list) => {
                if size == 0 {
                    reply.size(list.len() as u32)
                } else if list.len() > size as usize {
                    reply.error(Errno::ERANGE as c_int)
                } else {
                    reply.data(&list)
                }
            }
            Err(e) => reply.error(e as c_int),
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.removexattr(&rel, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.path_of(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.access(&rel, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let rel = match self.nodes.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e as c_int),
        };
        match self.pool.create(&rel, mode & !umask, flags) {
            Ok(handle) => {
                let meta = match handle.file.metadata() {
                    Ok(meta) => meta,
                    Err(e) => return reply.error(sys::errno_from_io(&e) as c_int),
                };
                let config = self.pool.config.read();
                let attr = self.attr_for(&config, &rel, &meta);
                drop(config);
                self.nodes.remember(&rel);
                let fh = self.alloc_fh();
                self.files.insert(fh, handle);
                reply.created(&self.ttl_entry(), &attr, 0, fh, self.open_reply_flags());
            }
            Err(e) => reply.error(e as c_int),
        }
    }

    fn fallocate(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let handle = match self.files.get(&fh) {
            Some(handle) => handle,
            None => return reply.error(Errno::EBADF as c_int),
        };
        match sys::fallocate(handle.file.as_raw_fd(), mode, offset, length) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn lseek(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let handle = match self.files.get(&fh) {
            Some(handle) => handle,
            None => return reply.error(Errno::EBADF as c_int),
        };
        match sys::lseek(handle.file.as_raw_fd(), offset, whence) {
            Ok(pos) => reply.offset(pos),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn copy_file_range(
        &mut self,
        req: &Request<'_>,
        _ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        _ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let (src, dst) = match (self.files.get(&fh_in), self.files.get(&fh_out)) {
            (Some(src), Some(dst)) => (src.file.as_raw_fd(), dst.file.as_raw_fd()),
            _ => return reply.error(Errno::EBADF as c_int),
        };
        match sys::copy_file_range_at(src, offset_in, dst, offset_out, len as usize) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn ioctl(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: u32,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
        reply: ReplyIoctl,
    ) {
        let _ugid = ugid::Guard::new(req.uid(), req.gid());
        let file = self
            .files
            .get(&fh)
            .map(|h| (h.branch_path.clone(), h.rel.clone()));
        let file_ref = file.as_ref().map(|(b, r)| (b.as_path(), r.as_path()));
        match ctl::handle(&self.pool, cmd, in_data, file_ref) {
            Ok(mut data) => {
                data.truncate(out_size as usize);
                reply.ioctl(0, &data)
            }
            Err(e) => reply.error(e as c_int),
        }
    }
}
