//! Thin syscall wrappers used by the handlers.
//!
//! Everything returns `Result<_, Errno>` so the dispatcher is the only
//! place an errno is turned into a FUSE reply. Wrappers exist only for
//! calls std does not cover; plain metadata and file I/O go through
//! `std::fs` / `FileExt`.

use std::ffi::CString;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fs::File;
use std::fs::Metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::path::PathBuf;

use nix::errno::Errno;

pub fn errno_from_io(err: &io::Error) -> Errno {
    match err.raw_os_error() {
        Some(raw) => Errno::from_raw(raw),
        None => Errno::EIO,
    }
}

fn cstring(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

fn cstring_os(s: &OsStr) -> Result<CString, Errno> {
    CString::new(s.as_bytes()).map_err(|_| Errno::EINVAL)
}

pub fn lstat(path: &Path) -> Result<Metadata, Errno> {
    std::fs::symlink_metadata(path).map_err(|e| errno_from_io(&e))
}

pub fn stat(path: &Path) -> Result<Metadata, Errno> {
    std::fs::metadata(path).map_err(|e| errno_from_io(&e))
}

pub fn open(path: &Path, flags: i32, mode: u32) -> Result<File, Errno> {
    let c = cstring(path)?;
    let fd = Errno::result(unsafe { libc::open(c.as_ptr(), flags, mode as libc::c_uint) })?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

pub fn mkdir(path: &Path, mode: u32) -> Result<(), Errno> {
    let c = cstring(path)?;
    Errno::result(unsafe { libc::mkdir(c.as_ptr(), mode as libc::mode_t) }).map(drop)
}

pub fn chmod(path: &Path, mode: u32) -> Result<(), Errno> {
    let c = cstring(path)?;
    Errno::result(unsafe { libc::chmod(c.as_ptr(), mode as libc::mode_t) }).map(drop)
}

pub fn lchown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), Errno> {
    let c = cstring(path)?;
    let uid = uid.unwrap_or(u32::MAX) as libc::uid_t;
    let gid = gid.unwrap_or(u32::MAX) as libc::gid_t;
    Errno::result(unsafe { libc::lchown(c.as_ptr(), uid, gid) }).map(drop)
}

pub fn truncate(path: &Path, size: u64) -> Result<(), Errno> {
    let c = cstring(path)?;
    Errno::result(unsafe { libc::truncate(c.as_ptr(), size as libc::off_t) }).map(drop)
}

pub fn ftruncate(fd: RawFd, size: u64) -> Result<(), Errno> {
    Errno::result(unsafe { libc::ftruncate(fd, size as libc::off_t) }).map(drop)
}

pub fn mknod(path: &Path, mode: u32, rdev: u64) -> Result<(), Errno> {
    let c = cstring(path)?;
    Errno::result(unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
        .map(drop)
}

/// utimensat(2) on the path itself (no symlink follow).
pub fn lutimens(path: &Path, atime: libc::timespec, mtime: libc::timespec) -> Result<(), Errno> {
    let c = cstring(path)?;
    let times = [atime, mtime];
    Errno::result(unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })
    .map(drop)
}

pub const TIMESPEC_OMIT: libc::timespec = libc::timespec {
    tv_sec: 0,
    tv_nsec: libc::UTIME_OMIT,
};

pub const TIMESPEC_NOW: libc::timespec = libc::timespec {
    tv_sec: 0,
    tv_nsec: libc::UTIME_NOW,
};

/// access(2) with the effective ids, as the kernel will apply them.
pub fn eaccess(path: &Path, mode: i32) -> Result<(), Errno> {
    let c = cstring(path)?;
    Errno::result(unsafe { libc::faccessat(libc::AT_FDCWD, c.as_ptr(), mode, libc::AT_EACCESS) })
        .map(drop)
}

pub fn fallocate(fd: RawFd, mode: i32, offset: i64, length: i64) -> Result<(), Errno> {
    Errno::result(unsafe {
        libc::fallocate(fd, mode, offset as libc::off_t, length as libc::off_t)
    })
    .map(drop)
}

pub fn fadvise_dontneed(fd: RawFd) {
    unsafe {
        libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_DONTNEED);
    }
}

pub fn lseek(fd: RawFd, offset: i64, whence: i32) -> Result<i64, Errno> {
    Errno::result(unsafe { libc::lseek(fd, offset as libc::off_t, whence) }).map(|v| v as i64)
}

pub fn copy_file_range(fd_in: RawFd, fd_out: RawFd, len: usize) -> Result<usize, Errno> {
    let rv = Errno::result(unsafe {
        libc::copy_file_range(
            fd_in,
            std::ptr::null_mut(),
            fd_out,
            std::ptr::null_mut(),
            len,
            0,
        )
    })?;
    Ok(rv as usize)
}

pub fn copy_file_range_at(
    fd_in: RawFd,
    off_in: i64,
    fd_out: RawFd,
    off_out: i64,
    len: usize,
) -> Result<usize, Errno> {
    let mut off_in = off_in as libc::off64_t;
    let mut off_out = off_out as libc::off64_t;
    let rv = Errno::result(unsafe {
        libc::copy_file_range(fd_in, &mut off_in, fd_out, &mut off_out, len, 0)
    })?;
    Ok(rv as usize)
}

pub fn lgetxattr(path: &Path, name: &OsStr, buf: &mut [u8]) -> Result<usize, Errno> {
    let c = cstring(path)?;
    let n = cstring_os(name)?;
    let rv = Errno::result(unsafe {
        libc::lgetxattr(
            c.as_ptr(),
            n.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    })?;
    Ok(rv as usize)
}

pub fn lsetxattr(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<(), Errno> {
    let c = cstring(path)?;
    let n = cstring_os(name)?;
    Errno::result(unsafe {
        libc::lsetxattr(
            c.as_ptr(),
            n.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    })
    .map(drop)
}

pub fn llistxattr(path: &Path, buf: &mut [u8]) -> Result<usize, Errno> {
    let c = cstring(path)?;
    let rv = Errno::result(unsafe {
        libc::llistxattr(c.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    })?;
    Ok(rv as usize)
}

pub fn lremovexattr(path: &Path, name: &OsStr) -> Result<(), Errno> {
    let c = cstring(path)?;
    let n = cstring_os(name)?;
    Errno::result(unsafe { libc::lremovexattr(c.as_ptr(), n.as_ptr()) }).map(drop)
}

/// All xattrs of `path` as (name, value) pairs.
pub fn lxattrs(path: &Path) -> Result<Vec<(OsString, Vec<u8>)>, Errno> {
    let mut names = vec![0u8; 64 * 1024];
    let len = llistxattr(path, &mut names)?;
    names.truncate(len);

    let mut out = Vec::new();
    for name in names.split(|b| *b == 0).filter(|s| !s.is_empty()) {
        let name = OsStr::from_bytes(name);
        let mut value = vec![0u8; 64 * 1024];
        match lgetxattr(path, name, &mut value) {
            Ok(n) => {
                value.truncate(n);
                out.push((name.to_os_string(), value));
            }
            // raced away or unreadable: skip the attr, not the file
            Err(_) => continue,
        }
    }
    Ok(out)
}

/// glob(3) expansion; a pattern with no match expands to nothing rather
/// than erroring, mirroring how branch specs are declared.
pub fn glob(pattern: &Path) -> Result<Vec<PathBuf>, Errno> {
    let c = cstring(pattern)?;
    let mut gl: libc::glob_t = unsafe { std::mem::zeroed() };
    let rv = unsafe { libc::glob(c.as_ptr(), libc::GLOB_NOSORT, None, &mut gl) };
    let mut out = Vec::new();
    match rv {
        0 => {
            for i in 0..gl.gl_pathc {
                let p = unsafe { *gl.gl_pathv.add(i) };
                if p.is_null() {
                    continue;
                }
                let bytes = unsafe { std::ffi::CStr::from_ptr(p) }.to_bytes().to_vec();
                out.push(PathBuf::from(OsString::from_vec(bytes)));
            }
            unsafe { libc::globfree(&mut gl) };
            Ok(out)
        }
        libc::GLOB_NOMATCH => {
            unsafe { libc::globfree(&mut gl) };
            Ok(out)
        }
        libc::GLOB_NOSPACE => Err(Errno::ENOMEM),
        _ => Err(Errno::EINVAL),
    }
}
