//! File copy used by the ENOSPC spill path.
//!
//! copy_file_range first (reflink-capable filesystems make this nearly
//! free), then a sparse-aware read/write loop that skips holes via
//! SEEK_DATA/SEEK_HOLE, then a plain chunked loop on filesystems that
//! know neither.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::errno::Errno;

use crate::sys;

const CHUNK: usize = 128 * 1024;

fn copy_range_loop(src: &File, dst: &File, len: u64) -> Result<(), Errno> {
    let mut offset: u64 = 0;
    while offset < len {
        let want = std::cmp::min((len - offset) as usize, 1 << 30);
        let copied = sys::copy_file_range_at(
            src.as_raw_fd(),
            offset as i64,
            dst.as_raw_fd(),
            offset as i64,
            want,
        )?;
        if copied == 0 {
            break;
        }
        offset += copied as u64;
    }
    Ok(())
}

fn copy_segment(src: &File, dst: &File, mut offset: u64, end: u64) -> Result<(), Errno> {
    let mut buf = vec![0u8; CHUNK];
    while offset < end {
        let want = std::cmp::min((end - offset) as usize, CHUNK);
        let got = src
            .read_at(&mut buf[..want], offset)
            .map_err(|e| sys::errno_from_io(&e))?;
        if got == 0 {
            break;
        }
        dst.write_all_at(&buf[..got], offset)
            .map_err(|e| sys::errno_from_io(&e))?;
        offset += got as u64;
    }
    Ok(())
}

fn copy_sparse(src: &File, dst: &File, len: u64) -> Result<(), Errno> {
    let fd = src.as_raw_fd();
    let mut offset: u64 = 0;
    loop {
        let data = match sys::lseek(fd, offset as i64, libc::SEEK_DATA) {
            Ok(pos) => pos as u64,
            // ENXIO: nothing but hole to EOF. EINVAL: no SEEK_DATA here.
            Err(Errno::ENXIO) => break,
            Err(Errno::EINVAL) => return copy_segment(src, dst, 0, len),
            Err(e) => return Err(e),
        };
        if data >= len {
            break;
        }
        let hole = match sys::lseek(fd, data as i64, libc::SEEK_HOLE) {
            Ok(pos) => (pos as u64).min(len),
            Err(_) => len,
        };
        copy_segment(src, dst, data, hole)?;
        offset = hole;
        if offset >= len {
            break;
        }
    }
    Ok(())
}

/// Copy `len` bytes of data from `src` into `dst`. The destination is
/// sized first so holes stay holes.
pub fn copydata(src: &File, dst: &File, len: u64) -> Result<(), Errno> {
    sys::ftruncate(dst.as_raw_fd(), len)?;
    match copy_range_loop(src, dst, len) {
        Ok(()) => Ok(()),
        // not same-fs capable or not implemented: degrade gracefully
        Err(Errno::EXDEV) | Err(Errno::EINVAL) | Err(Errno::ENOSYS) | Err(Errno::EBADF) => {
            copy_sparse(src, dst, len)
        }
        Err(e) => Err(e),
    }
}

/// Copy mode, ownership, times and xattrs from `src` onto `dst`.
pub fn copyattrs(src: &Path, dst: &Path) -> Result<(), Errno> {
    let meta = sys::lstat(src)?;
    sys::chmod(dst, meta.mode() & 0o7777)?;
    let _ = sys::lchown(dst, Some(meta.uid()), Some(meta.gid()));
    if let Ok(xattrs) = sys::lxattrs(src) {
        for (name, value) in xattrs {
            let _ = sys::lsetxattr(dst, &name, &value, 0);
        }
    }
    sys::lutimens(
        dst,
        libc::timespec {
            tv_sec: meta.atime() as libc::time_t,
            tv_nsec: meta.atime_nsec() as libc::c_long,
        },
        libc::timespec {
            tv_sec: meta.mtime() as libc::time_t,
            tv_nsec: meta.mtime_nsec() as libc::c_long,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_bytes_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src_path, &payload).unwrap();

        let src = File::open(&src_path).unwrap();
        let dst = File::create(&dst_path).unwrap();
        copydata(&src, &dst, payload.len() as u64).unwrap();
        assert_eq!(std::fs::read(&dst_path).unwrap(), payload);
    }

    #[test]
    fn preserves_length_of_sparse_files() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");

        let src = File::create(&src_path).unwrap();
        src.write_all_at(b"tail", 1 << 20).unwrap();
        let len = src.metadata().unwrap().len();

        let src = File::open(&src_path).unwrap();
        let dst = File::create(&dst_path).unwrap();
        copydata(&src, &dst, len).unwrap();

        let meta = std::fs::metadata(&dst_path).unwrap();
        assert_eq!(meta.len(), len);
        let mut tail = [0u8; 4];
        File::open(&dst_path)
            .unwrap()
            .read_at(&mut tail, 1 << 20)
            .unwrap();
        assert_eq!(&tail, b"tail");
    }

    #[test]
    fn copyattrs_applies_mode_and_times() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");
        std::fs::write(&src_path, b"x").unwrap();
        std::fs::write(&dst_path, b"y").unwrap();
        sys::chmod(&src_path, 0o640).unwrap();
        sys::lutimens(
            &src_path,
            libc::timespec {
                tv_sec: 1_000_000,
                tv_nsec: 0,
            },
            libc::timespec {
                tv_sec: 2_000_000,
                tv_nsec: 0,
            },
        )
        .unwrap();

        copyattrs(&src_path, &dst_path).unwrap();
        let meta = sys::lstat(&dst_path).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o640);
        assert_eq!(meta.mtime(), 2_000_000);
    }
}
