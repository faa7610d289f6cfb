//! Control ioctls: runtime introspection and reconfiguration on a
//! mounted filesystem without remounting.
//!
//! The protocol is NUL-terminated strings in a fixed 4096-byte buffer,
//! so shell tooling can drive it with nothing but ioctl(2).

use std::path::Path;
use std::path::PathBuf;

use nix::errno::Errno;

use crate::pool::Pool;
use crate::sys;

pub const IOCTL_BUF_SIZE: usize = 4096;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn iowr(nr: u32) -> u32 {
    ((IOC_READ | IOC_WRITE) << 30) | ((IOCTL_BUF_SIZE as u32) << 16) | ((b'P' as u32) << 8) | nr
}

/// in: option name; out: current value.
pub const IOCTL_GET_OPT: u32 = iowr(0);
/// in: `key=value`.
pub const IOCTL_SET_OPT: u32 = iowr(1);
/// out: every `key=value`, newline separated.
pub const IOCTL_DUMP_CONFIG: u32 = iowr(2);
/// in: one of basepath/relpath/fullpath/allpaths; out: the backing
/// path(s) of the open file the ioctl was issued on.
pub const IOCTL_FILE_INFO: u32 = iowr(3);

fn parse_str(data: &[u8]) -> Result<&str, Errno> {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    std::str::from_utf8(&data[..end]).map_err(|_| Errno::EINVAL)
}

fn reply_str(s: String) -> Vec<u8> {
    let mut out = s.into_bytes();
    out.push(0);
    out
}

/// Dispatch one control ioctl. `file` carries (branch root, relative
/// path) when the ioctl arrived on an open file handle.
pub fn handle(
    pool: &Pool,
    cmd: u32,
    in_data: &[u8],
    file: Option<(&Path, &Path)>,
) -> Result<Vec<u8>, Errno> {
    match cmd {
        IOCTL_GET_OPT => {
            let key = parse_str(in_data)?;
            Ok(reply_str(pool.option_get(key)?))
        }
        IOCTL_SET_OPT => {
            let kv = parse_str(in_data)?;
            let (key, value) = kv.split_once('=').ok_or(Errno::EINVAL)?;
            pool.option_set(key, value)?;
            Ok(Vec::new())
        }
        IOCTL_DUMP_CONFIG => Ok(reply_str(pool.option_dump())),
        IOCTL_FILE_INFO => {
            let (branch_path, rel) = file.ok_or(Errno::EINVAL)?;
            let key = parse_str(in_data)?;
            let value = match key {
                "basepath" => branch_path.display().to_string(),
                "relpath" => format!("/{}", rel.display()),
                "fullpath" => branch_path.join(rel).display().to_string(),
                "allpaths" => {
                    let branches = pool.branches.snapshot();
                    let paths: Vec<String> = branches
                        .iter()
                        .map(|b| b.full_path(rel))
                        .filter(|p| sys::lstat(p).is_ok())
                        .map(|p: PathBuf| p.display().to_string())
                        .collect();
                    paths.join("\n")
                }
                _ => return Err(Errno::ENODATA),
            };
            Ok(reply_str(value))
        }
        _ => Err(Errno::ENOTTY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Branches;
    use crate::config::Config;

    fn fixture() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        let branches = Branches::parse(&format!("{}:{}", a.display(), b.display())).unwrap();
        let pool = Pool::new(Config::default(), branches);
        (dir, pool)
    }

    #[test]
    fn command_numbers_are_distinct_iowr() {
        let cmds = [IOCTL_GET_OPT, IOCTL_SET_OPT, IOCTL_DUMP_CONFIG, IOCTL_FILE_INFO];
        for (i, a) in cmds.iter().enumerate() {
            assert_eq!(a >> 30, 3, "direction bits");
            assert_eq!((a >> 16) & 0x3fff, IOCTL_BUF_SIZE as u32);
            assert_eq!((a >> 8) & 0xff, b'P' as u32);
            for b in &cmds[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn get_and_set_roundtrip() {
        let (_dir, pool) = fixture();
        let out = handle(&pool, IOCTL_GET_OPT, b"statfs\0", None).unwrap();
        assert_eq!(out, b"base\0");

        handle(&pool, IOCTL_SET_OPT, b"statfs=full\0", None).unwrap();
        let out = handle(&pool, IOCTL_GET_OPT, b"statfs\0", None).unwrap();
        assert_eq!(out, b"full\0");

        assert_eq!(
            handle(&pool, IOCTL_SET_OPT, b"statfs=bogus\0", None),
            Err(Errno::EINVAL)
        );
        assert_eq!(
            handle(&pool, IOCTL_GET_OPT, b"unknown\0", None),
            Err(Errno::ENODATA)
        );
    }

    #[test]
    fn dump_lists_branches_and_keys() {
        let (_dir, pool) = fixture();
        let out = handle(&pool, IOCTL_DUMP_CONFIG, b"", None).unwrap();
        let text = String::from_utf8(out[..out.len() - 1].to_vec()).unwrap();
        assert!(text.starts_with("branches="));
        assert!(text.contains("\ncategory.create=epmfs\n"));
        assert!(text.contains("\nfunc.getattr=ff\n"));
    }

    #[test]
    fn branch_mutation_through_set() {
        let (dir, pool) = fixture();
        let c = dir.path().join("c");
        std::fs::create_dir(&c).unwrap();
        let c = c.canonicalize().unwrap();

        handle(
            &pool,
            IOCTL_SET_OPT,
            format!("branches=+{}\0", c.display()).as_bytes(),
            None,
        )
        .unwrap();
        assert_eq!(pool.branches.snapshot().len(), 3);

        handle(
            &pool,
            IOCTL_SET_OPT,
            format!("branches=-{}\0", c.display()).as_bytes(),
            None,
        )
        .unwrap();
        assert_eq!(pool.branches.snapshot().len(), 2);
    }

    #[test]
    fn file_info_paths() {
        let (dir, pool) = fixture();
        let branch = dir.path().join("a").canonicalize().unwrap();
        std::fs::write(branch.join("f"), b"x").unwrap();
        let rel = Path::new("f");

        let out = handle(&pool, IOCTL_FILE_INFO, b"basepath\0", Some((&branch, rel))).unwrap();
        assert_eq!(out, format!("{}\0", branch.display()).into_bytes());

        let out = handle(&pool, IOCTL_FILE_INFO, b"relpath\0", Some((&branch, rel))).unwrap();
        assert_eq!(out, b"/f\0");

        let out = handle(&pool, IOCTL_FILE_INFO, b"fullpath\0", Some((&branch, rel))).unwrap();
        assert_eq!(out, format!("{}\0", branch.join("f").display()).into_bytes());

        let out = handle(&pool, IOCTL_FILE_INFO, b"allpaths\0", Some((&branch, rel))).unwrap();
        assert_eq!(out, format!("{}\0", branch.join("f").display()).into_bytes());

        assert_eq!(
            handle(&pool, IOCTL_FILE_INFO, b"basepath\0", None),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn unknown_command_is_enotty() {
        let (_dir, pool) = fixture();
        assert_eq!(handle(&pool, 0xdead, b"", None), Err(Errno::ENOTTY));
    }
}
