//! End-to-end behavior of the union core over real temp directories.

use std::os::unix::fs::FileExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;

use nix::errno::Errno;

use poolfs::branch::Branches;
use poolfs::config::Config;
use poolfs::policy::Policy;
use poolfs::pool::Pool;
use poolfs::pool::RENAME_EXDEV_DIR;

struct Fixture {
    _dir: tempfile::TempDir,
    pool: Pool,
    roots: Vec<PathBuf>,
}

impl Fixture {
    /// Branches from specs like `("a", "RW")`, plus a config tweak hook.
    fn new(specs: &[(&str, &str)], tweak: impl FnOnce(&mut Config)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut parts = Vec::new();
        let mut roots = Vec::new();
        for (name, mode) in specs {
            let p = dir.path().join(name);
            std::fs::create_dir_all(&p).unwrap();
            parts.push(format!("{}={}", p.display(), mode));
            roots.push(p.canonicalize().unwrap());
        }
        let branches = Branches::parse(&parts.join(":")).unwrap();
        let mut config = Config::default();
        config.minfreespace = 0;
        tweak(&mut config);
        Fixture {
            _dir: dir,
            pool: Pool::new(config, branches),
            roots,
        }
    }

    fn write(&self, branch: usize, rel: &str, data: &[u8]) {
        let full = self.roots[branch].join(rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, data).unwrap();
    }

    fn exists(&self, branch: usize, rel: &str) -> bool {
        self.roots[branch].join(rel).symlink_metadata().is_ok()
    }
}

#[test]
fn create_is_exclusive_to_one_branch() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |c| {
        c.funcs.create = Policy::Ff;
    });
    let handle = fx.pool.create(Path::new("x"), 0o644, libc::O_WRONLY).unwrap();
    handle.file.write_all_at(b"data", 0).unwrap();

    assert!(fx.exists(0, "x"));
    assert!(!fx.exists(1, "x"));

    let (meta, _) = fx.pool.getattr(Path::new("x")).unwrap();
    assert!(meta.is_file());
}

#[test]
fn create_skips_full_ineligible_branches() {
    let fx = Fixture::new(&[("b1", "RO"), ("b2", "NC"), ("b3", "RW")], |c| {
        c.funcs.create = Policy::Ff;
    });
    fx.pool.create(Path::new("x"), 0o644, libc::O_WRONLY).unwrap();
    assert!(!fx.exists(0, "x"));
    assert!(!fx.exists(1, "x"));
    assert!(fx.exists(2, "x"));
}

#[test]
fn action_applies_to_every_instance() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |_| {});
    fx.write(0, "f", b"1");
    fx.write(1, "f", b"2");

    fx.pool.chmod(Path::new("f"), 0o600).unwrap();

    for root in &fx.roots {
        let meta = root.join("f").symlink_metadata().unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o600);
    }
}

#[test]
fn unlink_suppresses_enoent_on_other_branches() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |_| {});
    fx.write(0, "f", b"1");

    fx.pool.unlink(Path::new("f")).unwrap();
    assert!(!fx.exists(0, "f"));
    assert_eq!(fx.pool.unlink(Path::new("f")), Err(Errno::ENOENT));
}

#[test]
fn readdir_unions_and_dedups() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |_| {});
    fx.write(0, "d/a", b"");
    fx.write(0, "d/b", b"from-b1");
    fx.write(1, "d/b", b"from-b2!");
    fx.write(1, "d/c", b"");

    let entries = fx.pool.readdir(Path::new("d")).unwrap();
    let mut names: Vec<String> = entries
        .iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c"]);

    // "b"'s identity comes from the first branch holding it
    let b = entries.iter().find(|e| e.name == "b").unwrap();
    assert_eq!(b.branch, 0);
    let meta = fx.roots[0].join("d/b").symlink_metadata().unwrap();
    assert_eq!(b.ino, meta.ino());
}

#[test]
fn path_cloning_reproduces_ancestors() {
    let fx = Fixture::new(&[("b1", "NC"), ("b2", "RW")], |c| {
        c.funcs.create = Policy::Ff;
    });
    // the ancestor chain exists only on the no-create branch
    std::fs::create_dir_all(fx.roots[0].join("p/q")).unwrap();
    poolfs::sys::chmod(&fx.roots[0].join("p"), 0o755).unwrap();
    poolfs::sys::chmod(&fx.roots[0].join("p/q"), 0o750).unwrap();

    fx.pool
        .create(Path::new("p/q/r"), 0o644, libc::O_WRONLY)
        .unwrap();

    assert!(fx.exists(1, "p/q/r"));
    let p = fx.roots[1].join("p").symlink_metadata().unwrap();
    let q = fx.roots[1].join("p/q").symlink_metadata().unwrap();
    assert_eq!(p.mode() & 0o7777, 0o755);
    assert_eq!(q.mode() & 0o7777, 0o750);
}

#[test]
fn ep_create_goes_where_the_parent_lives() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |c| {
        c.funcs.create = Policy::EpFf;
    });
    std::fs::create_dir_all(fx.roots[1].join("only2")).unwrap();

    fx.pool
        .create(Path::new("only2/f"), 0o644, libc::O_WRONLY)
        .unwrap();
    assert!(!fx.exists(0, "only2/f"));
    assert!(fx.exists(1, "only2/f"));
}

#[test]
fn mkdir_rmdir_roundtrip() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |_| {});
    fx.pool.mkdir(Path::new("d"), 0o755).unwrap();
    let on0 = fx.exists(0, "d");
    let on1 = fx.exists(1, "d");
    assert!(on0 ^ on1, "directory must land on exactly one branch");

    fx.pool.rmdir(Path::new("d")).unwrap();
    assert!(!fx.exists(0, "d"));
    assert!(!fx.exists(1, "d"));
}

#[test]
fn rename_within_branch_and_back() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |c| {
        c.funcs.create = Policy::Ff;
    });
    fx.write(0, "a", b"payload");

    fx.pool.rename(Path::new("a"), Path::new("b")).unwrap();
    assert!(!fx.exists(0, "a"));
    assert_eq!(std::fs::read(fx.roots[0].join("b")).unwrap(), b"payload");

    fx.pool.rename(Path::new("b"), Path::new("a")).unwrap();
    assert!(!fx.exists(0, "b"));
    assert!(!fx.exists(1, "a"));
    assert_eq!(std::fs::read(fx.roots[0].join("a")).unwrap(), b"payload");
}

#[test]
fn rename_removes_stale_copies() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |c| {
        c.funcs.create = Policy::Ff;
    });
    fx.write(0, "f", b"new");
    fx.write(1, "f", b"old");

    fx.pool.rename(Path::new("f"), Path::new("g")).unwrap();
    assert_eq!(std::fs::read(fx.roots[0].join("g")).unwrap(), b"new");
    assert!(!fx.exists(1, "f"));
    assert!(!fx.exists(1, "g"));
}

#[test]
fn rename_exdev_passthrough_and_symlink() {
    // src lives on a no-create branch; the create policy wants dst on b2
    let fx = Fixture::new(&[("b1", "NC"), ("b2", "RW")], |c| {
        c.funcs.create = Policy::Ff;
    });
    fx.write(0, "f", b"data");
    assert_eq!(
        fx.pool.rename(Path::new("f"), Path::new("g")),
        Err(Errno::EXDEV)
    );

    fx.pool
        .option_set("rename-exdev", "rel-symlink")
        .unwrap();
    fx.pool.rename(Path::new("f"), Path::new("g")).unwrap();

    let shadow = fx.roots[0].join(RENAME_EXDEV_DIR).join("g");
    assert_eq!(std::fs::read(&shadow).unwrap(), b"data");
    let link = fx.roots[0].join("g");
    assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
    assert_eq!(std::fs::read(&link).unwrap(), b"data");
}

#[test]
fn link_on_shared_branch() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |_| {});
    fx.write(0, "f", b"x");

    let (meta, full) = fx.pool.link(Path::new("f"), Path::new("hard")).unwrap();
    assert_eq!(meta.nlink(), 2);
    assert_eq!(full, fx.roots[0].join("hard"));
    assert_eq!(
        fx.roots[0].join("f").symlink_metadata().unwrap().ino(),
        fx.roots[0].join("hard").symlink_metadata().unwrap().ino()
    );
}

#[test]
fn link_exdev_falls_back_to_symlink() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |c| {
        // path-preserving link: dst parent missing on the src branch
        c.funcs.link = Policy::EpAll;
        c.link_exdev = poolfs::config::LinkExdev::RelSymlink;
    });
    fx.write(0, "f", b"x");
    std::fs::create_dir_all(fx.roots[1].join("d")).unwrap();

    // dst parent "d" exists only on b2, src "f" only on b1
    let (meta, full) = fx.pool.link(Path::new("f"), Path::new("d/l")).unwrap();
    assert!(meta.file_type().is_symlink());
    assert_eq!(full, fx.roots[0].join("d/l"));
    assert_eq!(std::fs::read_link(&full).unwrap(), PathBuf::from("../f"));
}

#[test]
fn getattr_prefers_first_branch() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |_| {});
    fx.write(0, "f", b"11");
    fx.write(1, "f", b"2222");

    let (meta, full) = fx.pool.getattr(Path::new("f")).unwrap();
    assert_eq!(meta.len(), 2);
    assert_eq!(full, fx.roots[0].join("f"));
}

#[test]
fn statfs_base_dedups_by_device() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |_| {});
    // both branches share one device: the aggregate equals one statvfs
    let aggregated = fx.pool.statfs(Path::new("")).unwrap();
    let single = fx.pool.statcache.statfs(&fx.roots[0]).unwrap();
    assert_eq!(aggregated.blocks, single.blocks);
    assert_eq!(aggregated.files, single.files);
}

#[test]
fn statfs_ignore_zeroes_free_counts() {
    let fx = Fixture::new(&[("b1", "RO")], |c| {
        c.statfs_ignore = poolfs::config::StatfsIgnore::Ro;
    });
    let st = fx.pool.statfs(Path::new("")).unwrap();
    assert!(st.blocks > 0);
    assert_eq!(st.bavail, 0);
    assert_eq!(st.bfree, 0);
}

#[test]
fn xattr_roundtrip_when_supported() {
    let fx = Fixture::new(&[("b1", "RW")], |_| {});
    fx.write(0, "f", b"x");
    let name = std::ffi::OsStr::new("user.poolfs.test");

    match fx.pool.setxattr(Path::new("f"), name, b"value", 0) {
        Ok(()) => {}
        Err(Errno::ENOTSUP) | Err(Errno::EPERM) => return,
        Err(e) => panic!("setxattr: {e}"),
    }
    assert_eq!(fx.pool.getxattr(Path::new("f"), name).unwrap(), b"value");
    let list = fx.pool.listxattr(Path::new("f")).unwrap();
    assert!(list
        .split(|b| *b == 0)
        .any(|n| n == b"user.poolfs.test"));
    fx.pool.removexattr(Path::new("f"), name).unwrap();
    assert_eq!(
        fx.pool.getxattr(Path::new("f"), name),
        Err(Errno::ENODATA)
    );
}

#[test]
fn xattr_modes_gate_the_surface() {
    let fx = Fixture::new(&[("b1", "RW")], |c| {
        c.xattr = poolfs::config::XattrMode::NoSys;
    });
    fx.write(0, "f", b"x");
    let name = std::ffi::OsStr::new("user.k");
    assert_eq!(
        fx.pool.getxattr(Path::new("f"), name),
        Err(Errno::ENOSYS)
    );

    fx.pool.option_set("xattr", "noattr").unwrap();
    assert_eq!(
        fx.pool.getxattr(Path::new("f"), name),
        Err(Errno::ENODATA)
    );
    assert_eq!(fx.pool.listxattr(Path::new("f")).unwrap(), Vec::<u8>::new());
}

#[test]
fn open_write_read_through_handle() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |_| {});
    fx.write(1, "only2", b"hello");

    let handle = fx.pool.open(Path::new("only2"), libc::O_RDWR).unwrap();
    assert_eq!(handle.branch_path, fx.roots[1]);
    let mut buf = [0u8; 5];
    handle.file.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"hello");
    handle.file.write_all_at(b"HELLO", 0).unwrap();
    assert_eq!(std::fs::read(fx.roots[1].join("only2")).unwrap(), b"HELLO");
}

#[test]
fn truncate_hits_every_copy() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |_| {});
    fx.write(0, "f", b"0123456789");
    fx.write(1, "f", b"abcdefghij");

    fx.pool.truncate(Path::new("f"), 4).unwrap();
    assert_eq!(std::fs::read(fx.roots[0].join("f")).unwrap(), b"0123");
    assert_eq!(std::fs::read(fx.roots[1].join("f")).unwrap(), b"abcd");
}

#[test]
fn runtime_reconfiguration_changes_placement() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |c| {
        c.funcs.create = Policy::Ff;
    });
    std::fs::create_dir_all(fx.roots[1].join("d")).unwrap();

    // ff would land d/f on b1 (cloning d); switch to epff at runtime
    fx.pool.option_set("category.create", "epff").unwrap();
    fx.pool
        .create(Path::new("d/f"), 0o644, libc::O_WRONLY)
        .unwrap();
    assert!(!fx.exists(0, "d/f"));
    assert!(fx.exists(1, "d/f"));
}

#[test]
fn branch_removal_is_live() {
    let fx = Fixture::new(&[("b1", "RW"), ("b2", "RW")], |_| {});
    fx.write(0, "f", b"1");
    fx.write(1, "f", b"1");

    fx.pool
        .option_set("branches", &format!("-{}", fx.roots[0].display()))
        .unwrap();
    let (_, full) = fx.pool.getattr(Path::new("f")).unwrap();
    assert_eq!(full, fx.roots[1].join("f"));
}

#[test]
fn symlink_and_readlink() {
    let fx = Fixture::new(&[("b1", "RW")], |_| {});
    fx.pool
        .symlink(Path::new("target/path"), Path::new("l"))
        .unwrap();
    assert_eq!(
        fx.pool.readlink(Path::new("l")).unwrap(),
        std::ffi::OsString::from("target/path")
    );
    // readlink of a fresh regular file stays EINVAL
    fx.write(0, "f", b"x");
    assert_eq!(fx.pool.readlink(Path::new("f")), Err(Errno::EINVAL));
}

#[test]
fn erofs_create_policy_disables_writes() {
    let fx = Fixture::new(&[("b1", "RW")], |c| {
        c.funcs.create = Policy::Erofs;
    });
    assert_eq!(
        fx.pool
            .create(Path::new("x"), 0o644, libc::O_WRONLY)
            .err()
            .unwrap(),
        Errno::EROFS
    );
}
