//! Runtime configuration.
//!
//! Every knob is reachable three ways: mount options (`-o key=value`),
//! an optional config file, and the control ioctls at runtime. Values
//! are strings on the outside and typed on the inside; each enum mirrors
//! the option's documented value set exactly.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use nix::errno::Errno;

use crate::inode::InodeCalc;
use crate::num;
use crate::policy::Category;
use crate::policy::Policy;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, Eq, PartialEq)]
        pub enum $name {
            $($variant),+
        }

        impl FromStr for $name {
            type Err = Errno;

            fn from_str(s: &str) -> Result<Self, Errno> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(Errno::EINVAL),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => write!(f, $text)),+
                }
            }
        }
    };
}

string_enum!(XattrMode {
    Passthrough => "passthrough",
    NoSys => "nosys",
    NoAttr => "noattr",
});

string_enum!(StatfsMode {
    Base => "base",
    Full => "full",
});

string_enum!(StatfsIgnore {
    None => "none",
    Ro => "ro",
    Nc => "nc",
});

string_enum!(LinkExdev {
    Passthrough => "passthrough",
    RelSymlink => "rel-symlink",
    AbsBaseSymlink => "abs-base-symlink",
    AbsPoolSymlink => "abs-pool-symlink",
});

string_enum!(RenameExdev {
    Passthrough => "passthrough",
    RelSymlink => "rel-symlink",
    AbsSymlink => "abs-symlink",
});

string_enum!(FollowSymlinks {
    Never => "never",
    Directory => "directory",
    Regular => "regular",
    All => "all",
});

string_enum!(FlushOnClose {
    Never => "never",
    OpenedForWrite => "opened-for-write",
    Always => "always",
});

string_enum!(NfsOpenHack {
    Off => "off",
    Git => "git",
    All => "all",
});

string_enum!(PassthroughMode {
    Off => "off",
    Ro => "ro",
    Wo => "wo",
    Rw => "rw",
});

string_enum!(CacheFiles {
    Off => "off",
    Partial => "partial",
    Full => "full",
    AutoFull => "auto-full",
});

string_enum!(ReaddirMode {
    Seq => "seq",
    Cor => "cor",
});

fn parse_bool(s: &str) -> Result<bool, Errno> {
    match s {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Errno::EINVAL),
    }
}

fn parse_u64(s: &str) -> Result<u64, Errno> {
    s.parse().map_err(|_| Errno::EINVAL)
}

/// Per-operation policy table. Categories initialize it; `func.<op>`
/// overrides individual entries.
#[derive(Clone, Debug)]
pub struct Funcs {
    pub access: Policy,
    pub chmod: Policy,
    pub chown: Policy,
    pub create: Policy,
    pub getattr: Policy,
    pub getxattr: Policy,
    pub link: Policy,
    pub listxattr: Policy,
    pub mkdir: Policy,
    pub mknod: Policy,
    pub open: Policy,
    pub readlink: Policy,
    pub removexattr: Policy,
    pub rename: Policy,
    pub rmdir: Policy,
    pub setxattr: Policy,
    pub symlink: Policy,
    pub truncate: Policy,
    pub unlink: Policy,
    pub utimens: Policy,
}

pub const SEARCH_FUNCS: [&str; 6] = [
    "access",
    "getattr",
    "getxattr",
    "listxattr",
    "open",
    "readlink",
];
pub const ACTION_FUNCS: [&str; 10] = [
    "chmod",
    "chown",
    "link",
    "removexattr",
    "rename",
    "rmdir",
    "setxattr",
    "truncate",
    "unlink",
    "utimens",
];
pub const CREATE_FUNCS: [&str; 4] = ["create", "mkdir", "mknod", "symlink"];

impl Funcs {
    fn new(search: Policy, action: Policy, create: Policy) -> Funcs {
        Funcs {
            access: search,
            getattr: search,
            getxattr: search,
            listxattr: search,
            open: search,
            readlink: search,
            chmod: action,
            chown: action,
            link: action,
            removexattr: action,
            rename: action,
            rmdir: action,
            setxattr: action,
            truncate: action,
            unlink: action,
            utimens: action,
            create,
            mkdir: create,
            mknod: create,
            symlink: create,
        }
    }

    pub fn get(&self, func: &str) -> Option<Policy> {
        match func {
            "access" => Some(self.access),
            "chmod" => Some(self.chmod),
            "chown" => Some(self.chown),
            "create" => Some(self.create),
            "getattr" => Some(self.getattr),
            "getxattr" => Some(self.getxattr),
            "link" => Some(self.link),
            "listxattr" => Some(self.listxattr),
            "mkdir" => Some(self.mkdir),
            "mknod" => Some(self.mknod),
            "open" => Some(self.open),
            "readlink" => Some(self.readlink),
            "removexattr" => Some(self.removexattr),
            "rename" => Some(self.rename),
            "rmdir" => Some(self.rmdir),
            "setxattr" => Some(self.setxattr),
            "symlink" => Some(self.symlink),
            "truncate" => Some(self.truncate),
            "unlink" => Some(self.unlink),
            "utimens" => Some(self.utimens),
            _ => None,
        }
    }

    fn set(&mut self, func: &str, policy: Policy) -> Result<(), Errno> {
        let slot = match func {
            "access" => &mut self.access,
            "chmod" => &mut self.chmod,
            "chown" => &mut self.chown,
            "create" => &mut self.create,
            "getattr" => &mut self.getattr,
            "getxattr" => &mut self.getxattr,
            "link" => &mut self.link,
            "listxattr" => &mut self.listxattr,
            "mkdir" => &mut self.mkdir,
            "mknod" => &mut self.mknod,
            "open" => &mut self.open,
            "readlink" => &mut self.readlink,
            "removexattr" => &mut self.removexattr,
            "rename" => &mut self.rename,
            "rmdir" => &mut self.rmdir,
            "setxattr" => &mut self.setxattr,
            "symlink" => &mut self.symlink,
            "truncate" => &mut self.truncate,
            "unlink" => &mut self.unlink,
            "utimens" => &mut self.utimens,
            _ => return Err(Errno::ENODATA),
        };
        *slot = policy;
        Ok(())
    }

    fn set_category(&mut self, category: Category, policy: Policy) {
        let names: &[&str] = match category {
            Category::Search => &SEARCH_FUNCS,
            Category::Action => &ACTION_FUNCS,
            Category::Create => &CREATE_FUNCS,
        };
        for name in names {
            let _ = self.set(name, policy);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mountpoint: PathBuf,
    pub fsname: String,
    pub threads: usize,

    pub minfreespace: u64,
    pub moveonenospc: Option<Policy>,
    pub category_search: Policy,
    pub category_action: Policy,
    pub category_create: Policy,
    pub funcs: Funcs,

    pub inodecalc: InodeCalc,
    pub readdir: ReaddirMode,
    pub statfs: StatfsMode,
    pub statfs_ignore: StatfsIgnore,
    pub xattr: XattrMode,
    pub link_exdev: LinkExdev,
    pub rename_exdev: RenameExdev,
    pub follow_symlinks: FollowSymlinks,
    pub flushonclose: FlushOnClose,
    pub nfsopenhack: NfsOpenHack,
    pub passthrough: PassthroughMode,
    pub symlinkify: bool,
    pub symlinkify_timeout: u64,
    pub dropcacheonclose: bool,

    pub cache_files: CacheFiles,
    pub cache_attr: u64,
    pub cache_entry: u64,
    pub cache_negative_entry: u64,
    pub cache_statfs: u64,
    pub cache_readdir: bool,
    pub cache_writeback: bool,
}

impl Default for Config {
    fn default() -> Config {
        let (search, action, create) = (Policy::Ff, Policy::EpAll, Policy::EpMfs);
        Config {
            mountpoint: PathBuf::new(),
            fsname: String::from("poolfs"),
            threads: 0,
            minfreespace: 4 * 1024 * 1024 * 1024,
            moveonenospc: Some(Policy::Pfrd),
            category_search: search,
            category_action: action,
            category_create: create,
            funcs: Funcs::new(search, action, create),
            inodecalc: InodeCalc::default(),
            readdir: ReaddirMode::Seq,
            statfs: StatfsMode::Base,
            statfs_ignore: StatfsIgnore::None,
            xattr: XattrMode::Passthrough,
            link_exdev: LinkExdev::Passthrough,
            rename_exdev: RenameExdev::Passthrough,
            follow_symlinks: FollowSymlinks::Never,
            flushonclose: FlushOnClose::OpenedForWrite,
            nfsopenhack: NfsOpenHack::Off,
            passthrough: PassthroughMode::Off,
            symlinkify: false,
            symlinkify_timeout: 3600,
            dropcacheonclose: false,
            cache_files: CacheFiles::Off,
            cache_attr: 1,
            cache_entry: 1,
            cache_negative_entry: 0,
            cache_statfs: 0,
            cache_readdir: false,
            cache_writeback: false,
        }
    }
}

/// Keys that may only be set at mount time.
const STARTUP_ONLY: [&str; 3] = ["fsname", "threads", "mountpoint"];

impl Config {
    pub fn get(&self, key: &str) -> Result<String, Errno> {
        if let Some(func) = key.strip_prefix("func.") {
            return self
                .funcs
                .get(func)
                .map(|p| p.as_str().to_string())
                .ok_or(Errno::ENODATA);
        }
        let value = match key {
            "mountpoint" => self.mountpoint.display().to_string(),
            "fsname" => self.fsname.clone(),
            "threads" => self.threads.to_string(),
            "minfreespace" => num::humanize(self.minfreespace),
            "moveonenospc" => match self.moveonenospc {
                Some(p) => p.as_str().to_string(),
                None => "false".to_string(),
            },
            "category.search" => self.category_search.as_str().to_string(),
            "category.action" => self.category_action.as_str().to_string(),
            "category.create" => self.category_create.as_str().to_string(),
            "inodecalc" => self.inodecalc.as_str().to_string(),
            "readdir" => self.readdir.to_string(),
            "statfs" => self.statfs.to_string(),
            "statfs-ignore" => self.statfs_ignore.to_string(),
            "xattr" => self.xattr.to_string(),
            "link-exdev" => self.link_exdev.to_string(),
            "rename-exdev" => self.rename_exdev.to_string(),
            "follow-symlinks" => self.follow_symlinks.to_string(),
            "flush-on-close" => self.flushonclose.to_string(),
            "nfsopenhack" => self.nfsopenhack.to_string(),
            "passthrough" => self.passthrough.to_string(),
            "symlinkify" => self.symlinkify.to_string(),
            "symlinkify-timeout" => self.symlinkify_timeout.to_string(),
            "dropcacheonclose" => self.dropcacheonclose.to_string(),
            "cache.files" => self.cache_files.to_string(),
            "cache.attr" => self.cache_attr.to_string(),
            "cache.entry" => self.cache_entry.to_string(),
            "cache.negative_entry" => self.cache_negative_entry.to_string(),
            "cache.statfs" => self.cache_statfs.to_string(),
            "cache.readdir" => self.cache_readdir.to_string(),
            "cache.writeback" => self.cache_writeback.to_string(),
            _ => return Err(Errno::ENODATA),
        };
        Ok(value)
    }

    pub fn set_runtime(&mut self, key: &str, value: &str) -> Result<(), Errno> {
        if STARTUP_ONLY.contains(&key) {
            return Err(Errno::EINVAL);
        }
        self.set(key, value)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Errno> {
        if let Some(func) = key.strip_prefix("func.") {
            return self.funcs.set(func, value.parse()?);
        }
        match key {
            "mountpoint" => self.mountpoint = PathBuf::from(value),
            "fsname" => self.fsname = value.to_string(),
            "threads" => self.threads = value.parse().map_err(|_| Errno::EINVAL)?,
            "minfreespace" => self.minfreespace = num::parse_size(value)?,
            "moveonenospc" => {
                self.moveonenospc = match value {
                    "false" | "0" | "no" => None,
                    "true" | "1" | "yes" => Some(Policy::Mfs),
                    other => Some(other.parse()?),
                }
            }
            "category.search" => {
                self.category_search = value.parse()?;
                self.funcs.set_category(Category::Search, self.category_search);
            }
            "category.action" => {
                self.category_action = value.parse()?;
                self.funcs.set_category(Category::Action, self.category_action);
            }
            "category.create" => {
                self.category_create = value.parse()?;
                self.funcs.set_category(Category::Create, self.category_create);
            }
            "inodecalc" => self.inodecalc = value.parse()?,
            "readdir" => {
                // "cosr" is the legacy spelling of the concurrent mode
                self.readdir = if value == "cosr" {
                    ReaddirMode::Cor
                } else {
                    value.parse()?
                };
            }
            "statfs" => self.statfs = value.parse()?,
            "statfs-ignore" => self.statfs_ignore = value.parse()?,
            "xattr" => self.xattr = value.parse()?,
            "link-exdev" => self.link_exdev = value.parse()?,
            "rename-exdev" => self.rename_exdev = value.parse()?,
            "follow-symlinks" => self.follow_symlinks = value.parse()?,
            "flush-on-close" => self.flushonclose = value.parse()?,
            "nfsopenhack" => self.nfsopenhack = value.parse()?,
            "passthrough" => {
                self.passthrough = value.parse()?;
                if self.passthrough != PassthroughMode::Off {
                    log::warn!(
                        "passthrough={} accepted but inert: no kernel backing-fd support",
                        self.passthrough
                    );
                }
            }
            "symlinkify" => self.symlinkify = parse_bool(value)?,
            "symlinkify-timeout" => self.symlinkify_timeout = parse_u64(value)?,
            "dropcacheonclose" => self.dropcacheonclose = parse_bool(value)?,
            "cache.files" => self.cache_files = value.parse()?,
            "cache.attr" => self.cache_attr = parse_u64(value)?,
            "cache.entry" => self.cache_entry = parse_u64(value)?,
            "cache.negative_entry" => self.cache_negative_entry = parse_u64(value)?,
            "cache.statfs" => self.cache_statfs = parse_u64(value)?,
            "cache.readdir" => self.cache_readdir = parse_bool(value)?,
            "cache.writeback" => self.cache_writeback = parse_bool(value)?,
            _ => return Err(Errno::ENODATA),
        }
        Ok(())
    }

    /// Every key in dump order, `func.*` included.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = [
            "mountpoint",
            "fsname",
            "threads",
            "minfreespace",
            "moveonenospc",
            "category.search",
            "category.action",
            "category.create",
            "inodecalc",
            "readdir",
            "statfs",
            "statfs-ignore",
            "xattr",
            "link-exdev",
            "rename-exdev",
            "follow-symlinks",
            "flush-on-close",
            "nfsopenhack",
            "passthrough",
            "symlinkify",
            "symlinkify-timeout",
            "dropcacheonclose",
            "cache.files",
            "cache.attr",
            "cache.entry",
            "cache.negative_entry",
            "cache.statfs",
            "cache.readdir",
            "cache.writeback",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for func in SEARCH_FUNCS
            .iter()
            .chain(ACTION_FUNCS.iter())
            .chain(CREATE_FUNCS.iter())
        {
            keys.push(format!("func.{func}"));
        }
        keys
    }

    /// Read `key=value` lines from a config file; `#` starts a comment.
    pub fn load_file(&mut self, path: &std::path::Path) -> Result<Vec<(String, String)>, Errno> {
        let text = std::fs::read_to_string(path).map_err(|e| crate::sys::errno_from_io(&e))?;
        let mut passthrough_keys = Vec::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(Errno::EINVAL)?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                // the caller owns branch parsing
                "branches" => passthrough_keys.push((key.to_string(), value.to_string())),
                _ => self.set(key, value)?,
            }
        }
        Ok(passthrough_keys)
    }
}
