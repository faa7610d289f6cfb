use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use clap::crate_version;
use clap::Arg;
use clap::ArgAction;
use clap::Command;
use fuser::MountOption;
use log::error;
use log::LevelFilter;
use nix::errno::Errno;

use poolfs::branch::Branches;
use poolfs::config::Config;
use poolfs::fuse::PoolFs;
use poolfs::pool::Pool;

/// Mount flags that belong to the kernel/fusermount, not to us.
fn fuse_flag(opt: &str) -> Option<MountOption> {
    match opt {
        "allow_other" => Some(MountOption::AllowOther),
        "allow_root" => Some(MountOption::AllowRoot),
        "auto_unmount" => Some(MountOption::AutoUnmount),
        "default_permissions" => Some(MountOption::DefaultPermissions),
        "ro" => Some(MountOption::RO),
        "rw" => Some(MountOption::RW),
        "exec" => Some(MountOption::Exec),
        "noexec" => Some(MountOption::NoExec),
        "suid" => Some(MountOption::Suid),
        "nosuid" => Some(MountOption::NoSuid),
        "dev" => Some(MountOption::Dev),
        "nodev" => Some(MountOption::NoDev),
        "atime" => Some(MountOption::Atime),
        "noatime" => Some(MountOption::NoAtime),
        "dirsync" => Some(MountOption::DirSync),
        "sync" => Some(MountOption::Sync),
        "async" => Some(MountOption::Async),
        _ => None,
    }
}

fn fuse_allow_other_enabled() -> io::Result<bool> {
    let file = File::open("/etc/fuse.conf")?;
    for line in BufReader::new(file).lines() {
        if line?.trim_start().starts_with("user_allow_other") {
            return Ok(true);
        }
    }
    Ok(false)
}

struct Options {
    config: Config,
    branches_spec: String,
    mount_options: Vec<MountOption>,
}

fn parse_options(matches: &clap::ArgMatches) -> Result<Options, String> {
    let mut config = Config::default();
    let mut branches_spec = matches
        .get_one::<String>("branches")
        .cloned()
        .unwrap_or_default();
    let mut mount_options = Vec::new();

    if let Some(path) = matches.get_one::<String>("config") {
        let rest = config
            .load_file(Path::new(path))
            .map_err(|e| format!("config file {path}: {e}"))?;
        for (key, value) in rest {
            if key == "branches" {
                branches_spec = value;
            }
        }
    }

    if let Some(lists) = matches.get_many::<String>("options") {
        for list in lists {
            for opt in list.split(',').filter(|o| !o.is_empty()) {
                if let Some(flag) = fuse_flag(opt) {
                    mount_options.push(flag);
                    continue;
                }
                let (key, value) = opt
                    .split_once('=')
                    .ok_or_else(|| format!("unrecognized option '{opt}'"))?;
                if key == "branches" {
                    branches_spec = value.to_string();
                    continue;
                }
                match config.set(key, value) {
                    Ok(()) => {}
                    // not ours: hand it through to the kernel untouched
                    Err(Errno::ENODATA) => {
                        mount_options.push(MountOption::CUSTOM(opt.to_string()))
                    }
                    Err(e) => return Err(format!("option '{opt}': {e}")),
                }
            }
        }
    }

    if branches_spec.is_empty() {
        return Err("no branches given".to_string());
    }
    Ok(Options {
        config,
        branches_spec,
        mount_options,
    })
}

fn main() {
    let matches = Command::new("poolfs")
        .version(crate_version!())
        .about("Policy-driven union filesystem: many branches, one namespace")
        .arg(
            Arg::new("branches")
                .value_name("BRANCHES")
                .required(true)
                .help("Colon separated branch specs: PATH[=RW|RO|NC[,MINFREE]], globs allowed"),
        )
        .arg(
            Arg::new("mountpoint")
                .value_name("MOUNTPOINT")
                .required(true)
                .help("Where to mount the pool"),
        )
        .arg(
            Arg::new("options")
                .short('o')
                .value_name("OPTIONS")
                .action(ArgAction::Append)
                .help("Comma separated key=value mount options"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Read key=value options from a file before -o"),
        )
        .arg(
            Arg::new("auto-unmount")
                .long("auto-unmount")
                .action(ArgAction::SetTrue)
                .help("Automatically unmount when the process exits"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .get_matches();

    let verbosity = matches.get_count("v");
    let log_level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(log_level)
        .init();

    let mut options = match parse_options(&matches) {
        Ok(options) => options,
        Err(message) => {
            error!("{message}");
            std::process::exit(1);
        }
    };

    let mountpoint = PathBuf::from(matches.get_one::<String>("mountpoint").unwrap());
    let mountpoint = match mountpoint.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            error!("mountpoint {}: {e}", mountpoint.display());
            std::process::exit(1);
        }
    };
    options.config.mountpoint = mountpoint.clone();

    let branches = match Branches::parse(&options.branches_spec) {
        Ok(branches) => branches,
        Err(e) => {
            error!("branches '{}': {e}", options.branches_spec);
            std::process::exit(1);
        }
    };

    let mut mount_options = vec![MountOption::FSName(options.config.fsname.clone())];
    mount_options.append(&mut options.mount_options);
    if matches.get_flag("auto-unmount") {
        mount_options.push(MountOption::AutoUnmount);
    }
    if !mount_options.contains(&MountOption::AllowOther) {
        match fuse_allow_other_enabled() {
            Ok(true) => mount_options.push(MountOption::AllowOther),
            Ok(false) => {}
            Err(_) => {}
        }
    }

    let pool = Arc::new(Pool::new(options.config, branches));
    let fs = PoolFs::new(pool);
    if let Err(e) = fuser::mount2(fs, &mountpoint, &mount_options) {
        // permission denied usually means user_allow_other is missing
        // from /etc/fuse.conf
        error!("{e}");
        if e.kind() == ErrorKind::PermissionDenied {
            std::process::exit(2);
        }
        std::process::exit(1);
    }
}
