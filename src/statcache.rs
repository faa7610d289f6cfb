//! TTL-memoized statvfs per branch.
//!
//! Policies probe free space on every candidate branch; the cache keeps
//! that from turning into a statvfs storm. TTL 0 disables caching.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::statvfs;
use nix::sys::statvfs::FsFlags;
use parking_lot::Mutex;

/// Plain-value snapshot of a statvfs result. Counts are in `frsize`
/// fragments; sizes derived from them are in bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatFs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namemax: u64,
    pub readonly: bool,
}

impl StatFs {
    pub fn spaceavail(&self) -> u64 {
        self.frsize.saturating_mul(self.bavail)
    }

    pub fn spaceused(&self) -> u64 {
        self.frsize.saturating_mul(self.blocks.saturating_sub(self.bavail))
    }
}

impl From<statvfs::Statvfs> for StatFs {
    fn from(st: statvfs::Statvfs) -> StatFs {
        StatFs {
            bsize: st.block_size() as u64,
            frsize: st.fragment_size() as u64,
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            namemax: st.name_max() as u64,
            readonly: st.flags().contains(FsFlags::ST_RDONLY),
        }
    }
}

struct Entry {
    filled: Instant,
    st: StatFs,
}

pub struct StatvfsCache {
    timeout_secs: AtomicU64,
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl StatvfsCache {
    pub fn new(timeout_secs: u64) -> StatvfsCache {
        StatvfsCache {
            timeout_secs: AtomicU64::new(timeout_secs),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> u64 {
        self.timeout_secs.load(Ordering::Relaxed)
    }

    pub fn set_timeout(&self, secs: u64) {
        self.timeout_secs.store(secs, Ordering::Relaxed);
    }

    pub fn statfs(&self, path: &Path) -> Result<StatFs, Errno> {
        let timeout = self.timeout();
        if timeout == 0 {
            return Ok(statvfs::statvfs(path)?.into());
        }

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(path) {
            if entry.filled.elapsed().as_secs() <= timeout {
                return Ok(entry.st);
            }
        }
        let st: StatFs = statvfs::statvfs(path)?.into();
        entries.insert(
            path.to_path_buf(),
            Entry {
                filled: Instant::now(),
                st,
            },
        );
        Ok(st)
    }

    pub fn spaceavail(&self, path: &Path) -> Result<u64, Errno> {
        Ok(self.statfs(path)?.spaceavail())
    }

    pub fn spaceused(&self, path: &Path) -> Result<u64, Errno> {
        Ok(self.statfs(path)?.spaceused())
    }

    pub fn readonly(&self, path: &Path) -> Result<bool, Errno> {
        Ok(self.statfs(path)?.readonly)
    }
}
