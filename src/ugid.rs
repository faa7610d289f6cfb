//! Scoped caller-credential switch.
//!
//! Backing syscalls must run with the requesting process's identity so
//! the backing filesystems enforce their own permissions. On Linux
//! setfsuid/setfsgid are per-thread, so the switch is a cheap RAII
//! guard. Elsewhere only process-wide euid/egid switching exists, so
//! every credential-sensitive section serializes on one lock.

#[cfg(not(target_os = "linux"))]
use parking_lot::Mutex;

#[cfg(target_os = "linux")]
pub struct Guard {
    prev_uid: nix::unistd::Uid,
    prev_gid: nix::unistd::Gid,
}

#[cfg(target_os = "linux")]
impl Guard {
    pub fn new(uid: u32, gid: u32) -> Guard {
        // gid first: once fsuid drops to an unprivileged caller the
        // fsgid switch would no longer be permitted
        let prev_gid = nix::unistd::setfsgid(nix::unistd::Gid::from_raw(gid));
        let prev_uid = nix::unistd::setfsuid(nix::unistd::Uid::from_raw(uid));
        Guard { prev_uid, prev_gid }
    }
}

#[cfg(target_os = "linux")]
impl Drop for Guard {
    fn drop(&mut self) {
        nix::unistd::setfsuid(self.prev_uid);
        nix::unistd::setfsgid(self.prev_gid);
    }
}

#[cfg(not(target_os = "linux"))]
static PROCESS_CREDS: Mutex<()> = Mutex::new(());

#[cfg(not(target_os = "linux"))]
pub struct Guard {
    _lock: parking_lot::MutexGuard<'static, ()>,
    prev_uid: nix::unistd::Uid,
    prev_gid: nix::unistd::Gid,
}

#[cfg(not(target_os = "linux"))]
impl Guard {
    pub fn new(uid: u32, gid: u32) -> Guard {
        let lock = PROCESS_CREDS.lock();
        let prev_uid = nix::unistd::geteuid();
        let prev_gid = nix::unistd::getegid();
        let _ = nix::unistd::setegid(nix::unistd::Gid::from_raw(gid));
        let _ = nix::unistd::seteuid(nix::unistd::Uid::from_raw(uid));
        Guard {
            _lock: lock,
            prev_uid,
            prev_gid,
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Drop for Guard {
    fn drop(&mut self) {
        let _ = nix::unistd::seteuid(self.prev_uid);
        let _ = nix::unistd::setegid(self.prev_gid);
    }
}
