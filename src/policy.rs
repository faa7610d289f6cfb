//! Policy engine: named algorithms that pick branches.
//!
//! Every FUSE operation belongs to one category. Search policies return
//! exactly one branch, action policies one or more (the operation is
//! applied to each), create policies exactly one. Candidate gathering
//! applies the category's eligibility predicate and accumulates the most
//! specific error for the no-candidate case; selection over gathered
//! candidates is pure.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::str::FromStr;

use nix::errno::Errno;
use rand::Rng;

use crate::branch::Branches;
use crate::statcache::StatvfsCache;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Category {
    Search,
    Action,
    Create,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Policy {
    All,
    EpAll,
    Ff,
    EpFf,
    Lfs,
    EpLfs,
    Lus,
    EpLus,
    Mfs,
    EpMfs,
    Newest,
    EpNewest,
    Rand,
    EpRand,
    Pfrd,
    EpPfrd,
    Erofs,
}

impl FromStr for Policy {
    type Err = Errno;

    fn from_str(s: &str) -> Result<Self, Errno> {
        match s {
            "all" => Ok(Policy::All),
            "epall" => Ok(Policy::EpAll),
            "ff" => Ok(Policy::Ff),
            "epff" => Ok(Policy::EpFf),
            "lfs" => Ok(Policy::Lfs),
            "eplfs" => Ok(Policy::EpLfs),
            "lus" => Ok(Policy::Lus),
            "eplus" => Ok(Policy::EpLus),
            "mfs" => Ok(Policy::Mfs),
            "epmfs" => Ok(Policy::EpMfs),
            "newest" => Ok(Policy::Newest),
            "epnewest" => Ok(Policy::EpNewest),
            "rand" => Ok(Policy::Rand),
            "eprand" => Ok(Policy::EpRand),
            "pfrd" => Ok(Policy::Pfrd),
            "eppfrd" => Ok(Policy::EpPfrd),
            "erofs" => Ok(Policy::Erofs),
            _ => Err(Errno::EINVAL),
        }
    }
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::All => "all",
            Policy::EpAll => "epall",
            Policy::Ff => "ff",
            Policy::EpFf => "epff",
            Policy::Lfs => "lfs",
            Policy::EpLfs => "eplfs",
            Policy::Lus => "lus",
            Policy::EpLus => "eplus",
            Policy::Mfs => "mfs",
            Policy::EpMfs => "epmfs",
            Policy::Newest => "newest",
            Policy::EpNewest => "epnewest",
            Policy::Rand => "rand",
            Policy::EpRand => "eprand",
            Policy::Pfrd => "pfrd",
            Policy::EpPfrd => "eppfrd",
            Policy::Erofs => "erofs",
        }
    }

    /// ep-policies restrict create candidates to branches where the
    /// parent path already exists ("path preserving").
    pub fn path_preserving(&self) -> bool {
        matches!(
            self,
            Policy::EpAll
                | Policy::EpFf
                | Policy::EpLfs
                | Policy::EpLus
                | Policy::EpMfs
                | Policy::EpNewest
                | Policy::EpRand
                | Policy::EpPfrd
        )
    }

    /// Newest variants only make sense against an existing path.
    fn wants_existing(&self) -> bool {
        matches!(self, Policy::Newest | Policy::EpNewest)
    }
}

/// Most-specific-error accumulator for the no-candidate case.
/// Preference order: EROFS, ENOSPC, ENOENT, first other failure.
#[derive(Debug, Default)]
struct PolicyError {
    rofs: bool,
    nospc: bool,
    noent: bool,
    other: Option<Errno>,
}

impl PolicyError {
    fn record(&mut self, err: Errno) {
        match err {
            Errno::EROFS => self.rofs = true,
            Errno::ENOSPC | Errno::EDQUOT => self.nospc = true,
            Errno::ENOENT => self.noent = true,
            other => {
                if self.other.is_none() {
                    self.other = Some(other);
                }
            }
        }
    }

    fn errno(&self) -> Errno {
        if self.rofs {
            Errno::EROFS
        } else if self.nospc {
            Errno::ENOSPC
        } else if self.noent {
            Errno::ENOENT
        } else {
            self.other.unwrap_or(Errno::ENOENT)
        }
    }
}

/// A branch that passed the eligibility predicate, with the numbers the
/// selectors rank by.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    idx: usize,
    spaceavail: u64,
    spaceused: u64,
    /// (sec, nsec) mtime of the path on that branch; (i64::MIN, 0) when
    /// the path does not exist there.
    mtime: (i64, i64),
    exists: bool,
}

pub struct PolicyCtx<'a> {
    pub branches: &'a Branches,
    pub cache: &'a StatvfsCache,
    pub minfreespace: u64,
}

impl<'a> PolicyCtx<'a> {
    fn candidate(&self, idx: usize, rel: &Path) -> Candidate {
        let branch = &self.branches.list[idx];
        let st = self.cache.statfs(&branch.path).ok();
        let meta = crate::sys::lstat(&branch.full_path(rel)).ok();
        Candidate {
            idx,
            spaceavail: st.map(|s| s.spaceavail()).unwrap_or(0),
            spaceused: st.map(|s| s.spaceused()).unwrap_or(0),
            mtime: meta
                .as_ref()
                .map(|m| (m.mtime(), m.mtime_nsec()))
                .unwrap_or((i64::MIN, 0)),
            exists: meta.is_some(),
        }
    }
}

/// Pure selector over gathered candidates. Tie-break is candidate order,
/// which is branch order.
fn select(policy: Policy, candidates: &[Candidate]) -> Result<usize, Errno> {
    if candidates.is_empty() {
        return Err(Errno::ENOENT);
    }
    let best = match policy {
        Policy::Erofs => return Err(Errno::EROFS),
        Policy::All | Policy::EpAll | Policy::Ff | Policy::EpFf => candidates[0],
        Policy::Mfs | Policy::EpMfs => {
            *candidates
                .iter()
                .max_by_key(|c| (c.spaceavail, std::cmp::Reverse(c.idx)))
                .unwrap()
        }
        Policy::Lfs | Policy::EpLfs => {
            *candidates
                .iter()
                .min_by_key(|c| (c.spaceavail, c.idx))
                .unwrap()
        }
        Policy::Lus | Policy::EpLus => {
            *candidates
                .iter()
                .min_by_key(|c| (c.spaceused, c.idx))
                .unwrap()
        }
        Policy::Newest | Policy::EpNewest => {
            *candidates
                .iter()
                .max_by_key(|c| (c.mtime, std::cmp::Reverse(c.idx)))
                .unwrap()
        }
        Policy::Rand | Policy::EpRand => {
            candidates[rand::thread_rng().gen_range(0..candidates.len())]
        }
        Policy::Pfrd | Policy::EpPfrd => {
            let total: u64 = candidates.iter().map(|c| c.spaceavail).sum();
            if total == 0 {
                candidates[rand::thread_rng().gen_range(0..candidates.len())]
            } else {
                let mut roll = rand::thread_rng().gen_range(0..total);
                let mut pick = candidates[0];
                for c in candidates {
                    if roll < c.spaceavail {
                        pick = *c;
                        break;
                    }
                    roll -= c.spaceavail;
                }
                pick
            }
        }
    };
    Ok(best.idx)
}

/// Search: the one branch holding the path.
pub fn search(ctx: &PolicyCtx<'_>, policy: Policy, rel: &Path) -> Result<usize, Errno> {
    if policy == Policy::Erofs {
        return Err(Errno::EROFS);
    }
    let mut err = PolicyError::default();
    let mut candidates = Vec::new();
    for (idx, branch) in ctx.branches.iter().enumerate() {
        if !branch.enabled {
            continue;
        }
        match crate::sys::lstat(&branch.full_path(rel)) {
            Ok(_) => candidates.push(ctx.candidate(idx, rel)),
            Err(e) => err.record(e),
        }
    }
    if candidates.is_empty() {
        return Err(err.errno());
    }
    select(policy, &candidates)
}

/// Action: every branch the operation should be applied to. `all`
/// policies return all candidates; anything else selects one.
pub fn action(ctx: &PolicyCtx<'_>, policy: Policy, rel: &Path) -> Result<Vec<usize>, Errno> {
    if policy == Policy::Erofs {
        return Err(Errno::EROFS);
    }
    let mut err = PolicyError::default();
    let mut candidates = Vec::new();
    for (idx, branch) in ctx.branches.iter().enumerate() {
        if !branch.enabled {
            continue;
        }
        match crate::sys::lstat(&branch.full_path(rel)) {
            Ok(_) => {}
            Err(e) => {
                err.record(e);
                continue;
            }
        }
        if branch.ro() {
            err.record(Errno::EROFS);
            continue;
        }
        match ctx.cache.readonly(&branch.path) {
            Ok(true) => {
                err.record(Errno::EROFS);
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                err.record(e);
                continue;
            }
        }
        candidates.push(ctx.candidate(idx, rel));
    }
    if candidates.is_empty() {
        return Err(err.errno());
    }
    if matches!(policy, Policy::All | Policy::EpAll) {
        return Ok(candidates.iter().map(|c| c.idx).collect());
    }
    Ok(vec![select(policy, &candidates)?])
}

/// Create: the one branch a new entry lands on. `exclude` supports the
/// single ENOSPC retry and the spill path.
pub fn create(
    ctx: &PolicyCtx<'_>,
    policy: Policy,
    rel: &Path,
    exclude: &[usize],
) -> Result<usize, Errno> {
    if policy == Policy::Erofs {
        return Err(Errno::EROFS);
    }
    let parent = rel.parent();
    let mut err = PolicyError::default();
    let mut candidates = Vec::new();
    for (idx, branch) in ctx.branches.iter().enumerate() {
        if !branch.enabled || exclude.contains(&idx) {
            continue;
        }
        if branch.ro_or_nc() {
            err.record(Errno::EROFS);
            continue;
        }
        let st = match ctx.cache.statfs(&branch.path) {
            Ok(st) => st,
            Err(e) => {
                err.record(e);
                continue;
            }
        };
        if st.readonly {
            err.record(Errno::EROFS);
            continue;
        }
        if st.spaceavail() < branch.minfree(ctx.minfreespace) {
            err.record(Errno::ENOSPC);
            continue;
        }
        if policy.path_preserving() {
            if let Some(parent) = parent {
                if crate::sys::lstat(&branch.full_path(parent)).is_err() {
                    err.record(Errno::ENOENT);
                    continue;
                }
            }
        }
        let candidate = ctx.candidate(idx, rel);
        if policy.wants_existing() && !candidate.exists {
            err.record(Errno::ENOENT);
            continue;
        }
        candidates.push(candidate);
    }
    if candidates.is_empty() {
        return Err(err.errno());
    }
    select(policy, &candidates)
}
