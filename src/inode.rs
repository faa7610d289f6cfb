//! Synthesized inode numbers.
//!
//! Directories should surface the same inode regardless of which branch
//! produced them (tools walking the tree expect that), while files need
//! per-branch-distinct inodes to avoid collisions. The hybrid algorithm
//! encodes exactly that split.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::str::FromStr;

use nix::errno::Errno;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InodeCalc {
    Passthrough,
    PathHash,
    PathHash32,
    DevinoHash,
    DevinoHash32,
    #[default]
    HybridHash,
    HybridHash32,
}

impl FromStr for InodeCalc {
    type Err = Errno;

    fn from_str(s: &str) -> Result<Self, Errno> {
        match s {
            "passthrough" => Ok(InodeCalc::Passthrough),
            "path-hash" => Ok(InodeCalc::PathHash),
            "path-hash32" => Ok(InodeCalc::PathHash32),
            "devino-hash" => Ok(InodeCalc::DevinoHash),
            "devino-hash32" => Ok(InodeCalc::DevinoHash32),
            "hybrid-hash" => Ok(InodeCalc::HybridHash),
            "hybrid-hash32" => Ok(InodeCalc::HybridHash32),
            _ => Err(Errno::EINVAL),
        }
    }
}

impl InodeCalc {
    pub fn as_str(&self) -> &'static str {
        match self {
            InodeCalc::Passthrough => "passthrough",
            InodeCalc::PathHash => "path-hash",
            InodeCalc::PathHash32 => "path-hash32",
            InodeCalc::DevinoHash => "devino-hash",
            InodeCalc::DevinoHash32 => "devino-hash32",
            InodeCalc::HybridHash => "hybrid-hash",
            InodeCalc::HybridHash32 => "hybrid-hash32",
        }
    }
}

const SEED: u64 = 0xe703_7ed1_a0b4_28db;
const P0: u64 = 0xa076_1d64_78bd_642f;
const P1: u64 = 0x8bb8_4b93_962e_acc9;

#[inline]
fn mix(a: u64, b: u64) -> u64 {
    let r = (a as u128).wrapping_mul(b as u128);
    (r as u64) ^ ((r >> 64) as u64)
}

/// wyhash-style multiply-fold over 8-byte words, fixed seed.
fn hash64(bytes: &[u8]) -> u64 {
    let mut h = SEED ^ mix(bytes.len() as u64, P0);
    let mut chunks = bytes.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        h = mix(h ^ u64::from_le_bytes(word), P1);
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let mut word = [0u8; 8];
        word[..rest.len()].copy_from_slice(rest);
        h = mix(h ^ u64::from_le_bytes(word), P1);
    }
    mix(h, P0)
}

fn devino_hash(dev: u64, ino: u64) -> u64 {
    mix(mix(SEED ^ dev, P0) ^ ino, P1)
}

fn fold32(h: u64) -> u64 {
    ((h >> 32) ^ h) & 0xffff_ffff
}

/// Pure: identical inputs yield identical inodes across restarts.
pub fn calc(algo: InodeCalc, fusepath: &Path, dev: u64, ino: u64, is_dir: bool) -> u64 {
    let path_hash = || hash64(fusepath.as_os_str().as_bytes());
    match algo {
        InodeCalc::Passthrough => ino,
        InodeCalc::PathHash => path_hash(),
        InodeCalc::PathHash32 => fold32(path_hash()),
        InodeCalc::DevinoHash => devino_hash(dev, ino),
        InodeCalc::DevinoHash32 => fold32(devino_hash(dev, ino)),
        InodeCalc::HybridHash => {
            if is_dir {
                path_hash()
            } else {
                devino_hash(dev, ino)
            }
        }
        InodeCalc::HybridHash32 => {
            if is_dir {
                fold32(path_hash())
            } else {
                fold32(devino_hash(dev, ino))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let p = Path::new("/a/b/c");
        for algo in [
            InodeCalc::Passthrough,
            InodeCalc::PathHash,
            InodeCalc::PathHash32,
            InodeCalc::DevinoHash,
            InodeCalc::DevinoHash32,
            InodeCalc::HybridHash,
            InodeCalc::HybridHash32,
        ] {
            assert_eq!(
                calc(algo, p, 7, 42, false),
                calc(algo, p, 7, 42, false),
                "{algo:?}"
            );
        }
    }

    #[test]
    fn passthrough_is_identity() {
        assert_eq!(calc(InodeCalc::Passthrough, Path::new("/x"), 1, 99, true), 99);
    }

    #[test]
    fn path_hash_ignores_backing_identity() {
        let p = Path::new("/same/path");
        assert_eq!(
            calc(InodeCalc::PathHash, p, 1, 10, true),
            calc(InodeCalc::PathHash, p, 2, 20, true)
        );
    }

    #[test]
    fn devino_hash_separates_branches() {
        let p = Path::new("/same/path");
        assert_ne!(
            calc(InodeCalc::DevinoHash, p, 1, 10, false),
            calc(InodeCalc::DevinoHash, p, 2, 10, false)
        );
    }

    #[test]
    fn hybrid_splits_dirs_and_files() {
        let p = Path::new("/d");
        // dirs hash by path: stable across (dev,ino)
        assert_eq!(
            calc(InodeCalc::HybridHash, p, 1, 10, true),
            calc(InodeCalc::HybridHash, p, 9, 77, true)
        );
        // files hash by (dev,ino): distinct across branches
        assert_ne!(
            calc(InodeCalc::HybridHash, p, 1, 10, false),
            calc(InodeCalc::HybridHash, p, 9, 77, false)
        );
    }

    #[test]
    fn thirty_two_bit_variants_fit() {
        let p = Path::new("/some/longer/path/name.bin");
        for algo in [
            InodeCalc::PathHash32,
            InodeCalc::DevinoHash32,
            InodeCalc::HybridHash32,
        ] {
            assert!(calc(algo, p, 3, 9, false) <= u32::MAX as u64);
            assert!(calc(algo, p, 3, 9, true) <= u32::MAX as u64);
        }
    }

    #[test]
    fn names_roundtrip() {
        for name in [
            "passthrough",
            "path-hash",
            "path-hash32",
            "devino-hash",
            "devino-hash32",
            "hybrid-hash",
            "hybrid-hash32",
        ] {
            assert_eq!(name.parse::<InodeCalc>().unwrap().as_str(), name);
        }
        assert!("md5".parse::<InodeCalc>().is_err());
    }
}
