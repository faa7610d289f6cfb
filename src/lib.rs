//! poolfs: a policy-driven union filesystem.
//!
//! N backing directories ("branches") are presented as a single
//! namespace. Every branch is a peer; per-operation policies decide
//! which branch(es) service a request, and files always live whole on
//! exactly one branch. The FUSE transport is provided by the `fuser`
//! crate; everything union-specific lives here.

pub mod branch;
pub mod clonepath;
pub mod config;
pub mod copydata;
pub mod ctl;
pub mod fuse;
pub mod inode;
pub mod nodes;
pub mod num;
pub mod policy;
pub mod pool;
pub mod readdir;
pub mod spill;
pub mod statcache;
pub mod sys;
pub mod ugid;

pub use crate::branch::Branch;
pub use crate::branch::BranchMode;
pub use crate::branch::BranchRegistry;
pub use crate::branch::Branches;
pub use crate::config::Config;
pub use crate::fuse::PoolFs;
pub use crate::policy::Category;
pub use crate::policy::Policy;
pub use crate::pool::Pool;
