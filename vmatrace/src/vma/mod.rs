//! Virtual memory area records and permissions keys

pub mod perms;
pub mod record;

pub use perms::{Access, PermsKey};
pub use record::{Backing, PairOp, Unmap, UnmapOp, Vma, VmaOp};
