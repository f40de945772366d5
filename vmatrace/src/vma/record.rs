//! VMA records
//!
//! A [`Vma`] is written once when an operation creates it and touched once
//! more when it leaves the live table (its [`Unmap`] record). Records are
//! never removed from a process's history.
//!
//! A record is active from [`Vma::mapped_at`], the moment it entered the
//! live table, until its unmap. Versions of an exec stack VMA that were
//! held out of band and never installed have no `mapped_at` and are never
//! active.

use std::fmt;

use super::perms::PermsKey;
use crate::domain::{Tgid, Timestamp};

/// Operations that replace one VMA with another through an unmap/remap pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PairOp {
    Resize,
    Relocation,
    AccessChange,
    FlagChange,
}

impl PairOp {
    /// Whether the pair may move the VMA to a new start address
    #[must_use]
    pub fn may_move(self) -> bool {
        matches!(self, PairOp::Resize | PairOp::Relocation)
    }
}

/// Operation that created a VMA record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VmaOp {
    Alloc,
    Resize,
    Relocation,
    AccessChange,
    FlagChange,
}

impl VmaOp {
    pub const ALL: [VmaOp; 5] =
        [VmaOp::Alloc, VmaOp::Resize, VmaOp::Relocation, VmaOp::AccessChange, VmaOp::FlagChange];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            VmaOp::Alloc => "alloc",
            VmaOp::Resize => "resize",
            VmaOp::Relocation => "relocation",
            VmaOp::AccessChange => "access_change",
            VmaOp::FlagChange => "flag_change",
        }
    }
}

impl From<PairOp> for VmaOp {
    fn from(op: PairOp) -> Self {
        match op {
            PairOp::Resize => VmaOp::Resize,
            PairOp::Relocation => VmaOp::Relocation,
            PairOp::AccessChange => VmaOp::AccessChange,
            PairOp::FlagChange => VmaOp::FlagChange,
        }
    }
}

impl fmt::Display for VmaOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation that removed a VMA from the live table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnmapOp {
    Free,
    Resize,
    Relocation,
    AccessChange,
    FlagChange,
    /// An exec stack VMA dropped before it was ever installed
    Discarded,
}

impl UnmapOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UnmapOp::Free => "free",
            UnmapOp::Resize => "resize",
            UnmapOp::Relocation => "relocation",
            UnmapOp::AccessChange => "access_change",
            UnmapOp::FlagChange => "flag_change",
            UnmapOp::Discarded => "discarded",
        }
    }
}

impl From<PairOp> for UnmapOp {
    fn from(op: PairOp) -> Self {
        match op {
            PairOp::Resize => UnmapOp::Resize,
            PairOp::Relocation => UnmapOp::Relocation,
            PairOp::AccessChange => UnmapOp::AccessChange,
            PairOp::FlagChange => UnmapOp::FlagChange,
        }
    }
}

impl fmt::Display for UnmapOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When and why a VMA left the live table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unmap {
    pub timestamp: Timestamp,
    pub op: UnmapOp,
}

/// File metadata of a mapping, as printed by the tracer
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Backing {
    pub offset: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    pub filename: String,
}

/// One virtual memory area record: `[start, start + length)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vma {
    pub tgid: Tgid,
    pub start: u64,
    pub length: u64,
    pub perms: PermsKey,
    pub backing: Backing,
    pub op: VmaOp,
    pub timestamp: Timestamp,
    pub creator_module: String,
    pub creator_fn: String,
    pub kernel_fn: String,
    /// Set when the record enters the live table
    pub mapped_at: Option<Timestamp>,
    pub unmap: Option<Unmap>,
}

impl Vma {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.backing.filename
    }

    #[must_use]
    pub fn is_unmapped(&self) -> bool {
        self.unmap.is_some()
    }

    /// Whether the record was ever in the live table
    #[must_use]
    pub fn was_live(&self) -> bool {
        self.mapped_at.is_some()
    }

    /// Mapped at `ts`: live at or before it and not yet unmapped
    #[must_use]
    pub fn is_active_at(&self, ts: Timestamp) -> bool {
        self.mapped_at.is_some_and(|mapped| mapped <= ts) && self.unmap.map_or(true, |u| u.timestamp > ts)
    }

    /// Record the unmap. Returns `false` if the VMA was already unmapped.
    pub fn mark_unmapped(&mut self, timestamp: Timestamp, op: UnmapOp) -> bool {
        if self.unmap.is_some() {
            return false;
        }
        self.unmap = Some(Unmap { timestamp, op });
        true
    }

    /// Fields compared when collapsing copy-on-write duplicates across a group
    #[must_use]
    pub fn dedup_key(&self) -> (u64, u64, PermsKey, &str, u64) {
        (self.start, self.length, self.perms, self.filename(), self.backing.offset)
    }

    /// One line of `/proc/<pid>/maps` text for this VMA
    #[must_use]
    pub fn maps_line(&self) -> String {
        let line = format!(
            "{:08x}-{:08x} {} {:08x} {:02x}:{:02x} {}",
            self.start,
            self.end(),
            self.perms.maps_perms(),
            self.backing.offset,
            self.backing.dev_major,
            self.backing.dev_minor,
            self.backing.inode,
        );
        if self.backing.filename.is_empty() {
            line
        } else {
            // maps pads the pathname to a fixed column
            format!("{line:<73}{}", self.backing.filename)
        }
    }

    /// Tab-separated marshalled form.
    ///
    /// Field order: `tgid start end length perms offset dev inode vma_op
    /// timestamp creator_module creator_fn kernel_fn unmap_timestamp
    /// unmap_op filename`. Empty strings and unset unmap fields are `-`.
    #[must_use]
    pub fn marshal(&self) -> String {
        let dash = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
        let (unmap_ts, unmap_op) = match self.unmap {
            Some(u) => (u.timestamp.to_string(), u.op.to_string()),
            None => ("-".to_string(), "-".to_string()),
        };
        [
            self.tgid.to_string(),
            format!("{:x}", self.start),
            format!("{:x}", self.end()),
            self.length.to_string(),
            self.perms.to_string(),
            format!("{:x}", self.backing.offset),
            format!("{:02x}:{:02x}", self.backing.dev_major, self.backing.dev_minor),
            self.backing.inode.to_string(),
            self.op.to_string(),
            self.timestamp.to_string(),
            dash(&self.creator_module),
            dash(&self.creator_fn),
            dash(&self.kernel_fn),
            unmap_ts,
            unmap_op,
            dash(&self.backing.filename),
        ]
        .join("\t")
    }
}

#[cfg(test)]
pub(crate) fn test_vma(start: u64, length: u64, perms: &str, filename: &str) -> Vma {
    Vma {
        tgid: Tgid(100),
        start,
        length,
        perms: perms.parse().expect("valid key"),
        backing: Backing { filename: filename.to_string(), ..Backing::default() },
        op: VmaOp::Alloc,
        timestamp: Timestamp(1_000),
        creator_module: String::new(),
        creator_fn: String::new(),
        kernel_fn: String::new(),
        mapped_at: None,
        unmap: None,
    }
}
