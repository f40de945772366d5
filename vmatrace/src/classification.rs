//! VMA classification for distinguishing application memory from shared
//! infrastructure.
//!
//! Forked children and unrelated processes map the same shared libraries and
//! data files. Counting those once per process would drown the signal the
//! analyzer is after, so these pure helpers let callers ignore them.
//!
//! # Classification Strategy
//!
//! 1. **Permissions** - no access at all marks a guard region
//! 2. **Filename patterns** - `.so` objects are shared libraries; a short
//!    list of system data directories holds shared data files
//! 3. **Backing** - anything else is plain file-backed or anonymous memory

use crate::vma::{PermsKey, Vma};

/// Class of a VMA, used for plots and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VmaKind {
    /// Anonymous memory (heap, stacks, private mmap)
    Anon,
    /// Mapped file that is not a shared library
    File,
    /// No-access region placed between other mappings
    Guard,
    /// Shared library text or data
    Libs,
}

impl VmaKind {
    pub const ALL: [VmaKind; 4] = [VmaKind::Anon, VmaKind::File, VmaKind::Guard, VmaKind::Libs];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            VmaKind::Anon => "anon",
            VmaKind::File => "file",
            VmaKind::Guard => "guard",
            VmaKind::Libs => "libs",
        }
    }
}

// =============================================================================
// CLASSIFICATION TABLES
// =============================================================================

/// Directories whose files are shared read-only data (locales, caches, fonts)
const SHARED_DATA_DIRS: &[&str] = &[
    "/usr/share/",
    "/usr/lib/locale/",
    "/usr/lib64/locale/",
    "/usr/lib/x86_64-linux-gnu/gconv/",
    "/var/cache/",
    "/etc/ld.so.cache",
];

/// File names that are shared data wherever they live
const SHARED_DATA_FILES: &[&str] = &["locale-archive", "gconv-modules.cache", "ld.so.cache"];

// =============================================================================
// PREDICATES
// =============================================================================

/// `true` for a shared object (`libc.so.6`, `ld-linux-x86-64.so.2`, `foo.so`).
#[must_use]
pub fn is_shared_lib(perms: PermsKey, filename: &str) -> bool {
    if !perms.file_backed {
        return false;
    }
    let base = basename(filename);
    base.ends_with(".so") || base.contains(".so.")
}

/// `true` for a file in a shared data directory or a well-known shared
/// data file.
#[must_use]
pub fn is_shared_data_file(perms: PermsKey, filename: &str) -> bool {
    if !perms.file_backed {
        return false;
    }
    SHARED_DATA_DIRS.iter().any(|dir| filename.starts_with(dir))
        || SHARED_DATA_FILES.contains(&basename(filename))
}

/// `true` for a region with no access rights.
#[must_use]
pub fn is_guard_region(perms: PermsKey) -> bool {
    !perms.is_readable()
}

/// `true` if the VMA should be left out of per-application counts.
#[must_use]
pub fn ignore_vma(vma: &Vma) -> bool {
    let perms = vma.perms;
    let filename = vma.filename();
    is_guard_region(perms) || is_shared_lib(perms, filename) || is_shared_data_file(perms, filename)
}

/// Classify a VMA into one of the four plot classes.
///
/// Priority: guard, then shared library, then file, then anonymous. Shared
/// data files count as `File`.
#[must_use]
pub fn classify_vma(perms: PermsKey, filename: &str) -> VmaKind {
    if is_guard_region(perms) {
        VmaKind::Guard
    } else if is_shared_lib(perms, filename) {
        VmaKind::Libs
    } else if perms.file_backed {
        VmaKind::File
    } else {
        VmaKind::Anon
    }
}

/// Final path component, or the whole string when there is no `/`.
pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
