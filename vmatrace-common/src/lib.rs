//! # Shared Trace Vocabulary (Kernel Patches ↔ Analyzer)
//!
//! Names and constants emitted by the VMA tracing kernel patches and consumed
//! by the analyzer. Kept in a `no_std` crate so the same vocabulary can be
//! reused by any tool that generates or post-processes these traces.
//!
//! ## Event Families
//!
//! 1. **`mmap_vma_*`** - VMA lifecycle (alloc, free, unmap/remap pairs)
//! 2. **`pte_*`** - Page-table updates (only `pte_mapped` carries semantics)
//! 3. **`sched_switch`** - Scheduler quanta
//! 4. **`tracing_mark_write`** - User checkpoints
//! 5. **`rss_stat`** - Resident set counters
//!
//! ## Key Items
//!
//! - [`mmap`] - `mmap_vma_*` event names
//! - [`kernel_fn`] - Kernel function labels carried in the `[...]` payload field
//! - [`RssType`] - RSS counter indices as reported by `rss_stat`

#![no_std]

// ============================================================================
// Event Names
// ============================================================================

/// `mmap_vma_*` event names.
pub mod mmap {
    /// Common prefix of every VMA event
    pub const PREFIX: &str = "mmap_vma_";

    /// New VMA
    pub const ALLOC: &str = "mmap_vma_alloc";

    /// New VMA copied from the parent during `fork()`
    pub const ALLOC_DUP_MMAP: &str = "mmap_vma_alloc_dup_mmap";

    /// VMA removed
    pub const FREE: &str = "mmap_vma_free";

    pub const RESIZE_UNMAP: &str = "mmap_vma_resize_unmap";
    pub const RESIZE_REMAP: &str = "mmap_vma_resize_remap";
    pub const RELOC_UNMAP: &str = "mmap_vma_reloc_unmap";
    pub const RELOC_REMAP: &str = "mmap_vma_reloc_remap";
    pub const ACCESS_UNMAP: &str = "mmap_vma_access_unmap";
    pub const ACCESS_REMAP: &str = "mmap_vma_access_remap";
    pub const FLAGS_UNMAP: &str = "mmap_vma_flags_unmap";
    pub const FLAGS_REMAP: &str = "mmap_vma_flags_remap";

    /// Stop applying VMA effects for the emitting process
    pub const DISABLE_SIM: &str = "mmap_disable_sim";

    /// Resume applying VMA effects for the emitting process
    pub const ENABLE_SIM: &str = "mmap_enable_sim";
}

/// Page-table event names.
pub mod pte {
    /// Common prefix of every page-table event
    pub const PREFIX: &str = "pte_";

    /// A PTE now points at a physical page
    pub const MAPPED: &str = "pte_mapped";
}

/// Scheduler context switch
pub const SCHED_SWITCH: &str = "sched_switch";

/// User-space marker written through `trace_marker`
pub const TRACING_MARK_WRITE: &str = "tracing_mark_write";

/// Resident set counter update
pub const RSS_STAT: &str = "rss_stat";

// ============================================================================
// Kernel Function Labels
// ============================================================================

/// Kernel functions reported in the `[kernel_fn]` field of `mmap_vma_*`
/// payloads that the analyzer gives special meaning to.
pub mod kernel_fn {
    /// VMA copied into a child during `fork()`
    pub const DUP_MMAP: &str = "dup_mmap";

    /// Address space torn down (process exit or `execve` replacing the mm)
    pub const EXIT_MMAP: &str = "exit_mmap";

    /// Initial stack VMA of a new program image
    pub const BPRM_MM_INIT: &str = "__bprm_mm_init";

    /// Stack growth
    pub const EXPAND_DOWNWARDS: &str = "expand_downwards";
}

// ============================================================================
// Resident Set Counters
// ============================================================================

/// RSS counter index, matching the kernel's `MM_*` counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RssType {
    File = 0,
    Anon = 1,
    Swap = 2,
    Shmem = 3,
}

/// Number of RSS counters tracked per process
pub const RSS_TYPE_COUNT: usize = 4;

impl RssType {
    /// All counters in index order
    pub const ALL: [RssType; RSS_TYPE_COUNT] =
        [RssType::File, RssType::Anon, RssType::Swap, RssType::Shmem];

    /// Parse the `type=` field of an `rss_stat` payload
    #[must_use]
    pub fn from_kernel_name(name: &str) -> Option<Self> {
        match name {
            "MM_FILEPAGES" => Some(RssType::File),
            "MM_ANONPAGES" => Some(RssType::Anon),
            "MM_SWAPENTS" => Some(RssType::Swap),
            "MM_SHMEMPAGES" => Some(RssType::Shmem),
            _ => None,
        }
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            RssType::File => "file",
            RssType::Anon => "anon",
            RssType::Swap => "swap",
            RssType::Shmem => "shmem",
        }
    }
}

// ============================================================================
// Architecture Constants (x86_64)
// ============================================================================

/// Page size used to convert `rss_stat` byte counts to pages
pub const PAGE_SIZE: u64 = 4096;

/// Load address of non-PIE executables
///
/// Fixed-load executables are symbolized with absolute addresses; the
/// analyzer sanity-checks that their first mapping sits here.
pub const STANDARD_LOAD_ADDRESS: u64 = 0x40_0000;
