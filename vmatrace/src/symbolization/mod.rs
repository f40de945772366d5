//! # Symbol Resolution for User Stacks
//!
//! Converts the raw instruction pointers of `<user stack trace>` dumps into
//! function names, one module (executable or shared object) at a time.
//!
//! ## Address Translation
//!
//! The trace records runtime addresses. What a symbol source needs depends
//! on how the module was linked:
//!
//! ```text
//! shared object / PIE (ET_DYN):   object_addr = ip - vma.start + vma.offset
//! fixed executable   (ET_EXEC):   object_addr = ip
//! ```
//!
//! Fixed executables are expected at `0x400000` (`vma.start - vma.offset`);
//! anything else is logged once per module.
//!
//! ## Sources
//!
//! - **`addr2line_child`**: one `addr2line -f -C -e <module>` child per
//!   module, driven over non-blocking pipes
//! - **`symbolizer`**: in-process DWARF lookup via `addr2line`/`gimli`/`object`
//!
//! Both sit behind [`SymbolSource`]; [`SymbolResolver`] picks one per module,
//! caches answers and marks modules whose source failed as unresolved.
//!
//! ## Limitations
//!
//! - **Requires symbols**: stripped modules resolve to empty names
//! - **No inline chains**: only the innermost function is reported

pub mod addr2line_child;
pub mod elf;
pub mod resolver;
pub mod symbolizer;

pub use addr2line_child::Addr2lineChild;
pub use elf::LoadKind;
pub use resolver::{ResolverKind, ResolverStats, SymbolResolver};
pub use symbolizer::DwarfSymbolizer;

use crate::domain::ResolverError;

/// Something that maps object-relative addresses of one module to function
/// names
pub trait SymbolSource {
    /// Function containing `addr`; empty when unknown.
    ///
    /// # Errors
    /// Any error means the source is unusable from now on.
    fn lookup(&mut self, addr: u64) -> Result<String, ResolverError>;

    /// Release external resources. Called once before the source is dropped.
    fn close(&mut self) {}
}
