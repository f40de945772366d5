//! Load-kind detection for ELF objects
//!
//! Shared objects and PIE executables (`ET_DYN`) are relocatable: the
//! resolver is asked about file-relative addresses. Non-PIE executables
//! (`ET_EXEC`) are linked at a fixed address and resolved verbatim.

use std::fs;
use std::path::Path;

use object::{Object, ObjectKind};
use vmatrace_common::STANDARD_LOAD_ADDRESS;

use crate::domain::ResolverError;
use crate::vma::Vma;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Relocatable,
    Fixed,
}

impl LoadKind {
    /// Inspect the ELF header of `path`.
    ///
    /// # Errors
    /// `ResolverError::Io` if the file cannot be read, `NotElf` if it does not
    /// parse as an executable or shared object.
    pub fn detect(path: &Path) -> Result<Self, ResolverError> {
        let data = fs::read(path)?;
        let file = object::File::parse(&*data)
            .map_err(|_| ResolverError::NotElf(path.display().to_string()))?;
        match file.kind() {
            ObjectKind::Dynamic | ObjectKind::Relocatable => Ok(LoadKind::Relocatable),
            ObjectKind::Executable => Ok(LoadKind::Fixed),
            _ => Err(ResolverError::NotElf(path.display().to_string())),
        }
    }

    /// Address to submit to a symbol source for `ip` inside `vma`
    #[must_use]
    pub fn object_address(self, ip: u64, vma: &Vma) -> u64 {
        match self {
            LoadKind::Relocatable => ip.wrapping_sub(vma.start).wrapping_add(vma.backing.offset),
            LoadKind::Fixed => ip,
        }
    }
}

/// Whether a fixed-load VMA sits where a non-PIE executable is expected
#[must_use]
pub fn at_standard_load_address(vma: &Vma) -> bool {
    vma.start.wrapping_sub(vma.backing.offset) == STANDARD_LOAD_ADDRESS
}
