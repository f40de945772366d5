//! Per-module symbol resolution with caching
//!
//! One symbol source is opened lazily per module file and kept for the whole
//! replay. A module whose source fails once is marked unresolved and never
//! retried; its later lookups answer with an empty name.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, warn};

use super::addr2line_child::Addr2lineChild;
use super::elf::{LoadKind, at_standard_load_address};
use super::symbolizer::DwarfSymbolizer;
use super::SymbolSource;
use crate::domain::ResolverError;
use crate::vma::Vma;

/// Which symbol source to open per module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolverKind {
    /// Long-lived `addr2line` child processes
    #[default]
    Addr2line,
    /// In-process DWARF parsing
    Dwarf,
    /// Do not resolve function names
    Disabled,
}

struct ModuleEntry {
    load_kind: LoadKind,
    source: Option<Box<dyn SymbolSource>>,
    cache: HashMap<u64, String>,
    load_address_checked: bool,
}

impl ModuleEntry {
    fn unresolved() -> Self {
        Self {
            load_kind: LoadKind::Relocatable,
            source: None,
            cache: HashMap::new(),
            load_address_checked: true,
        }
    }
}

/// Lookup counters, reported at the end of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub lookups: u64,
    pub cache_hits: u64,
    pub failed_modules: u64,
}

pub struct SymbolResolver {
    kind: ResolverKind,
    helper: String,
    modules: HashMap<String, ModuleEntry>,
    stats: ResolverStats,
}

impl SymbolResolver {
    #[must_use]
    pub fn new(kind: ResolverKind, helper: impl Into<String>) -> Self {
        Self { kind, helper: helper.into(), modules: HashMap::new(), stats: ResolverStats::default() }
    }

    #[must_use]
    pub fn kind(&self) -> ResolverKind {
        self.kind
    }

    #[must_use]
    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    /// Use `source` for `module` instead of opening one on demand
    pub fn register(&mut self, module: &str, load_kind: LoadKind, source: Box<dyn SymbolSource>) {
        self.modules.insert(
            module.to_string(),
            ModuleEntry {
                load_kind,
                source: Some(source),
                cache: HashMap::new(),
                load_address_checked: false,
            },
        );
    }

    /// Function containing `ip`, which lies in `vma`.
    ///
    /// An empty string means the name is unknown.
    ///
    /// # Errors
    /// Returns the error that made the module's source fail. Each module
    /// reports at most one error; afterwards it resolves to empty names.
    pub fn resolve(&mut self, vma: &Vma, ip: u64) -> Result<String, ResolverError> {
        let module = vma.filename();
        if self.kind == ResolverKind::Disabled || module.is_empty() {
            return Ok(String::new());
        }

        if !self.modules.contains_key(module) {
            match self.open(module) {
                Ok(entry) => {
                    self.modules.insert(module.to_string(), entry);
                }
                Err(e) => {
                    self.stats.failed_modules += 1;
                    self.modules.insert(module.to_string(), ModuleEntry::unresolved());
                    return Err(e);
                }
            }
        }
        let Some(entry) = self.modules.get_mut(module) else {
            return Ok(String::new());
        };

        if entry.load_kind == LoadKind::Fixed && !entry.load_address_checked {
            entry.load_address_checked = true;
            if !at_standard_load_address(vma) {
                warn!(
                    "fixed-address module {module} mapped at 0x{:x} with offset 0x{:x}",
                    vma.start, vma.backing.offset
                );
            }
        }

        let addr = entry.load_kind.object_address(ip, vma);
        self.stats.lookups += 1;
        if let Some(function) = entry.cache.get(&addr) {
            self.stats.cache_hits += 1;
            return Ok(function.clone());
        }

        let Some(source) = entry.source.as_mut() else {
            return Ok(String::new());
        };
        match source.lookup(addr) {
            Ok(function) => {
                entry.cache.insert(addr, function.clone());
                Ok(function)
            }
            Err(e) => {
                source.close();
                entry.source = None;
                self.stats.failed_modules += 1;
                Err(e)
            }
        }
    }

    fn open(&self, module: &str) -> Result<ModuleEntry, ResolverError> {
        let load_kind = LoadKind::detect(Path::new(module))?;
        let source: Box<dyn SymbolSource> = match self.kind {
            ResolverKind::Addr2line => Box::new(Addr2lineChild::spawn(&self.helper, module)?),
            ResolverKind::Dwarf => Box::new(DwarfSymbolizer::new(module)?),
            ResolverKind::Disabled => return Ok(ModuleEntry::unresolved()),
        };
        debug!("opened symbol source for {module} ({load_kind:?})");
        Ok(ModuleEntry { load_kind, source: Some(source), cache: HashMap::new(), load_address_checked: false })
    }

    /// Close every source; further lookups answer with empty names
    pub fn close(&mut self) {
        for entry in self.modules.values_mut() {
            if let Some(mut source) = entry.source.take() {
                source.close();
            }
        }
    }
}

impl Drop for SymbolResolver {
    fn drop(&mut self) {
        self.close();
    }
}
