// String formatting intentionally uses format! for clarity
#![allow(clippy::format_push_string)]

use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use rustc_demangle::demangle;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use super::SymbolSource;
use crate::domain::ResolverError;

/// In-process DWARF symbol source for one module
///
/// Includes a cache to avoid re-resolving the same addresses repeatedly,
/// which matters because the same return addresses recur on every stack.
pub struct DwarfSymbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    /// Cache of resolved frames by address
    cache: HashMap<u64, ResolvedFrame>,
}

impl DwarfSymbolizer {
    /// Create a new symbolizer for the given object
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if its DWARF
    /// debug info cannot be loaded
    pub fn new<P: AsRef<Path>>(object_path: P) -> Result<Self, ResolverError> {
        let module = object_path.as_ref().display().to_string();
        let dwarf_err = |error: String| ResolverError::Dwarf { module: module.clone(), error };

        let object_data = fs::read(object_path.as_ref())?;
        let obj_file = object::File::parse(&*object_data)
            .map_err(|_| ResolverError::NotElf(module.clone()))?;

        // Load DWARF debug info
        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section).map_err(|e| dwarf_err(e.to_string()))?;
        let ctx = Context::from_dwarf(dwarf).map_err(|e| dwarf_err(e.to_string()))?;

        Ok(Self { ctx, cache: HashMap::new() })
    }

    /// Resolve an object-relative address to its (possibly inlined) frames
    ///
    /// Uses a cache to avoid re-resolving the same address multiple times.
    pub fn resolve(&mut self, addr: u64) -> ResolvedFrame {
        if let Some(cached) = self.cache.get(&addr) {
            return cached.clone();
        }

        let mut result = Vec::new();

        if let Ok(mut frame_iter) = self.ctx.find_frames(addr).skip_all_loads() {
            while let Ok(Some(frame)) = frame_iter.next() {
                let function = frame
                    .function
                    .and_then(|f| f.demangle().ok().map(|s| s.to_string()))
                    .unwrap_or_default();

                let location = frame.location.map(|loc| SourceLocation {
                    file: loc.file.map(std::string::ToString::to_string),
                    line: loc.line,
                });

                result.push(InlinedFrame { function, location });
            }
        }

        let resolved = ResolvedFrame { addr, frames: result };
        self.cache.insert(addr, resolved.clone());
        resolved
    }

    /// Demangle a Rust symbol name
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

impl SymbolSource for DwarfSymbolizer {
    /// Innermost function at `addr`, matching what `addr2line -f` prints
    fn lookup(&mut self, addr: u64) -> Result<String, ResolverError> {
        let resolved = self.resolve(addr);
        log::trace!("{}", resolved.format());
        Ok(resolved
            .frames
            .first()
            .map(|f| Self::demangle_symbol(&f.function))
            .unwrap_or_default())
    }
}

/// A resolved address (may contain multiple inlined frames, innermost first)
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub addr: u64,
    pub frames: Vec<InlinedFrame>,
}

/// An inlined frame within a resolved frame
#[derive(Debug, Clone)]
pub struct InlinedFrame {
    pub function: String,
    pub location: Option<SourceLocation>,
}

/// Source code location
#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl ResolvedFrame {
    /// `function at file:line` lines, one per inlined frame
    #[must_use]
    pub fn format(&self) -> String {
        let mut output = String::new();

        for (idx, inlined) in self.frames.iter().enumerate() {
            let name = if inlined.function.is_empty() { "??" } else { &inlined.function };
            output.push_str(&format!("0x{:x} {name}", self.addr));

            if let Some(SourceLocation { file: Some(file), line }) = &inlined.location {
                output.push_str(&format!(" at {file}"));
                if let Some(line) = line {
                    output.push_str(&format!(":{line}"));
                }
            }

            if idx < self.frames.len() - 1 {
                output.push('\n');
            }
        }

        output
    }
}
