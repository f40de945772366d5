//! `/proc/<pid>/maps` text
//!
//! Checkpoint and point-in-time snapshots are written in the kernel's maps
//! format so they can be compared against a live system with ordinary
//! tools. [`parse_maps_line`] reads them back.

use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;

use crate::domain::ParseError;
use crate::trace::line::{builtin, parse_dec};
use crate::vma::Vma;

const MAPS_PATTERN: &str =
    r"^\s*([0-9a-f]+)-([0-9a-f]+)\s+([r-][w-][x-][ps])\s+([0-9a-f]+)\s+([0-9a-f]+):([0-9a-f]+)\s+(\d+)\s*(.*)$";

static MAPS_LINE: OnceLock<Regex> = OnceLock::new();

/// One parsed maps line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsEntry {
    pub start: u64,
    pub end: u64,
    /// Four-character kernel form, e.g. `r-xp`
    pub perms: String,
    pub offset: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    pub pathname: String,
}

/// Maps text for `vmas`, one line each, in the order given
#[must_use]
pub fn maps_text<'a>(vmas: impl IntoIterator<Item = &'a Vma>) -> String {
    let mut text = String::new();
    for vma in vmas {
        let _ = writeln!(text, "{}", vma.maps_line());
    }
    text
}

/// Parse one maps line.
///
/// # Errors
/// Returns `ParseError::BadPayload` when the line is not in maps format.
pub fn parse_maps_line(line: &str) -> Result<MapsEntry, ParseError> {
    let bad = || ParseError::BadPayload { family: "maps", payload: line.to_string() };
    let caps = MAPS_LINE.get_or_init(|| builtin(MAPS_PATTERN)).captures(line).ok_or_else(bad)?;
    let hex64 = |i: usize| u64::from_str_radix(&caps[i], 16).map_err(|_| bad());
    let hex32 = |i: usize| u32::from_str_radix(&caps[i], 16).map_err(|_| bad());

    Ok(MapsEntry {
        start: hex64(1)?,
        end: hex64(2)?,
        perms: caps[3].to_string(),
        offset: hex64(4)?,
        dev_major: hex32(5)?,
        dev_minor: hex32(6)?,
        inode: parse_dec(&caps[7], "inode")?,
        pathname: caps[8].trim_end().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vma::record::test_vma;

    #[test]
    fn test_parse_kernel_line() {
        let entry = parse_maps_line(
            "7f3c8a200000-7f3c8a228000 r--p 00000000 08:01 1835 /usr/lib/x86_64-linux-gnu/libc.so.6",
        )
        .unwrap();
        assert_eq!(entry.start, 0x7f3c_8a20_0000);
        assert_eq!(entry.end, 0x7f3c_8a22_8000);
        assert_eq!(entry.perms, "r--p");
        assert_eq!((entry.dev_major, entry.dev_minor), (8, 1));
        assert_eq!(entry.inode, 1835);
        assert_eq!(entry.pathname, "/usr/lib/x86_64-linux-gnu/libc.so.6");
    }

    #[test]
    fn test_written_lines_parse_back() {
        let lib = test_vma(0x7f00_0000_0000, 0x4000, "r-xpf", "/lib/libc.so.6");
        let anon = test_vma(0x1000, 0x2000, "rw-pa", "");
        let text = maps_text([&lib, &anon]);
        let entries: Vec<MapsEntry> = text.lines().map(|l| parse_maps_line(l).unwrap()).collect();
        assert_eq!(entries[0].pathname, "/lib/libc.so.6");
        assert_eq!(entries[0].end - entries[0].start, 0x4000);
        assert_eq!(entries[1].perms, "rw-p");
        assert!(entries[1].pathname.is_empty());
    }

    #[test]
    fn test_rejects_non_maps_text() {
        assert!(parse_maps_line("hello world").is_err());
        assert!(parse_maps_line("1000-2000 rwzp 0 00:00 0").is_err());
    }
}
