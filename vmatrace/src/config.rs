//! Analyzer configuration
//!
//! The replay engine only ever sees an [`AnalyzerConfig`]. The CLI layer
//! builds one from its arguments ([`AnalyzerConfig::from_args`]); tests and
//! library callers start from [`AnalyzerConfig::default`].

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;

use crate::cli::{Args, ResolverChoice};
use crate::domain::{ParseError, Tgid, Timestamp};
use crate::symbolization::ResolverKind;

/// How inconsistencies on fully observed processes are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Abort the replay
    #[default]
    Strict,
    /// Record a diagnostic and skip the event
    Lenient,
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Plot label for every group (default: the group root's `<name>-<tgid>`)
    pub app: Option<String>,
    /// Only these processes and their descendants are replayed
    pub targets: Option<BTreeSet<Tgid>>,
    /// Forked children report to their parent's group
    pub group: bool,
    pub userstacks: bool,
    pub functions: bool,
    /// Apply `pte_mapped` events
    pub pages: bool,
    pub strictness: Strictness,
    pub resolver: ResolverKind,
    /// Helper binary for [`ResolverKind::Addr2line`]
    pub addr2line: String,
    /// Extra point-in-time snapshots
    pub snapshots: Vec<Timestamp>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            app: None,
            targets: None,
            group: true,
            userstacks: false,
            functions: false,
            pages: true,
            strictness: Strictness::Strict,
            resolver: ResolverKind::Addr2line,
            addr2line: "addr2line".to_string(),
            snapshots: Vec::new(),
        }
    }
}

impl AnalyzerConfig {
    /// Validate CLI arguments into a configuration.
    ///
    /// # Errors
    /// Fails when the pids file cannot be read or holds something other than
    /// process ids.
    pub fn from_args(args: &Args) -> Result<Self> {
        let targets = args.pids.as_deref().map(load_target_pids).transpose()?;

        if args.functions && !args.userstacks {
            warn!("--functions has no effect without --userstacks");
        }

        let mut snapshots = args.at.clone();
        snapshots.sort_unstable();
        snapshots.dedup();

        Ok(Self {
            app: args.app.clone(),
            targets,
            group: !args.no_group,
            userstacks: args.userstacks,
            functions: args.functions && args.userstacks,
            pages: !args.no_page,
            strictness: if args.lenient { Strictness::Lenient } else { Strictness::Strict },
            resolver: match args.resolver {
                ResolverChoice::Addr2line => ResolverKind::Addr2line,
                ResolverChoice::Dwarf => ResolverKind::Dwarf,
            },
            addr2line: args.addr2line.clone(),
            snapshots,
        })
    }

    /// Resolver backend the engine should build
    #[must_use]
    pub fn effective_resolver(&self) -> ResolverKind {
        if self.userstacks && self.functions {
            self.resolver
        } else {
            ResolverKind::Disabled
        }
    }
}

/// Read a target pids file.
///
/// # Errors
/// Fails when the file cannot be read or does not parse.
pub fn load_target_pids(path: &Path) -> Result<BTreeSet<Tgid>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read pids file {}", path.display()))?;
    parse_target_pids(&text).with_context(|| format!("invalid pids file {}", path.display()))
}

/// Whitespace-separated process ids; `#` starts a comment that runs to the
/// end of the line.
///
/// # Errors
/// Returns `ParseError::BadField` for the first token that is not a pid.
pub fn parse_target_pids(text: &str) -> Result<BTreeSet<Tgid>, ParseError> {
    text.lines()
        .map(|line| line.split_once('#').map_or(line, |(data, _)| data))
        .flat_map(str::split_whitespace)
        .map(|token| {
            token.parse().map(Tgid).map_err(|_| ParseError::BadField {
                field: "pid",
                value: token.to_string(),
            })
        })
        .collect()
}
