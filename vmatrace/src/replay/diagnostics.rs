//! Replay diagnostics
//!
//! Every recoverable problem becomes a [`Diagnostic`] carrying the trace line
//! number, the component that noticed it and the affected process. They are
//! logged as they happen and written to `diagnostics.tsv` at the end.

use std::collections::BTreeMap;
use std::fmt;

use log::{info, warn};

use crate::domain::Tgid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiagnosticKind {
    /// A known line shape with an unparsable field or payload
    MalformedLine,
    /// A line of no known shape
    UnknownLine,
    /// VMA state contradicts the event (lenient or partial process)
    InconsistentState,
    /// Pairs still open at end of trace
    UnbalancedPair,
    /// No stack for the event, or a stack of another task
    StackMismatch,
    /// A symbol source failed
    ResolverFailure,
    /// Fork look-ahead hit the end of the trace
    LookaheadEof,
    /// The trace ended while an exec stack VMA was still held out of band
    ExecIncomplete,
}

impl DiagnosticKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticKind::MalformedLine => "malformed-line",
            DiagnosticKind::UnknownLine => "unknown-line",
            DiagnosticKind::InconsistentState => "inconsistent-state",
            DiagnosticKind::UnbalancedPair => "unbalanced-pair",
            DiagnosticKind::StackMismatch => "stack-mismatch",
            DiagnosticKind::ResolverFailure => "resolver-failure",
            DiagnosticKind::LookaheadEof => "lookahead-eof",
            DiagnosticKind::ExecIncomplete => "exec-incomplete",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u64,
    pub emitter: &'static str,
    pub tgid: Option<Tgid>,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    /// `line  emitter  tgid  kind  message`, tab separated
    #[must_use]
    pub fn to_tsv(&self) -> String {
        let tgid = self.tgid.map_or_else(|| "-".to_string(), |t| t.to_string());
        let message = self.message.replace(['\t', '\n'], " ");
        format!("{}\t{}\t{tgid}\t{}\t{message}", self.line, self.emitter, self.kind)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] line {}: ", self.emitter, self.line)?;
        if let Some(tgid) = self.tgid {
            write!(f, "tgid {tgid}: ")?;
        }
        write!(f, "{}", self.message)
    }
}

/// Collected diagnostics in trace order
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        line: u64,
        emitter: &'static str,
        tgid: Option<Tgid>,
        kind: DiagnosticKind,
        message: impl Into<String>,
    ) {
        let diagnostic = Diagnostic { line, emitter, tgid, kind, message: message.into() };
        match kind {
            DiagnosticKind::LookaheadEof | DiagnosticKind::StackMismatch | DiagnosticKind::ExecIncomplete => {
                info!("{diagnostic}");
            }
            _ => warn!("{diagnostic}"),
        }
        self.entries.push(diagnostic);
    }

    /// Add a diagnostic that was already reported elsewhere
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    #[must_use]
    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    #[must_use]
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|d| d.kind == kind).count()
    }

    #[must_use]
    pub fn counts(&self) -> BTreeMap<DiagnosticKind, usize> {
        let mut counts = BTreeMap::new();
        for d in &self.entries {
            *counts.entry(d.kind).or_default() += 1;
        }
        counts
    }

    #[must_use]
    pub fn into_entries(self) -> Vec<Diagnostic> {
        self.entries
    }
}
