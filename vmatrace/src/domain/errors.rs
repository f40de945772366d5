//! Structured error types for vmatrace
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::Tgid;
use thiserror::Error;

/// A trace line or payload that does not match its grammar.
///
/// Never fatal: the engine turns it into a `MalformedLine` diagnostic and
/// moves on to the next line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{family} payload does not match grammar: {payload}")]
    BadPayload { family: &'static str, payload: String },

    #[error("invalid {field} value '{value}'")]
    BadField { field: &'static str, value: String },

    #[error("invalid permissions '{0}'")]
    BadPerms(String),

    #[error("invalid permissions key '{0}'")]
    BadPermsKey(String),
}

/// Errors that stop a replay.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Input trace could not be read or re-positioned
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Strict-mode invariant violation on a fully observed process
    #[error("[{emitter}] line {line}: inconsistent state for tgid {tgid}: {message}")]
    Inconsistent { line: u64, tgid: Tgid, emitter: &'static str, message: String },
}

/// Failures of a single symbol source. Recorded per module; never fatal.
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("failed to spawn {program} for {module}: {error}")]
    Spawn { program: String, module: String, error: std::io::Error },

    #[error("resolver for {0} exited")]
    ChildExited(String),

    #[error("resolver for {0} did not answer in time")]
    Timeout(String),

    #[error("{0} is not a readable ELF object")]
    NotElf(String),

    #[error("failed to load debug info for {module}: {error}")]
    Dwarf { module: String, error: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors writing analysis outputs.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to write {path}: {error}")]
    WriteFailed { path: String, error: std::io::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconsistent_display_names_line_and_emitter() {
        let err = ReplayError::Inconsistent {
            line: 42,
            tgid: Tgid(1234),
            emitter: "engine",
            message: "free of unknown VMA at 0x1000".to_string(),
        };
        let text = err.to_string();
        assert!(text.starts_with("[engine] line 42:"));
        assert!(text.contains("tgid 1234"));
        assert!(text.contains("0x1000"));
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::BadPerms("rwz".to_string());
        assert_eq!(err.to_string(), "invalid permissions 'rwz'");
    }
}
