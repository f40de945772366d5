//! Permissions keys
//!
//! A permissions key folds the kernel's `rwxp` string and the file/anon
//! backing of a VMA into one of twenty enumerated values, written as five
//! characters: `RWX` + `p|s` + `f|a` (e.g. `r-xpf`, `rw-pa`).
//!
//! Only five access combinations exist in a key. Combinations the x86 MMU
//! cannot express are folded onto the one it actually enforces: write
//! implies read and execute implies read, so `-w-` becomes `rw-`, `--x`
//! becomes `r-x` and `-wx` becomes `rwx`.

use std::fmt;
use std::str::FromStr;

use crate::domain::ParseError;

/// Access part of a permissions key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Access {
    None,
    Read,
    ReadWrite,
    ReadExec,
    ReadWriteExec,
}

impl Access {
    pub const ALL: [Access; 5] =
        [Access::None, Access::Read, Access::ReadWrite, Access::ReadExec, Access::ReadWriteExec];

    fn from_bits(read: bool, write: bool, exec: bool) -> Self {
        match (read || write || exec, write, exec) {
            (false, _, _) => Access::None,
            (true, false, false) => Access::Read,
            (true, true, false) => Access::ReadWrite,
            (true, false, true) => Access::ReadExec,
            (true, true, true) => Access::ReadWriteExec,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Access::None => "---",
            Access::Read => "r--",
            Access::ReadWrite => "rw-",
            Access::ReadExec => "r-x",
            Access::ReadWriteExec => "rwx",
        }
    }
}

/// One of the twenty permissions keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PermsKey {
    pub access: Access,
    pub shared: bool,
    pub file_backed: bool,
}

impl PermsKey {
    /// Build a key from the 4-character kernel permissions (`rw-p`) and the
    /// backing of the VMA.
    ///
    /// # Errors
    /// Returns `ParseError::BadPerms` if `perms` is not `[r-][w-][x-][ps]`.
    pub fn from_perms(perms: &str, file_backed: bool) -> Result<Self, ParseError> {
        let bytes = perms.as_bytes();
        if bytes.len() != 4 {
            return Err(ParseError::BadPerms(perms.to_string()));
        }

        let flag = |idx: usize, set: u8| -> Result<bool, ParseError> {
            match bytes[idx] {
                b'-' => Ok(false),
                b if b == set => Ok(true),
                _ => Err(ParseError::BadPerms(perms.to_string())),
            }
        };

        let read = flag(0, b'r')?;
        let write = flag(1, b'w')?;
        let exec = flag(2, b'x')?;
        let shared = match bytes[3] {
            b'p' => false,
            b's' => true,
            _ => return Err(ParseError::BadPerms(perms.to_string())),
        };

        Ok(Self { access: Access::from_bits(read, write, exec), shared, file_backed })
    }

    /// Every member of the enumerated set
    pub fn all() -> impl Iterator<Item = PermsKey> {
        Access::ALL.into_iter().flat_map(|access| {
            [false, true].into_iter().flat_map(move |shared| {
                [true, false].into_iter().map(move |file_backed| PermsKey {
                    access,
                    shared,
                    file_backed,
                })
            })
        })
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.access != Access::None
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        matches!(self.access, Access::ReadWrite | Access::ReadWriteExec)
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        matches!(self.access, Access::ReadExec | Access::ReadWriteExec)
    }

    /// The 4-character `/proc/<pid>/maps` form (`r-xp`)
    #[must_use]
    pub fn maps_perms(&self) -> String {
        format!("{}{}", self.access.as_str(), if self.shared { 's' } else { 'p' })
    }
}

impl fmt::Display for PermsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.access.as_str(),
            if self.shared { 's' } else { 'p' },
            if self.file_backed { 'f' } else { 'a' }
        )
    }
}

impl FromStr for PermsKey {
    type Err = ParseError;

    /// Parse a 5-character key. Only canonical members are accepted, so
    /// `-w-pa` is rejected even though `from_perms("-w-p", ..)` folds it.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 5 || !s.is_ascii() {
            return Err(ParseError::BadPermsKey(s.to_string()));
        }
        let file_backed = match &s[4..] {
            "f" => true,
            "a" => false,
            _ => return Err(ParseError::BadPermsKey(s.to_string())),
        };
        let key = PermsKey::from_perms(&s[..4], file_backed)
            .map_err(|_| ParseError::BadPermsKey(s.to_string()))?;

        if key.to_string() == s {
            Ok(key)
        } else {
            Err(ParseError::BadPermsKey(s.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_enumerated_set_has_twenty_members() {
        let all: HashSet<String> = PermsKey::all().map(|k| k.to_string()).collect();
        assert_eq!(all.len(), 20);
        assert!(all.contains("r-xpf"));
        assert!(all.contains("rw-pa"));
        assert!(all.contains("---pa"));
        assert!(all.contains("rwxsf"));
    }

    #[test]
    fn test_every_kernel_perms_string_maps_into_set() {
        let all: HashSet<PermsKey> = PermsKey::all().collect();
        for r in ["r", "-"] {
            for w in ["w", "-"] {
                for x in ["x", "-"] {
                    for m in ["p", "s"] {
                        for backed in [true, false] {
                            let perms = format!("{r}{w}{x}{m}");
                            let key = PermsKey::from_perms(&perms, backed).unwrap();
                            assert!(all.contains(&key), "{perms} -> {key} not in set");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_key_parse_is_idempotent() {
        for key in PermsKey::all() {
            let text = key.to_string();
            let parsed: PermsKey = text.parse().unwrap();
            assert_eq!(parsed, key);
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn test_write_only_folds_to_read_write() {
        let key = PermsKey::from_perms("-w-p", false).unwrap();
        assert_eq!(key.to_string(), "rw-pa");
        assert!("-w-pa".parse::<PermsKey>().is_err());
    }

    #[test]
    fn test_rejects_bad_perms() {
        assert!(PermsKey::from_perms("rwz-", true).is_err());
        assert!(PermsKey::from_perms("rw-", true).is_err());
        assert!(PermsKey::from_perms("rw-q", true).is_err());
        assert!("rw-px".parse::<PermsKey>().is_err());
    }

    #[test]
    fn test_predicates() {
        let key: PermsKey = "rwxsf".parse().unwrap();
        assert!(key.is_readable() && key.is_writable() && key.is_executable());
        assert!(key.shared && key.file_backed);
        assert_eq!(key.maps_perms(), "rwxs");

        let guard: PermsKey = "---pa".parse().unwrap();
        assert!(!guard.is_readable());
    }
}
