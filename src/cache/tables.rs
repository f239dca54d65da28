//! Per-instance table identifiers.
//!
//! Several Storage Elements may share one PostgreSQL database, each under
//! its own `DB_TABLE_PREFIX`. Table names are composed here, once, when the
//! persistence layer initializes; nothing in the codebase bakes a table
//! name into a type declaration.

use crate::core::error::{EngineError, EngineResult};

/// Resolved table names for one Storage Element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub files: String,
    pub wal: String,
    pub config: String,
    pub schema_version: String,
}

impl TableNames {
    /// Compose the table group for a prefix.
    ///
    /// The prefix becomes part of SQL identifiers, so it is restricted to
    /// `[a-z0-9_]` starting with a letter; anything else is rejected
    /// rather than quoted.
    pub fn for_prefix(prefix: &str) -> EngineResult<Self> {
        if prefix.is_empty() || prefix.len() > 32 {
            return Err(EngineError::Validation(
                "table prefix must be 1..=32 chars".into(),
            ));
        }
        let mut chars = prefix.chars();
        let first = chars.next().unwrap();
        if !first.is_ascii_lowercase() {
            return Err(EngineError::Validation(
                "table prefix must start with a lowercase letter".into(),
            ));
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(EngineError::Validation(
                "table prefix may only contain [a-z0-9_]".into(),
            ));
        }
        Ok(Self {
            files: format!("{prefix}_files"),
            wal: format!("{prefix}_wal"),
            config: format!("{prefix}_config"),
            schema_version: format!("{prefix}_schema_version"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_prefix() {
        let t = TableNames::for_prefix("se1").unwrap();
        assert_eq!(t.files, "se1_files");
        assert_eq!(t.wal, "se1_wal");
        assert_eq!(t.config, "se1_config");
        assert_eq!(t.schema_version, "se1_schema_version");
    }

    #[test]
    fn test_injection_shaped_prefix_rejected() {
        assert!(TableNames::for_prefix("se1; drop table users").is_err());
        assert!(TableNames::for_prefix("se1\"").is_err());
        assert!(TableNames::for_prefix("1se").is_err());
        assert!(TableNames::for_prefix("SE1").is_err());
        assert!(TableNames::for_prefix("").is_err());
    }
}
