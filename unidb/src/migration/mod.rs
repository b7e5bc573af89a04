//! Versioned schema migrations
//!
//! Scripts live in one directory as `<version>__<description>.<ext>`. The
//! [`MigrationEngine`] discovers and orders them, then applies them one at a
//! time, stopping at the first failure. A [`MigrationLedger`] records what
//! has been applied so a second run skips it.

pub mod discovery;
pub mod engine;
pub mod ledger;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use discovery::{discover, order, parse_file_name};
pub use engine::{pending, MigrationEngine, MigrationTarget};
pub use ledger::{MigrationLedger, SqlLedger};

/// One versioned script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub version: u64,
    pub description: String,
    pub file_name: String,
    pub script: String,
    /// md5 of `script`, hex encoded
    pub checksum: String,
}

impl Migration {
    pub fn new(version: u64, description: impl Into<String>, script: impl Into<String>) -> Self {
        let description = description.into();
        let script = script.into();
        Self {
            version,
            file_name: format!("{}__{}", version, description),
            checksum: checksum(&script),
            description,
            script,
        }
    }
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{} ({})", self.version, self.description)
    }
}

/// Hex md5 of a script body.
pub fn checksum(script: &str) -> String {
    format!("{:x}", md5::compute(script.as_bytes()))
}

/// Where a [`MigrationEngine`] is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationState {
    #[default]
    Idle,
    Discovering,
    Ordered,
    Applying,
    Completed,
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_checksum_is_md5_hex() {
        assert_eq!(checksum(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(Migration::new(1, "init", "").checksum, checksum(""));
    }

    #[test]
    fn test_display() {
        assert_eq!(Migration::new(7, "add_index", "SELECT 1").to_string(), "V7 (add_index)");
    }
}
