//! Identifier validation
//!
//! Table, schema and column names end up inside generated SQL, so anything
//! that is not a plain identifier is rejected before a query is built.

use regex::Regex;
use std::sync::LazyLock;

use crate::common::{CdcError, Result, TableId};

const MAX_IDENTIFIER_LENGTH: usize = 128;

static IDENTIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Validator for names interpolated into queries
pub struct Validator;

impl Validator {
    /// Validate a SQL identifier (schema, table or column name)
    pub fn validate_identifier(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CdcError::config("Identifier cannot be empty"));
        }

        if name.len() > MAX_IDENTIFIER_LENGTH {
            return Err(CdcError::config(format!(
                "Identifier too long: {} chars (max: {})",
                name.len(),
                MAX_IDENTIFIER_LENGTH
            )));
        }

        if !IDENTIFIER_REGEX.is_match(name) {
            return Err(CdcError::config(format!(
                "Invalid identifier '{}': must start with letter/underscore and contain only alphanumeric characters and underscores",
                name
            )));
        }

        Ok(())
    }

    /// Validate both parts of a table identity
    pub fn validate_table(table: &TableId) -> Result<()> {
        Self::validate_identifier(&table.schema)?;
        Self::validate_identifier(&table.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(Validator::validate_identifier("users").is_ok());
        assert!(Validator::validate_identifier("_private").is_ok());
        assert!(Validator::validate_identifier("Order_Items2").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(Validator::validate_identifier("").is_err());
        assert!(Validator::validate_identifier("1users").is_err());
        assert!(Validator::validate_identifier("users; DROP TABLE x").is_err());
        assert!(Validator::validate_identifier("us]ers").is_err());
        assert!(Validator::validate_identifier(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_table() {
        assert!(Validator::validate_table(&TableId::new("dbo", "users")).is_ok());
        assert!(Validator::validate_table(&TableId::new("dbo'", "users")).is_err());
    }
}
