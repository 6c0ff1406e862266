//! Identifier validation and quoting.
//!
//! Identifiers cannot be bound as parameters, so every table, column, index
//! and constraint name that ends up in generated DDL passes through here
//! first.

use crate::error::{DbError, Result};

/// Maximum identifier length (PostgreSQL truncates beyond 63 bytes).
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validates a logical key (collection or field key).
///
/// Keys must start with a letter or underscore and contain only ASCII
/// letters, digits and underscores.
pub fn validate_key(kind: &'static str, key: &str) -> Result<()> {
    check_shape(kind, key)
}

/// Validates a physical table or column name.
///
/// Same rules as [`validate_key`], and additionally rejects double
/// underscores, which separate parts of index and constraint names.
pub fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    check_shape(kind, name)?;
    if name.contains("__") {
        return Err(invalid(kind, name, "double underscores are reserved"));
    }
    Ok(())
}

/// Validates the length of a generated index or constraint name.
///
/// PostgreSQL silently truncates longer names, so two long names could
/// collapse into one.
pub fn validate_generated(kind: &'static str, name: &str) -> Result<()> {
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(invalid(kind, name, "exceeds 63 bytes"));
    }
    Ok(())
}

fn check_shape(kind: &'static str, ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let Some(first) = chars.next() else {
        return Err(invalid(kind, ident, "identifier cannot be empty"));
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(invalid(
            kind,
            ident,
            "must start with a letter or underscore",
        ));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid(
            kind,
            ident,
            "only letters, digits and underscores are allowed",
        ));
    }
    if ident.len() > MAX_IDENTIFIER_LENGTH {
        return Err(invalid(kind, ident, "exceeds 63 bytes"));
    }
    Ok(())
}

fn invalid(kind: &'static str, name: &str, reason: &'static str) -> DbError {
    DbError::InvalidIdentifier {
        kind,
        name: name.to_string(),
        reason,
    }
}

/// Double-quotes an identifier, escaping embedded quotes.
#[must_use]
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes and comma-joins a list of identifiers.
#[must_use]
pub fn quote_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Generates a random name for a temporary table or column.
///
/// The result is a valid physical name (no double underscore).
#[must_use]
pub fn temporary_name() -> String {
    format!("tmp_{:016x}", rand::random::<u64>())
}
