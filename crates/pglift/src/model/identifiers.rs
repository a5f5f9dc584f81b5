use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

pub const MAX_IDENTIFIER_LENGTH: usize = 1000;

static RE_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z_0-9]*$").expect("valid identifier regex"));

/// PostgreSQL reserved key words (including those allowed only as function
/// or type names), upper case.
pub const RESERVED_KEYWORDS: &[&str] = &[
    "ALL",
    "ANALYSE",
    "ANALYZE",
    "AND",
    "ANY",
    "ARRAY",
    "AS",
    "ASC",
    "ASYMMETRIC",
    "AUTHORIZATION",
    "BINARY",
    "BOTH",
    "CASE",
    "CAST",
    "CHECK",
    "COLLATE",
    "COLLATION",
    "COLUMN",
    "CONCURRENTLY",
    "CONSTRAINT",
    "CREATE",
    "CROSS",
    "CURRENT_CATALOG",
    "CURRENT_DATE",
    "CURRENT_ROLE",
    "CURRENT_SCHEMA",
    "CURRENT_TIME",
    "CURRENT_TIMESTAMP",
    "CURRENT_USER",
    "DEFAULT",
    "DEFERRABLE",
    "DESC",
    "DISTINCT",
    "DO",
    "ELSE",
    "END",
    "EXCEPT",
    "FALSE",
    "FETCH",
    "FOR",
    "FOREIGN",
    "FREEZE",
    "FROM",
    "FULL",
    "GRANT",
    "GROUP",
    "HAVING",
    "ILIKE",
    "IN",
    "INITIALLY",
    "INNER",
    "INTERSECT",
    "INTO",
    "IS",
    "ISNULL",
    "JOIN",
    "LATERAL",
    "LEADING",
    "LEFT",
    "LIKE",
    "LIMIT",
    "LOCALTIME",
    "LOCALTIMESTAMP",
    "NATURAL",
    "NOT",
    "NOTNULL",
    "NULL",
    "OFFSET",
    "ON",
    "ONLY",
    "OR",
    "ORDER",
    "OUTER",
    "OVERLAPS",
    "PLACING",
    "PRIMARY",
    "REFERENCES",
    "RETURNING",
    "RIGHT",
    "SELECT",
    "SESSION_USER",
    "SIMILAR",
    "SOME",
    "SYMMETRIC",
    "SYSTEM_USER",
    "TABLE",
    "TABLESAMPLE",
    "THEN",
    "TO",
    "TRAILING",
    "TRUE",
    "UNION",
    "UNIQUE",
    "USER",
    "USING",
    "VARIADIC",
    "VERBOSE",
    "WHEN",
    "WHERE",
    "WINDOW",
    "WITH",
];

pub fn is_reserved_keyword(value: &str) -> bool {
    let upper = value.to_ascii_uppercase();
    RESERVED_KEYWORDS.binary_search(&upper.as_str()).is_ok()
}

/// Validates an instance, role or database name.
pub fn check_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{} name must not be empty", kind)));
    }
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::Validation(format!(
            "{} name must be at most {} characters long",
            kind, MAX_IDENTIFIER_LENGTH
        )));
    }
    if value.contains('-') || value.contains('/') {
        return Err(Error::Validation(format!(
            "{} name '{}' must not contain dashes or slashes",
            kind, value
        )));
    }
    if !RE_IDENTIFIER.is_match(value) {
        return Err(Error::Validation(format!(
            "{} name '{}' is not a valid identifier",
            kind, value
        )));
    }
    if is_reserved_keyword(value) {
        return Err(Error::Validation(format!(
            "{} name '{}' is a reserved PostgreSQL keyword",
            kind, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_sorted_for_binary_search() {
        let mut sorted = RESERVED_KEYWORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, RESERVED_KEYWORDS);
    }

    #[test]
    fn test_valid_identifiers() {
        for name in ["t1", "main", "_x", "App_2"] {
            assert!(check_identifier("instance", name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_invalid_identifiers() {
        for name in ["", "1abc", "a-b", "a/b", "select", "User", "with space"] {
            assert!(check_identifier("instance", name).is_err(), "{}", name);
        }
        let long = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert!(check_identifier("role", &long).is_err());
    }
}
