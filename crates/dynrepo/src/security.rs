//! Security utilities for SQL injection prevention in dynrepo.
//!
//! Provides:
//! - [`IdentifierSanitizer`]: the layered check applied to caller-supplied
//!   sort columns and routine names before they become part of SQL text
//! - [`validate_sql_identifier`]: strict validation for table and column
//!   names used by the bulk loader
//!
//! Values never reach SQL text; they are always bound as parameters. The
//! sanitizer is the only path by which caller input becomes SQL syntax.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Error, SanitizerLayer};

/// Maximum accepted length of a sanitized identifier
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Letters, digits, underscore and dot; anchored on both ends
static WHITELIST_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.]+$").unwrap());

/// SQL keywords and destructive verbs rejected as whole words
const BLACKLISTED_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "EXEC",
    "EXECUTE", "UNION", "MERGE", "GRANT", "REVOKE", "DECLARE", "SHUTDOWN", "WAITFOR", "INTO",
    "FROM", "WHERE", "HAVING", "OR", "AND", "--", "/*", "*/",
];

/// Classic injection idioms
static INJECTION_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r";\s*").unwrap(), "statement terminator"),
        (
            Regex::new(r"(?i)'\s*(or|and)\s*'").unwrap(),
            "quoted boolean tautology",
        ),
        (Regex::new(r"\|\||\+\s*'|'\s*\+").unwrap(), "string concatenation"),
        (Regex::new(r"(?i)\b0x[0-9a-f]+\b").unwrap(), "hex literal"),
        (
            Regex::new(r"(?i)\b(xp_\w+|sp_executesql|pg_sleep|benchmark|sleep)\b").unwrap(),
            "dangerous routine",
        ),
        (Regex::new(r"^\.|\.$|\.\.").unwrap(), "empty name segment"),
    ]
});

/// Layered identifier sanitizer for sort columns and routine names.
///
/// Checks run in order (empty, whitelist, length, keyword, pattern) and the
/// first failing layer is reported in [`Error::UnsafeIdentifier`].
///
/// ```
/// use dynrepo::security::IdentifierSanitizer;
///
/// let sanitizer = IdentifierSanitizer::new();
/// assert_eq!(sanitizer.sanitize("CreatedAt").unwrap(), "CreatedAt");
/// assert!(sanitizer.sanitize("Name; DROP TABLE Users").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct IdentifierSanitizer {
    max_length: usize,
}

impl Default for IdentifierSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierSanitizer {
    /// Create a sanitizer with the default 128 character limit
    pub fn new() -> Self {
        Self {
            max_length: MAX_IDENTIFIER_LENGTH,
        }
    }

    /// Override the maximum identifier length
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Validate a sort column (optionally qualified, e.g. `o.CreatedAt`).
    ///
    /// Returns the trimmed identifier on success.
    pub fn sanitize(&self, raw: &str) -> crate::Result<String> {
        let candidate = raw.trim();

        if candidate.is_empty() {
            return Err(Error::unsafe_identifier(
                raw,
                SanitizerLayer::Empty,
                "identifier is empty or whitespace",
            ));
        }

        if !WHITELIST_REGEX.is_match(candidate) {
            let bad = candidate
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '.'))
                .unwrap_or('?');
            return Err(Error::unsafe_identifier(
                raw,
                SanitizerLayer::Whitelist,
                format!("contains disallowed character '{}'", bad.escape_debug()),
            ));
        }

        if candidate.len() > self.max_length {
            return Err(Error::unsafe_identifier(
                raw,
                SanitizerLayer::Length,
                format!("{} chars (max {})", candidate.len(), self.max_length),
            ));
        }

        if let Some(keyword) = find_blacklisted_keyword(candidate) {
            return Err(Error::unsafe_identifier(
                raw,
                SanitizerLayer::Keyword,
                format!("contains reserved word '{}'", keyword),
            ));
        }

        if let Some((_, idiom)) = INJECTION_PATTERNS
            .iter()
            .find(|(pattern, _)| pattern.is_match(candidate))
        {
            return Err(Error::unsafe_identifier(
                raw,
                SanitizerLayer::Pattern,
                format!("matches injection pattern: {}", idiom),
            ));
        }

        Ok(candidate.to_string())
    }

    /// Validate a stored-procedure or function name.
    ///
    /// Same layers as [`sanitize`](Self::sanitize); additionally allows at
    /// most one schema qualifier and requires every segment to start with a
    /// letter or underscore.
    pub fn sanitize_routine_name(&self, raw: &str) -> crate::Result<String> {
        let name = self.sanitize(raw)?;

        if name.matches('.').count() > 1 {
            return Err(Error::unsafe_identifier(
                raw,
                SanitizerLayer::Pattern,
                "routine names allow at most one schema qualifier",
            ));
        }

        for segment in name.split('.') {
            let starts_ok = segment
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
            if !starts_ok {
                return Err(Error::unsafe_identifier(
                    raw,
                    SanitizerLayer::Pattern,
                    format!("segment '{}' must start with a letter or underscore", segment),
                ));
            }
        }

        Ok(name)
    }
}

/// Whole-word keyword match on dot-separated segments, case-insensitive
fn find_blacklisted_keyword(candidate: &str) -> Option<&'static str> {
    candidate.split('.').find_map(|segment| {
        BLACKLISTED_KEYWORDS
            .iter()
            .copied()
            .find(|kw| segment.eq_ignore_ascii_case(kw))
    })
}

/// Validate a SQL identifier (table and column names).
///
/// Prevents SQL injection by enforcing strict character rules:
/// - Must not be empty
/// - Maximum 128 characters
/// - Must start with ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// # Examples
///
/// ```
/// use dynrepo::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("orders").is_ok());
/// assert!(validate_sql_identifier("order_lines_2024").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("123abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::unsafe_identifier(
            name,
            SanitizerLayer::Empty,
            "SQL identifier cannot be empty",
        ));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::unsafe_identifier(
            name,
            SanitizerLayer::Length,
            format!(
                "SQL identifier too long: {} chars (max {})",
                name.len(),
                MAX_IDENTIFIER_LENGTH
            ),
        ));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::unsafe_identifier(
                name,
                SanitizerLayer::Whitelist,
                "must start with a letter or underscore",
            ));
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(Error::unsafe_identifier(
                name,
                SanitizerLayer::Whitelist,
                format!("contains invalid character '{}'", c.escape_debug()),
            ));
        }
    }

    Ok(())
}

/// Validate a possibly schema-qualified table name (`schema.table`)
pub fn validate_table_name(name: &str) -> crate::Result<()> {
    let mut parts = name.splitn(2, '.');
    let first = parts.next().unwrap_or_default();
    validate_sql_identifier(first)?;
    if let Some(table) = parts.next() {
        validate_sql_identifier(table)?;
    }
    Ok(())
}
