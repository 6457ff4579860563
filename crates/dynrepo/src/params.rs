//! Named parameters and parameter binding
//!
//! Callers write SQL with named references (`@customer_id`) and supply a
//! [`Params`] map. [`ParameterBinder`] rewrites the references into the
//! dialect's positional placeholders and produces the ordered value list the
//! backend sends as bound parameters. Values never become SQL text.
//!
//! The module also hosts the small lexer shared with the query composer:
//! [`mask_literals`] blanks string literals, quoted identifiers and comments
//! while preserving byte offsets, so structural scans (parameter references,
//! statement separators, `ORDER BY`) only ever look at SQL syntax.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::types::Value;

/// Prefix that marks a named parameter reference
pub const PARAMETER_PREFIX: char = '@';

/// Name → value mapping for a command.
///
/// Names are normalized to carry the `@` prefix and are unique ignoring
/// case; iteration order is stable (sorted).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: BTreeMap<String, Value>,
}

impl Params {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a parameter name to the `@name` convention
    pub fn normalize_name(name: &str) -> String {
        let name = name.trim();
        if name.starts_with(PARAMETER_PREFIX) {
            name.to_string()
        } else {
            format!("{}{}", PARAMETER_PREFIX, name)
        }
    }

    /// Insert or replace a parameter; returns the previous value
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<Value>) -> Option<Value> {
        let normalized = Self::normalize_name(name.as_ref());
        let existing = self
            .entries
            .keys()
            .find(|k| k.eq_ignore_ascii_case(&normalized))
            .cloned();
        let previous = existing.and_then(|k| self.entries.remove(&k));
        self.entries.insert(normalized, value.into());
        previous
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Look up a value by name (prefix optional, case-insensitive)
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.lookup(name).map(|(_, v)| v)
    }

    /// Remove a parameter by name
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let key = self.lookup(name).map(|(k, _)| k.to_string())?;
        self.entries.remove(&key)
    }

    /// Merge another set into this one; entries in `other` win
    pub fn extend(&mut self, other: Params) {
        for (name, value) in other.entries {
            self.insert(name, value);
        }
    }

    /// Number of parameters
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Normalized parameter names in stable order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterate `(name, value)` pairs in stable order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn lookup(&self, name: &str) -> Option<(&str, &Value)> {
        let normalized = Self::normalize_name(name);
        if let Some((k, v)) = self.entries.get_key_value(&normalized) {
            return Some((k.as_str(), v));
        }
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&normalized))
            .map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

impl From<HashMap<String, Value>> for Params {
    fn from(map: HashMap<String, Value>) -> Self {
        map.into_iter().collect()
    }
}

/// SQL with positional placeholders and the values to bind, in order
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    /// SQL text with dialect placeholders
    pub sql: String,
    /// Values in placeholder order
    pub values: Vec<Value>,
    /// Normalized parameter names in placeholder order
    pub names: Vec<String>,
}

/// Rewrites named parameter references into positional placeholders
#[derive(Debug, Clone, Copy)]
pub struct ParameterBinder<'a> {
    dialect: &'a dyn SqlDialect,
}

impl<'a> ParameterBinder<'a> {
    /// Create a binder for the given dialect
    pub fn new(dialect: &'a dyn SqlDialect) -> Self {
        Self { dialect }
    }

    /// Bind `params` into `sql`.
    ///
    /// References inside literals and comments are ignored, `@@name` is
    /// left untouched, repeated references share one position. A reference
    /// with no supplied value is a validation error.
    pub fn bind(&self, sql: &str, params: &Params) -> Result<BoundStatement> {
        let masked = mask_literals(sql);
        let bytes = masked.as_bytes();
        let len = bytes.len();

        let mut out = String::with_capacity(sql.len() + 8);
        let mut names: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let mut last = 0;
        let mut i = 0;

        while i < len {
            if bytes[i] != b'@' {
                i += 1;
                continue;
            }

            if i + 1 < len && bytes[i + 1] == b'@' {
                i += 2;
                while i < len && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                continue;
            }

            let preceded_by_ident = i > 0 && is_ident_byte(bytes[i - 1]);
            let start = i + 1;
            if preceded_by_ident
                || start >= len
                || !(bytes[start].is_ascii_alphabetic() || bytes[start] == b'_')
            {
                i += 1;
                continue;
            }

            let mut end = start;
            while end < len && is_ident_byte(bytes[end]) {
                end += 1;
            }

            let name = &sql[start..end];
            let (canonical, value) = params.lookup(name).ok_or_else(|| {
                Error::validation(format!(
                    "parameter @{} is referenced but no value was supplied",
                    name
                ))
            })?;

            let position = match names.iter().position(|n| n == canonical) {
                Some(p) => p + 1,
                None => {
                    names.push(canonical.to_string());
                    values.push(value.clone());
                    names.len()
                }
            };

            out.push_str(&sql[last..i]);
            out.push_str(&self.dialect.placeholder(position));
            last = end;
            i = end;
        }

        out.push_str(&sql[last..]);

        Ok(BoundStatement {
            sql: out,
            values,
            names,
        })
    }
}

#[inline]
fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Blank out string literals, quoted identifiers, dollar-quoted bodies and
/// comments with spaces. Byte offsets are preserved.
pub fn mask_literals(sql: &str) -> String {
    mask(sql, false)
}

/// Blank out comments only; literals are kept verbatim but still scanned, so
/// `--` inside a string is not a comment. Byte offsets are preserved.
pub fn mask_comments(sql: &str) -> String {
    mask(sql, true)
}

fn mask(sql: &str, keep_literals: bool) -> String {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut out = Vec::with_capacity(len);
    let mut i = 0;

    while i < len {
        let end = match bytes[i] {
            q @ (b'\'' | b'"') => Some(closing_quote(bytes, i + 1, q)),
            b'-' if i + 1 < len && bytes[i + 1] == b'-' => Some(
                bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(len, |p| i + p),
            ),
            b'/' if i + 1 < len && bytes[i + 1] == b'*' => Some(
                sql[i + 2..]
                    .find("*/")
                    .map_or(len, |p| i + 2 + p + 2),
            ),
            b'$' => dollar_tag(bytes, i).map(|tag_end| {
                let tag = &sql[i..=tag_end];
                sql[tag_end + 1..]
                    .find(tag)
                    .map_or(len, |p| tag_end + 1 + p + tag.len())
            }),
            _ => None,
        };

        match end {
            Some(end) if keep_literals && !matches!(bytes[i], b'-' | b'/') => {
                out.extend_from_slice(&bytes[i..end]);
                i = end;
            }
            Some(end) => {
                out.resize(out.len() + (end - i), b' ');
                i = end;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Additionally blank everything nested inside parentheses, keeping the
/// outermost parentheses. Input must already be literal-masked.
pub fn mask_nested(masked: &str) -> String {
    let mut depth = 0usize;
    let out: Vec<u8> = masked
        .bytes()
        .map(|b| match b {
            b'(' => {
                depth += 1;
                if depth == 1 {
                    b'('
                } else {
                    b' '
                }
            }
            b')' => {
                let keep = depth == 1;
                depth = depth.saturating_sub(1);
                if keep {
                    b')'
                } else {
                    b' '
                }
            }
            _ if depth > 0 => b' ',
            other => other,
        })
        .collect();
    String::from_utf8_lossy(&out).into_owned()
}

/// Split a script on top-level semicolons, dropping empty statements
pub fn split_statements(sql: &str) -> Vec<String> {
    let masked = mask_literals(sql);
    let mut statements = Vec::new();
    let mut start = 0;

    for (pos, b) in masked.bytes().enumerate() {
        if b == b';' {
            push_statement(&mut statements, &sql[start..pos]);
            start = pos + 1;
        }
    }
    push_statement(&mut statements, &sql[start..]);
    statements
}

fn push_statement(statements: &mut Vec<String>, candidate: &str) {
    let trimmed = candidate.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

fn closing_quote(bytes: &[u8], mut j: usize, quote: u8) -> usize {
    while j < bytes.len() {
        if bytes[j] == quote {
            if j + 1 < bytes.len() && bytes[j + 1] == quote {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    bytes.len()
}

/// End index (inclusive) of a `$tag$` opener starting at `i`
fn dollar_tag(bytes: &[u8], i: usize) -> Option<usize> {
    if i > 0 && is_ident_byte(bytes[i - 1]) {
        return None;
    }
    let mut j = i + 1;
    while j < bytes.len() && is_ident_byte(bytes[j]) {
        if j == i + 1 && bytes[j].is_ascii_digit() {
            return None;
        }
        j += 1;
    }
    (j < bytes.len() && bytes[j] == b'$').then_some(j)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{PostgresDialect, SqlServerDialect};

    #[test]
    fn test_params_normalize_and_lookup() {
        let params = Params::new().with("CustomerId", 7).with("@status", "open");
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("@customerid"), Some(&Value::Int32(7)));
        assert_eq!(params.get("STATUS"), Some(&Value::String("open".into())));
        assert!(params.names().all(|n| n.starts_with('@')));
    }

    #[test]
    fn test_params_unique_ignoring_case() {
        let mut params = Params::new();
        params.insert("Id", 1);
        let previous = params.insert("@ID", 2);
        assert_eq!(previous, Some(Value::Int32(1)));
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("id"), Some(&Value::Int32(2)));
    }

    #[test]
    fn test_bind_postgres_positions() {
        let params = Params::new().with("status", "open").with("min", 10);
        let bound = ParameterBinder::new(&PostgresDialect)
            .bind(
                "SELECT * FROM orders WHERE status = @status AND total > @min OR @status = 'x'",
                &params,
            )
            .unwrap();
        assert_eq!(
            bound.sql,
            "SELECT * FROM orders WHERE status = $1 AND total > $2 OR $1 = 'x'"
        );
        assert_eq!(
            bound.values,
            vec![Value::String("open".into()), Value::Int32(10)]
        );
        assert_eq!(bound.names, vec!["@status", "@min"]);
    }

    #[test]
    fn test_bind_null_value() {
        let params = Params::new().with("deleted_at", None::<i64>);
        let bound = ParameterBinder::new(&PostgresDialect)
            .bind("UPDATE t SET deleted_at = @deleted_at", &params)
            .unwrap();
        assert_eq!(bound.values, vec![Value::Null]);
    }

    #[test]
    fn test_bind_ignores_literals_comments_and_system_vars() {
        let params = Params::new().with("id", 1);
        let sql = "SELECT '@id', \"@id\", @@ROWCOUNT -- @id\n FROM t /* @id */ WHERE id = @id AND mail = 'a@b.c'";
        let bound = ParameterBinder::new(&SqlServerDialect)
            .bind(sql, &params)
            .unwrap();
        assert!(bound.sql.contains("WHERE id = @p1"));
        assert!(bound.sql.contains("'@id'"));
        assert!(bound.sql.contains("@@ROWCOUNT"));
        assert_eq!(bound.values.len(), 1);
    }

    #[test]
    fn test_bind_missing_parameter_is_validation_error() {
        let err = ParameterBinder::new(&PostgresDialect)
            .bind("SELECT * FROM t WHERE id = @id", &Params::new())
            .unwrap_err();
        assert_eq!(err.layer(), crate::error::ErrorLayer::Validation);
        assert!(err.to_string().contains("@id"));
    }

    #[test]
    fn test_bind_leaves_jsonb_operators() {
        let params = Params::new().with("doc", serde_json::json!({"a": 1}));
        let bound = ParameterBinder::new(&PostgresDialect)
            .bind("SELECT * FROM t WHERE data @> @doc", &params)
            .unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE data @> $1");
    }

    #[test]
    fn test_mask_preserves_offsets() {
        let sql = "SELECT 'a;b' ; SELECT $$x;y$$; -- c;\nSELECT 1";
        let masked = mask_literals(sql);
        assert_eq!(masked.len(), sql.len());
        assert_eq!(masked.matches(';').count(), 2);
    }

    #[test]
    fn test_mask_comments_keeps_literals() {
        let sql = "SELECT '--x' AS a /* note */ FROM t -- tail";
        let masked = mask_comments(sql);
        assert_eq!(masked.len(), sql.len());
        assert_eq!(masked.trim_end(), "SELECT '--x' AS a            FROM t");
    }

    #[test]
    fn test_mask_nested() {
        let masked = mask_nested("SELECT a FROM (SELECT b FROM c ORDER BY b) x ORDER BY a");
        assert!(masked.contains("FROM (") && masked.contains(") x ORDER BY a"));
        assert_eq!(masked.matches("ORDER BY").count(), 1);
    }

    #[test]
    fn test_split_statements() {
        let statements = split_statements("SELECT 1; SELECT ';' AS s;; \n SELECT 3;");
        assert_eq!(statements, vec!["SELECT 1", "SELECT ';' AS s", "SELECT 3"]);
    }
}
