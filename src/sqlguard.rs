//! Lexical statement classification for retrieval-only operations.
//!
//! `query` and `explain_query` must never reach a backend with a mutating
//! statement, independent of the policy gate. The check is purely lexical:
//! strip comments, look at the leading keyword, and reject statement
//! chaining.

use crate::error::ToolError;

/// Keywords that open a pure retrieval.
const RETRIEVAL_KEYWORDS: &[&str] = &[
    "select", "with", "show", "describe", "desc", "explain", "pragma", "values",
];

/// Ensure `statement` is lexically a pure retrieval.
pub fn ensure_retrieval(statement: &str) -> Result<(), ToolError> {
    let body = skip_leading_trivia(statement);
    let keyword = leading_keyword(body);
    if keyword.is_empty() {
        return Err(ToolError::InvalidStatementClass(
            "empty statement".to_string(),
        ));
    }
    if !RETRIEVAL_KEYWORDS.contains(&keyword.to_ascii_lowercase().as_str()) {
        return Err(ToolError::InvalidStatementClass(format!(
            "'{}' is not a retrieval keyword",
            keyword
        )));
    }
    if chains_second_statement(body) {
        return Err(ToolError::InvalidStatementClass(
            "multiple statements are not allowed".to_string(),
        ));
    }
    Ok(())
}

/// Skip whitespace, `--` line comments, and `/* */` block comments.
fn skip_leading_trivia(mut s: &str) -> &str {
    loop {
        s = s.trim_start();
        if let Some(rest) = s.strip_prefix("--") {
            s = match rest.find('\n') {
                Some(i) => &rest[i + 1..],
                None => "",
            };
        } else if let Some(rest) = s.strip_prefix("/*") {
            s = match rest.find("*/") {
                Some(i) => &rest[i + 2..],
                None => "",
            };
        } else {
            return s;
        }
    }
}

fn leading_keyword(s: &str) -> &str {
    let end = s
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(s.len());
    &s[..end]
}

/// True when a semicolon is followed by anything but trailing trivia.
/// Quoted strings and identifiers are skipped so embedded semicolons do
/// not trip the check.
fn chains_second_statement(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            b';' => {
                let rest = &s[i + 1..];
                return !skip_leading_trivia(rest).is_empty();
            }
            _ => i += 1,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_retrievals() {
        assert!(ensure_retrieval("SELECT 1").is_ok());
        assert!(ensure_retrieval("select * from t").is_ok());
        assert!(ensure_retrieval("WITH x AS (SELECT 1) SELECT * FROM x").is_ok());
        assert!(ensure_retrieval("EXPLAIN SELECT 1").is_ok());
        assert!(ensure_retrieval("PRAGMA table_info(t)").is_ok());
        assert!(ensure_retrieval("SHOW TABLES").is_ok());
    }

    #[test]
    fn accepts_leading_comments_and_trailing_semicolon() {
        assert!(ensure_retrieval("-- top rows\nSELECT * FROM t").is_ok());
        assert!(ensure_retrieval("/* hint */ SELECT 1").is_ok());
        assert!(ensure_retrieval("SELECT 1;").is_ok());
        assert!(ensure_retrieval("SELECT 1; -- done").is_ok());
    }

    #[test]
    fn rejects_mutating_statements() {
        assert!(ensure_retrieval("DELETE FROM t").is_err());
        assert!(ensure_retrieval("insert into t values (1)").is_err());
        assert!(ensure_retrieval("UPDATE t SET a = 1").is_err());
        assert!(ensure_retrieval("DROP TABLE t").is_err());
        assert!(ensure_retrieval("  /* x */ TRUNCATE t").is_err());
    }

    #[test]
    fn rejects_empty_and_chained() {
        assert!(ensure_retrieval("").is_err());
        assert!(ensure_retrieval("   -- only a comment").is_err());
        assert!(ensure_retrieval("SELECT 1; DROP TABLE t").is_err());
    }

    #[test]
    fn semicolon_inside_literal_is_fine() {
        assert!(ensure_retrieval("SELECT 'a;b' FROM t").is_ok());
        assert!(ensure_retrieval("SELECT \"col;on\" FROM t").is_ok());
    }
}
