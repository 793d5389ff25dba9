//! Free-SQL validation for the `sql` escape hatch.
//!
//! A statement passes only if its first token (after stripping comments
//! and string literals) is SELECT, WITH, or EXPLAIN, it is a single
//! statement, and no forbidden keyword, writable CTE, or dangerous
//! function appears anywhere. Keyword checks run twice: once on the
//! stripped copy and once on the raw input, so a payload hidden inside
//! a comment or literal is still caught.

use regex::Regex;

use atlas_core::error::{AtlasError, AtlasResult};

/// Keywords rejected anywhere in the statement.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
];

/// Keywords rejected in the statement body.
const BODY_FORBIDDEN: &[&str] = &["UNION", "INTO", "COPY"];

/// Function names rejected anywhere.
const DANGEROUS_FUNCTIONS: &[&str] = &[
    "pg_sleep",
    "lo_import",
    "lo_export",
    "pg_read_file",
    "pg_write_file",
    "load_file",
    "sleep",
    "benchmark",
];

/// Validates free SQL against the read-only allowlist.
pub struct SqlValidator {
    forbidden: Regex,
    body_forbidden: Regex,
    dangerous: Regex,
    writable_cte: Regex,
}

impl SqlValidator {
    /// Compile the validator's patterns.
    pub fn new() -> Self {
        let word_alternation = |words: &[&str]| words.join("|");
        Self {
            forbidden: Regex::new(&format!(
                r"(?i)\b({})\b",
                word_alternation(FORBIDDEN_KEYWORDS)
            ))
            .expect("forbidden keyword pattern compiles"),
            body_forbidden: Regex::new(&format!(
                r"(?i)\b({})\b",
                word_alternation(BODY_FORBIDDEN)
            ))
            .expect("body keyword pattern compiles"),
            dangerous: Regex::new(&format!(
                r"(?i)\b({})\b",
                word_alternation(DANGEROUS_FUNCTIONS)
            ))
            .expect("dangerous function pattern compiles"),
            writable_cte: Regex::new(r"(?is)\bWITH\b.*\bAS\s*\(\s*(DELETE|UPDATE|INSERT)\b")
                .expect("writable CTE pattern compiles"),
        }
    }

    /// Validate one statement. Rejection reasons are stable strings.
    pub fn validate(&self, sql: &str) -> AtlasResult<()> {
        let stripped = strip_literals_and_comments(sql);
        let trimmed = stripped.trim();

        if trimmed.is_empty() {
            return Err(rejected("empty statement"));
        }

        // First token allowlist.
        let first = trimmed
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        let first = first.trim_start_matches('(').to_string();
        if first != "SELECT" && first != "WITH" && first != "EXPLAIN" {
            return Err(rejected("only SELECT, WITH, or EXPLAIN statements are allowed"));
        }

        // A semicolon followed by anything is a second statement.
        if let Some(pos) = trimmed.find(';') {
            if !trimmed[pos + 1..].trim().is_empty() {
                return Err(rejected("multiple statements are not allowed"));
            }
        }

        // Both the stripped copy and the raw input are checked, so
        // comment-hidden payloads still trip the keyword rules.
        for text in [trimmed, sql] {
            if let Some(found) = self.writable_cte.captures(text) {
                return Err(rejected(&format!(
                    "writable common table expressions are not allowed ({})",
                    found.get(1).map_or("", |m| m.as_str()).to_ascii_uppercase()
                )));
            }
            if let Some(found) = self.forbidden.find(text) {
                return Err(rejected(&format!(
                    "forbidden keyword: {}",
                    found.as_str().to_ascii_uppercase()
                )));
            }
            if let Some(found) = self.body_forbidden.find(text) {
                return Err(rejected(&format!(
                    "forbidden keyword: {}",
                    found.as_str().to_ascii_uppercase()
                )));
            }
            if let Some(found) = self.dangerous.find(text) {
                return Err(rejected(&format!(
                    "dangerous function: {}",
                    found.as_str().to_lowercase()
                )));
            }
        }

        Ok(())
    }
}

impl Default for SqlValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn rejected(reason: &str) -> AtlasError {
    AtlasError::SqlRejected { reason: reason.to_string() }
}

/// Remove string literals and comments, preserving everything else.
///
/// Handles `'...'` with `''` escapes, `"..."` quoted identifiers,
/// `-- ...` line comments, and `/* ... */` block comments (unnested).
fn strip_literals_and_comments(sql: &str) -> String {
    let bytes: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            '\'' | '"' => {
                let quote = c;
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // Doubled quote escapes itself.
                        if i + 1 < bytes.len() && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                out.push(' ');
            }
            '-' if i + 1 < bytes.len() && bytes[i + 1] == '-' => {
                while i < bytes.len() && bytes[i] != '\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == '*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == '*' && bytes[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                out.push(' ');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SqlValidator {
        SqlValidator::new()
    }

    #[test]
    fn test_accepts_plain_selects() {
        let v = validator();
        assert!(v.validate("SELECT * FROM users WHERE id = 1").is_ok());
        assert!(v.validate("select count(*) from posts").is_ok());
        assert!(v.validate("EXPLAIN SELECT 1").is_ok());
        assert!(v.validate("WITH recent AS (SELECT * FROM posts) SELECT * FROM recent").is_ok());
    }

    #[test]
    fn test_trailing_semicolon_alone_is_fine() {
        assert!(validator().validate("SELECT 1;").is_ok());
    }

    #[test]
    fn test_rejects_non_select_first_token() {
        let v = validator();
        for sql in ["DELETE FROM users", "VACUUM", "SHOW TABLES", "BEGIN"] {
            let err = v.validate(sql).expect_err(sql);
            assert!(err.to_string().starts_with("Rejected: "), "{err}");
        }
    }

    #[test]
    fn test_rejects_multiple_statements() {
        let err = validator()
            .validate("SELECT 1; DROP TABLE users")
            .expect_err("multi");
        assert_eq!(err.to_string(), "Rejected: multiple statements are not allowed");
    }

    #[test]
    fn test_rejects_comment_hidden_dml() {
        // The semicolon hides inside a comment; the DML survives on the
        // next line and the raw-input check must catch it.
        let err = validator()
            .validate("SELECT 1 --;\nDELETE FROM users")
            .expect_err("hidden");
        assert_eq!(err.kind(), atlas_core::ErrorKind::SqlRejected);
    }

    #[test]
    fn test_rejects_every_forbidden_keyword_any_case() {
        let v = validator();
        for keyword in super::FORBIDDEN_KEYWORDS {
            for cased in [keyword.to_string(), keyword.to_lowercase(), mixed_case(keyword)] {
                let sql = format!("{cased} FROM t");
                assert!(v.validate(&sql).is_err(), "{sql} must be rejected");
            }
        }
    }

    fn mixed_case(word: &str) -> String {
        word.chars()
            .enumerate()
            .map(|(i, c)| {
                if i % 2 == 0 {
                    c.to_ascii_lowercase()
                } else {
                    c.to_ascii_uppercase()
                }
            })
            .collect()
    }

    #[test]
    fn test_rejects_body_keywords() {
        let v = validator();
        assert!(v.validate("SELECT * FROM a UNION SELECT * FROM b").is_err());
        assert!(v.validate("SELECT * INTO outfile FROM users").is_err());
        assert!(v.validate("SELECT 1 COPY something").is_err());
    }

    #[test]
    fn test_rejects_writable_cte() {
        let err = validator()
            .validate("WITH doomed AS (DELETE FROM users RETURNING *) SELECT * FROM doomed")
            .expect_err("writable cte");
        assert_eq!(err.kind(), atlas_core::ErrorKind::SqlRejected);
    }

    #[test]
    fn test_rejects_dangerous_functions() {
        let v = validator();
        for call in [
            "SELECT pg_sleep(10)",
            "SELECT PG_SLEEP(10)",
            "SELECT load_file('/etc/passwd')",
            "SELECT benchmark(1000000, md5('x'))",
            "SELECT sleep(5)",
        ] {
            assert!(v.validate(call).is_err(), "{call} must be rejected");
        }
    }

    #[test]
    fn test_literals_do_not_shadow_keywords() {
        // A literal containing a keyword is stripped before the
        // stripped-copy check but still caught by the raw check; the
        // validator is deliberately conservative here.
        let v = validator();
        assert!(v.validate("SELECT * FROM audit WHERE action = 'DELETE'").is_err());
    }

    #[test]
    fn test_strip_removes_literals_and_comments() {
        let stripped = strip_literals_and_comments(
            "SELECT 'a; b' -- trailing\n, \"col\" /* block */ FROM t",
        );
        assert!(!stripped.contains("a; b"));
        assert!(!stripped.contains("trailing"));
        assert!(!stripped.contains("block"));
        assert!(stripped.contains("FROM t"));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(validator().validate("   ").is_err());
        assert!(validator().validate("-- only a comment").is_err());
    }
}
