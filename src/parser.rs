//! SQL classification utilities for command kinds, tables and statement ids.

use once_cell::sync::Lazy;
use regex::Regex;

/// The statement kinds that can be toggled for marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl CommandKind {
    /// Classify a SQL statement by its leading keyword.
    ///
    /// Leading comments are skipped, so an already marked statement keeps
    /// its kind. `WITH` is treated as a query.
    pub fn detect(sql: &str) -> Self {
        let body = strip_leading_comments(sql);
        let upper_start: String = body.chars().take(8).collect::<String>().to_uppercase();

        if upper_start.starts_with("SELECT") || upper_start.starts_with("WITH") {
            CommandKind::Select
        } else if upper_start.starts_with("INSERT") {
            CommandKind::Insert
        } else if upper_start.starts_with("UPDATE") {
            CommandKind::Update
        } else if upper_start.starts_with("DELETE") {
            CommandKind::Delete
        } else {
            CommandKind::Other
        }
    }

    /// Upper-case keyword for log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Select => "SELECT",
            CommandKind::Insert => "INSERT",
            CommandKind::Update => "UPDATE",
            CommandKind::Delete => "DELETE",
            CommandKind::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

static SELECT_TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bFROM\s+[`"\[]?(\w+)[`"\]]?"#).unwrap()
});

static INSERT_TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bINSERT\s+INTO\s+[`"\[]?(\w+)[`"\]]?"#).unwrap()
});

static UPDATE_TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bUPDATE\s+[`"\[]?(\w+)[`"\]]?"#).unwrap()
});

static DELETE_TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bDELETE\s+FROM\s+[`"\[]?(\w+)[`"\]]?"#).unwrap()
});

/// Skip any number of leading `/* ... */` and `-- ...` comments.
///
/// An unterminated block comment yields an empty body.
pub fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("/*") {
            match after.find("*/") {
                Some(end) => rest = after[end + 2..].trim_start(),
                None => return "",
            }
        } else if let Some(after) = rest.strip_prefix("--") {
            match after.find('\n') {
                Some(end) => rest = after[end + 1..].trim_start(),
                None => return "",
            }
        } else {
            return rest;
        }
    }
}

/// Extract the primary table name from a SQL statement.
///
/// Returns `None` for unsupported statement kinds or when no table is found.
pub fn extract_table(sql: &str) -> Option<String> {
    let body = strip_leading_comments(sql);

    let regex = match CommandKind::detect(body) {
        CommandKind::Select => &*SELECT_TABLE_REGEX,
        CommandKind::Insert => &*INSERT_TABLE_REGEX,
        CommandKind::Update => &*UPDATE_TABLE_REGEX,
        CommandKind::Delete => &*DELETE_TABLE_REGEX,
        CommandKind::Other => return None,
    };

    regex
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Derive a statement id for SQL that arrives without one.
///
/// Format: `{kind}_{table}` in lower case, or just `{kind}` when the table
/// cannot be determined.
pub fn derive_statement_id(sql: &str) -> String {
    let kind = CommandKind::detect(sql).as_str().to_lowercase();
    match extract_table(sql) {
        Some(table) => format!("{}_{}", kind, table),
        None => kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_kinds() {
        assert_eq!(CommandKind::detect("SELECT * FROM users"), CommandKind::Select);
        assert_eq!(CommandKind::detect("  select id from orders"), CommandKind::Select);
        assert_eq!(
            CommandKind::detect("WITH cte AS (SELECT 1) SELECT * FROM cte"),
            CommandKind::Select
        );
        assert_eq!(
            CommandKind::detect("INSERT INTO users (name) VALUES ($1)"),
            CommandKind::Insert
        );
        assert_eq!(
            CommandKind::detect("UPDATE users SET name = $1 WHERE id = $2"),
            CommandKind::Update
        );
        assert_eq!(CommandKind::detect("DELETE FROM users WHERE id = 1"), CommandKind::Delete);
        assert_eq!(CommandKind::detect("CREATE TABLE t (id INT)"), CommandKind::Other);
        assert_eq!(CommandKind::detect(""), CommandKind::Other);
    }

    #[test]
    fn test_detect_skips_leading_comments() {
        assert_eq!(
            CommandKind::detect("/* existing */ -- note\n UPDATE users SET a = 1"),
            CommandKind::Update
        );
        assert_eq!(
            CommandKind::detect("/* MARKED exec=1 END_MARKED */ DELETE FROM t"),
            CommandKind::Delete
        );
        assert_eq!(CommandKind::detect("/* never closed SELECT 1"), CommandKind::Other);
    }

    #[test]
    fn test_extract_table() {
        assert_eq!(
            extract_table(r#"SELECT * FROM "Users" WHERE id = 1"#),
            Some("users".to_string())
        );
        assert_eq!(
            extract_table("INSERT INTO grades (student_id, score) VALUES ($1, $2)"),
            Some("grades".to_string())
        );
        assert_eq!(
            extract_table("/* hint */ UPDATE students SET name = $1 WHERE id = $2"),
            Some("students".to_string())
        );
        assert_eq!(
            extract_table("DELETE FROM assignments WHERE id = $1"),
            Some("assignments".to_string())
        );
        assert_eq!(extract_table("SELECT 1"), None);
        assert_eq!(extract_table("VACUUM"), None);
    }

    #[test]
    fn test_derive_statement_id() {
        assert_eq!(
            derive_statement_id("SELECT * FROM test_user WHERE name = ?"),
            "select_test_user"
        );
        assert_eq!(derive_statement_id("SELECT now()"), "select");
        assert_eq!(derive_statement_id("BEGIN"), "other");
    }
}
