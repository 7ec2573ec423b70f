//! Catalog statements and identifier quoting for the administrative
//! connection.

use crate::error::{Result, TempDbError};

/// Databases every fresh cluster contains. Never listed to callers.
pub const BUILTIN_DATABASES: &[&str] = &["postgres", "template0", "template1"];

/// Database the administrative connection attaches to.
pub const ADMIN_DATABASE: &str = "postgres";

pub const LIST_DATABASES: &str = "SELECT datname::text FROM pg_database";

pub const DATABASE_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname::text = $1)";

/// Disconnects every client except the calling session.
pub const TERMINATE_OTHER_BACKENDS: &str = r#"
    SELECT pg_terminate_backend(pid)
    FROM pg_stat_activity
    WHERE pid <> pg_backend_pid()
      AND datname IS NOT NULL
"#;

/// Quote an identifier for interpolation into DDL.
///
/// Embedded double quotes are doubled. NUL bytes cannot be represented in a
/// PostgreSQL identifier and are rejected, as are empty names.
pub fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(TempDbError::parse("identifier is empty"));
    }
    if name.contains('\0') {
        return Err(TempDbError::parse("identifier contains a NUL byte"));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// `CREATE DATABASE` with an optional template.
pub fn create_database(name: &str, template: Option<&str>) -> Result<String> {
    let mut sql = format!("CREATE DATABASE {}", quote_ident(name)?);
    if let Some(template) = template {
        sql.push_str(" TEMPLATE ");
        sql.push_str(&quote_ident(template)?);
    }
    Ok(sql)
}

pub fn is_builtin_database(name: &str) -> bool {
    BUILTIN_DATABASES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_basic() {
        assert_eq!(quote_ident("tmp").unwrap(), "\"tmp\"");
        assert_eq!(quote_ident("Mixed Case").unwrap(), "\"Mixed Case\"");
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(
            quote_ident(r#"evil"; DROP DATABASE x; --"#).unwrap(),
            r#""evil""; DROP DATABASE x; --""#
        );
    }

    #[test]
    fn test_quote_ident_rejects_invalid() {
        assert!(quote_ident("").is_err());
        assert!(quote_ident("a\0b").is_err());
    }

    #[test]
    fn test_create_database_statement() {
        assert_eq!(
            create_database("tmp", None).unwrap(),
            "CREATE DATABASE \"tmp\""
        );
        assert_eq!(
            create_database("tmp", Some("template0")).unwrap(),
            "CREATE DATABASE \"tmp\" TEMPLATE \"template0\""
        );
    }

    #[test]
    fn test_builtin_databases() {
        assert!(is_builtin_database("postgres"));
        assert!(is_builtin_database("template0"));
        assert!(is_builtin_database("template1"));
        assert!(!is_builtin_database("tmp"));
    }
}
