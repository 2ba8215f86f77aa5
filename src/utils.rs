// ABOUTME: Utility functions for identifier validation and path handling
// ABOUTME: Guards SQL built from configuration against injection

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Validate a SQL identifier taken from configuration (table or column name)
///
/// Lookup-table routing builds its query from configured names, so those names
/// are restricted to a conservative character set before being quoted.
///
/// # Errors
///
/// Returns an error if the identifier is:
/// - Empty or whitespace only
/// - Longer than 128 characters
/// - Not starting with a letter or underscore
/// - Containing anything other than letters, digits and underscores
///
/// # Examples
///
/// ```
/// # use change_router::utils::validate_identifier;
/// assert!(validate_identifier("store_regions").is_ok());
/// assert!(validate_identifier("regions; DROP TABLE x").is_err());
/// assert!(validate_identifier("1st").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    if trimmed.len() > 128 {
        bail!(
            "Identifier '{}' exceeds maximum length of 128 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        );
    }

    let Some(first_char) = trimmed.chars().next() else {
        bail!("Identifier cannot be empty");
    };
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        bail!(
            "Identifier '{}' must start with a letter or underscore, not '{}'",
            sanitize_identifier(trimmed),
            first_char
        );
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Sanitize an identifier for display
///
/// Removes control characters and limits length so configuration values can be
/// echoed into logs and error messages safely.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a SQL identifier, doubling embedded double quotes
///
/// ```
/// # use change_router::utils::quote_ident;
/// assert_eq!(quote_ident("orders"), "\"orders\"");
/// assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
