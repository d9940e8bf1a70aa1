// ABOUTME: Utility functions for identifier handling and retries
// ABOUTME: Provides table-name validation, SQL identifier quoting, and retry logic

use anyhow::{bail, Result};
use std::time::Duration;

/// Validate a table name taken from a jobs file
///
/// Table names end up interpolated into SQL, so only plain identifiers are
/// accepted: `[A-Za-z_][A-Za-z0-9_]*`, optionally with a single `schema.` prefix.
///
/// # Examples
///
/// ```
/// # use table_mover::utils::validate_table_name;
/// assert!(validate_table_name("location").is_ok());
/// assert!(validate_table_name("public.current_weather").is_ok());
/// assert!(validate_table_name("users; DROP TABLE users").is_err());
/// assert!(validate_table_name("").is_err());
/// ```
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("Table name cannot be empty");
    }

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        bail!(
            "Invalid table name '{}': at most one schema qualifier is allowed",
            sanitize_identifier(name)
        );
    }

    for part in parts {
        let mut chars = part.chars();
        let valid_start = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!(
                "Invalid table name '{}': only letters, digits and underscores are allowed",
                sanitize_identifier(name)
            );
        }
    }

    Ok(())
}

/// Quote an identifier with the given quote character, doubling embedded quotes
///
/// Schema-qualified names (`schema.table`) are quoted part by part.
///
/// # Examples
///
/// ```
/// # use table_mover::utils::quote_ident;
/// assert_eq!(quote_ident("location", '"'), "\"location\"");
/// assert_eq!(quote_ident("public.location", '"'), "\"public\".\"location\"");
/// assert_eq!(quote_ident("odd`name", '`'), "`odd``name`");
/// ```
pub fn quote_ident(name: &str, quote: char) -> String {
    name.split('.')
        .map(|part| {
            let escaped = part.replace(quote, &format!("{quote}{quote}"));
            format!("{quote}{escaped}{quote}")
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Quote a column name; unlike tables, columns are never schema-qualified
pub fn quote_column(name: &str, quote: char) -> String {
    let escaped = name.replace(quote, &format!("{quote}{quote}"));
    format!("{quote}{escaped}{quote}")
}

/// Retry a function with exponential backoff
///
/// Executes an async operation with automatic retry on failure. Each retry doubles
/// the delay (exponential backoff) to handle transient failures gracefully.
///
/// # Arguments
///
/// * `operation` - Async function to retry (FnMut returning Future\<Output = Result\<T\>\>)
/// * `max_retries` - Maximum number of retry attempts (0 = no retries, just initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                last_error = Some(e);

                if attempt < max_retries {
                    tracing::warn!(
                        "Operation failed (attempt {}/{}), retrying in {:?}...",
                        attempt + 1,
                        max_retries + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Operation failed after retries")))
}

/// Sanitize an identifier (table name, column name, etc.) for display
///
/// Removes control characters and limits length to prevent log injection and
/// keep error messages readable. Display only; SQL goes through [`quote_ident`].
///
/// # Examples
///
/// ```
/// # use table_mover::utils::sanitize_identifier;
/// assert_eq!(sanitize_identifier("normal_table"), "normal_table");
/// assert_eq!(sanitize_identifier("table\nname"), "tablename");
/// ```
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}
