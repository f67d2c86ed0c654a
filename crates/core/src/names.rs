//! Generated resource names and identifier validation.

use uuid::Uuid;

/// Maximum identifier length PostgreSQL keeps without truncation.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// A fresh database name: `test_` followed by 10 lowercase hex characters.
pub fn random_database_name() -> String {
    random_name("test")
}

/// A fresh `<prefix>_<10 hex>` name for containers and networks.
pub fn random_name(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &id[..10])
}

/// Check that `name` is a plain lowercase identifier safe to splice into DDL.
pub fn validate_identifier(name: &str) -> crate::Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(crate::Error::InvalidName(name.to_string()));
    }
    Ok(())
}
