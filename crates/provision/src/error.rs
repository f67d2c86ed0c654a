//! Provisioning error types.

use thiserror::Error;

/// SQLSTATE `object_in_use`: the template still has open connections.
pub(crate) const SQLSTATE_OBJECT_IN_USE: &str = "55006";
/// SQLSTATE `invalid_catalog_name`: the database does not exist.
pub(crate) const SQLSTATE_INVALID_CATALOG_NAME: &str = "3D000";
/// SQLSTATE `duplicate_database`.
pub(crate) const SQLSTATE_DUPLICATE_DATABASE: &str = "42P04";

/// Database provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("database not found: {0}")]
    NotFound(String),

    #[error("database already exists: {0}")]
    AlreadyExists(String),

    #[error("source database {0} is being accessed by other users")]
    SourceBusy(String),

    #[error("invalid database name: {0}")]
    InvalidName(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Internal(String),
}

impl From<cask_core::Error> for ProvisionError {
    fn from(err: cask_core::Error) -> Self {
        match err {
            cask_core::Error::InvalidName(name) => Self::InvalidName(name),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl ProvisionError {
    /// SQLSTATE of an underlying database error, if any.
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
            _ => None,
        }
    }
}

/// Result type for provisioning operations.
pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;
