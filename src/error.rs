//! Error types for the mapping layer
//!
//! Schema errors are raised while the [Schema](crate::orm::Schema) is being
//! built and are fatal at startup. Compile errors are raised by the query
//! builder before anything reaches the database. Driver errors are passed
//! through untouched.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = OrmError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone)]
pub enum OrmError {
    #[error("Entity already registered: {0}")]
    DuplicateEntity(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Invalid mapping for {entity}: {reason}")]
    InvalidMapping { entity: String, reason: String },

    #[error("Invalid relation {relation}: {reason}")]
    InvalidRelation { relation: String, reason: String },

    #[error("Alias \"{0}\" is already declared in this query")]
    DuplicateAlias(String),

    #[error("No value supplied for parameter :{0}")]
    UnboundParameter(String),

    #[error("Query compile error: {0}")]
    CompileError(String),

    #[error("Result mapping error: {0}")]
    MappingError(String),

    #[error("Query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("Database error: {0}")]
    Driver(Arc<sqlx::Error>),

    #[error("JSON error: {0}")]
    Serialization(Arc<serde_json::Error>),
}

impl OrmError {
    pub(crate) fn compile(message: impl Into<String>) -> Self {
        OrmError::CompileError(message.into())
    }

    pub(crate) fn mapping(message: impl Into<String>) -> Self {
        OrmError::MappingError(message.into())
    }

    pub(crate) fn relation(relation: impl Into<String>, reason: impl Into<String>) -> Self {
        OrmError::InvalidRelation {
            relation: relation.into(),
            reason: reason.into(),
        }
    }

    /// True for errors detected before any database round-trip.
    pub fn is_compile_time(&self) -> bool {
        matches!(
            self,
            OrmError::DuplicateAlias(_)
                | OrmError::UnboundParameter(_)
                | OrmError::CompileError(_)
                | OrmError::UnknownEntity(_)
                | OrmError::InvalidRelation { .. }
        )
    }
}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        OrmError::Driver(Arc::new(err))
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::Serialization(Arc::new(err))
    }
}
