//! Errors raised by the host store, scan orchestrator, command reliability
//! engine, and wake verification. Converts into [`node_agent_core::Error`]
//! at the crate boundary so callers in `node-agent` see one error type.

use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("host not found: {0}")]
    NotFound(String),

    #[error("uniqueness conflict: {0}")]
    UniquenessConflict(String),

    #[error("failed to connect to store: {0}")]
    Connect(String),

    #[error("failed to initialise schema: {0}")]
    Schema(String),

    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

impl From<StoreError> for node_agent_core::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(s) => node_agent_core::Error::NotFound(s),
            StoreError::UniquenessConflict(s) => node_agent_core::Error::UniquenessConflict(s),
            StoreError::Connect(s) | StoreError::Schema(s) => node_agent_core::Error::Storage(s),
            StoreError::Query(e) => node_agent_core::Error::Storage(e.to_string()),
            StoreError::Validation(s) => node_agent_core::Error::Validation(s),
        }
    }
}
