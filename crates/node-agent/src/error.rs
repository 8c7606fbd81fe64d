//! CLI-specific error types with user-friendly messages and Unix exit codes.

use thiserror::Error;

/// CLI-specific error types, distinct from `node_agent_core::Error` which
/// covers library-level failures.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("invalid argument '--{arg}': {reason}")]
    InvalidArgument { arg: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] node_agent_core::Error),

    #[error(transparent)]
    Store(#[from] node_agent_store::StoreError),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } => exit_codes::INVALID_ARGS,
            Self::Config(_) => exit_codes::CONFIG_ERROR,
            Self::Core(_) | Self::Store(_) => exit_codes::GENERAL_ERROR,
        }
    }
}

/// Exit codes for the CLI (Unix-compatible).
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGS: i32 = 2;
    pub const CONFIG_ERROR: i32 = 6;
    pub const CANCELLED: i32 = 130;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_maps_to_config_exit_code() {
        let err = CliError::Config("missing NODE_ID".to_string());
        assert_eq!(err.exit_code(), exit_codes::CONFIG_ERROR);
    }

    #[test]
    fn invalid_argument_maps_to_invalid_args_exit_code() {
        let err = CliError::InvalidArgument {
            arg: "log-level".to_string(),
            reason: "unknown level".to_string(),
        };
        assert_eq!(err.exit_code(), exit_codes::INVALID_ARGS);
    }
}
