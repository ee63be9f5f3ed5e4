//! Error types for the hypervisor.
//!
//! One enum covers the whole daemon: remote command execution, inventory
//! HTTP traffic, and the various parse stages. Per-instance errors are
//! caught by the reconciler loop; only configuration errors abort startup.

use thiserror::Error;

/// Result type for hypervisor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for all hypervisor operations
#[derive(Error, Debug)]
pub enum Error {
    /// A required client binary is missing from PATH
    #[error("{binary} binary not found in PATH")]
    BinaryNotFound {
        /// Name of the missing binary
        binary: String,
    },

    /// A remote command exited non-zero
    #[error("command failed on {host}: {command} (exit {exit_code})")]
    CommandFailed {
        /// Host the command ran on
        host: String,
        /// The command that failed
        command: String,
        /// Exit code returned by the command
        exit_code: i32,
        /// Standard output from the command
        stdout: String,
        /// Standard error from the command
        stderr: String,
    },

    /// Failed to parse output or a document
    #[error("failed to parse {context}: {message}")]
    Parse {
        /// What was being parsed
        context: String,
        /// Error message describing the parse failure
        message: String,
    },

    /// Invalid configuration provided
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message describing the configuration issue
        message: String,
    },

    /// The requested instance is not in the desired set
    #[error("unknown level instance: {id}")]
    UnknownInstance {
        /// Instance id that was not found
        id: String,
    },

    /// Inventory HTTP request failed
    #[error("inventory request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// YAML parsing or serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error occurred during operation
    #[error("IO error: {message}")]
    Io {
        /// Error message describing the IO failure
        message: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a new command failed error
    pub fn command_failed(
        host: impl Into<String>,
        command: impl Into<String>,
        exit_code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            host: host.into(),
            command: command.into(),
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a new parse error
    pub fn parse(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new unknown instance error
    pub fn unknown_instance(id: impl Into<String>) -> Self {
        Self::UnknownInstance { id: id.into() }
    }

    /// Create a new missing binary error
    pub fn binary_not_found(binary: impl Into<String>) -> Self {
        Self::BinaryNotFound {
            binary: binary.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}
