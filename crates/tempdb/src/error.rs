//! Error types for discovery, provisioning and instance management.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, TempDbError>;

/// Errors surfaced by tempdb. Nothing is retried automatically.
#[derive(Error, Debug)]
pub enum TempDbError {
    /// Malformed version or URI text
    #[error("Parse error: {0}")]
    Parse(String),

    /// Version components that violate the nesting rule
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// No search strategy for this operating system
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Discovery found no installation at all
    #[error("Unable to find any PostgreSQL installation")]
    NoInstallation,

    /// The chosen bin directory lacks a required executable
    #[error("Invalid installation {bin_dir}: {reason}")]
    Installation { bin_dir: PathBuf, reason: String },

    /// Refusal to initialize over existing data
    #[error("Data directory {0} is not empty, a new cluster will not be created")]
    NotEmpty(PathBuf),

    /// initdb exited with a failure status
    #[error("initdb failed ({status}): {stderr}")]
    Provisioning { status: ExitStatus, stderr: String },

    /// The server exited before its socket became ready
    #[error("Server exited before becoming ready ({status}): {output}")]
    Startup { status: ExitStatus, output: String },

    /// The server did not create its socket within the startup timeout
    #[error("Server did not become ready within {0:?}")]
    StartupTimeout(Duration),

    /// Database name already taken
    #[error("Database already exists: {0}")]
    AlreadyExists(String),

    /// Database name unknown
    #[error("Database not found: {0}")]
    NotFound(String),

    /// Operation on an instance that has been closed
    #[error("Instance is closed")]
    Closed,

    /// Removing a transient data directory failed after shutdown
    #[error("Failed to remove {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sql(#[from] sqlx::Error),

    /// IO error (file system and process operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TempDbError {
    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an installation error for `bin_dir`.
    pub fn installation(bin_dir: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Installation {
            bin_dir: bin_dir.into(),
            reason: reason.into(),
        }
    }
}
