//! Error types for the appliance control plane

use thiserror::Error;

/// Result type alias using the control plane Error
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum number of characters of command output kept on a failed shell step
pub const OUTPUT_TAIL_CHARS: usize = 2000;

/// Control plane error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot reach {target}: {reason}")]
    Connectivity { target: String, reason: String },

    #[error("Appliance {address} failed step `{step}`:\n{output_tail}")]
    ShellStep {
        address: String,
        step: String,
        output_tail: String,
    },

    #[error("Timed out after {seconds}s waiting for {condition}")]
    Readiness { condition: String, seconds: u64 },

    #[error("Configuration lookup failed: {0}")]
    ConfigLookup(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Table {table} could not be reflected: {reason}")]
    Reflection { table: String, reason: String },

    #[error("Table {0} could not be found")]
    NoSuchTable(String),

    #[error("Authentication failed for {user}@{host}")]
    Authentication { user: String, host: String },

    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Provider error: {0}")]
    Provider(String),
}

impl Error {
    /// Build a shell step failure, keeping only the tail of the command output
    pub fn shell_step(address: impl Into<String>, step: impl Into<String>, output: &str) -> Self {
        Error::ShellStep {
            address: address.into(),
            step: step.into(),
            output_tail: tail(output, OUTPUT_TAIL_CHARS).to_string(),
        }
    }

    /// Build a readiness timeout for the named condition
    pub fn readiness(condition: impl Into<String>, timeout: std::time::Duration) -> Self {
        Error::Readiness {
            condition: condition.into(),
            seconds: timeout.as_secs(),
        }
    }

    /// Name of the awaited condition if this is a readiness timeout
    pub fn readiness_condition(&self) -> Option<&str> {
        match self {
            Error::Readiness { condition, .. } => Some(condition),
            _ => None,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connectivity { .. })
    }

    pub fn is_invariant(&self) -> bool {
        matches!(self, Error::Invariant(_))
    }
}

/// Last `max_chars` characters of `output`, respecting char boundaries
fn tail(output: &str, max_chars: usize) -> &str {
    let count = output.chars().count();
    if count <= max_chars {
        return output;
    }
    let skip = count - max_chars;
    let (idx, _) = output
        .char_indices()
        .nth(skip)
        .unwrap_or((output.len(), ' '));
    &output[idx..]
}
