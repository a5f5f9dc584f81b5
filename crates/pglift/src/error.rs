use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// An external command exited with a non-zero status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    /// The command line, with secrets already masked.
    pub cmd: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command '{}' failed with exit code {}",
            self.cmd.join(" "),
            self.exit_code
        )?;
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {}", stderr)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandError {}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("invalid setting '{field}': {message}")]
    Invalid { field: String, message: String },

    #[error("failed to read settings file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings from {origin}: {message}")]
    Parse { origin: String, message: String },
}

impl SettingsError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        SettingsError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("instance {0} already exists")]
    InstanceAlreadyExists(String),

    #[error("instance state error: {0}")]
    InstanceState(String),

    #[error("instance {0} is read-only")]
    InstanceReadOnly(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("invalid configuration in '{path}': {message}")]
    Configuration { path: PathBuf, message: String },

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("database {0} not found")]
    DatabaseNotFound(String),

    #[error("role {0} not found")]
    RoleNotFound(String),

    #[error("database dump {0} not found")]
    DatabaseDumpNotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl Error {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            return Error::FileNotFound(path);
        }
        Error::Io { path, source }
    }

    /// Process exit code for a command-line front-end.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InstanceNotFound(_) => 3,
            Error::InstanceState(_) => 4,
            Error::Cancelled(_) => 5,
            Error::Validation(_) | Error::Settings(_) => 2,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
