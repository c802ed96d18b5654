//! Error types shared by the core components
//!
//! Every pipeline step converts these into report entries; nothing here
//! is retried internally.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Socket or HTTP failure before a response was obtained
    #[error("transport error: {0}")]
    Transport(String),

    /// A response arrived with an unexpected status code
    #[error("unexpected status {status}: {body}")]
    Protocol { status: u16, body: String },

    /// An exec'd command ran but exited non-zero
    #[error("'{program}' in container '{container}' exited with code {code}: {stderr}")]
    CommandFailed {
        container: String,
        program: String,
        code: i64,
        stderr: String,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// An ownership fix-up inside a container failed
    #[error("permission fix failed: {0}")]
    Permission(String),

    /// An expected file, archive entry or configuration value is absent
    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl AgentError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        AgentError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<bollard::errors::Error> for AgentError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => AgentError::Protocol {
                status: status_code,
                body: message,
            },
            other => AgentError::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => AgentError::Protocol {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => AgentError::Transport(err.to_string()),
        }
    }
}

/// Failure raised by the archive engine
///
/// `code` is the native OS error number when the failure came from the
/// operating system, so callers can tell a full disk from a missing file.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive {path}: {message} (code {code})")]
    Native {
        path: PathBuf,
        code: i32,
        message: String,
    },

    #[error("entry '{entry}' not found in archive {path}")]
    EntryNotFound { path: PathBuf, entry: String },
}

impl ArchiveError {
    pub fn native(path: &Path, err: io::Error) -> Self {
        ArchiveError::Native {
            path: path.to_path_buf(),
            code: err.raw_os_error().unwrap_or(-1),
            message: err.to_string(),
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ArchiveError::Native { code, .. } => Some(*code),
            ArchiveError::EntryNotFound { .. } => None,
        }
    }
}
