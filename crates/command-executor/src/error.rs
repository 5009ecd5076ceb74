//! Error types for command execution

use thiserror::Error;

/// Unified error type for command execution
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Failed to send signal to process
    #[error("failed to send signal {signal}: {reason}")]
    SignalFailed {
        /// The signal number that failed to send
        signal: i32,
        /// The reason for the signal failure
        reason: String,
    },

    /// Command not found on PATH
    #[error("command not found: {command}")]
    CommandNotFound {
        /// The command that was not found
        command: String,
    },

    /// SSH identity file does not exist
    #[cfg(feature = "ssh")]
    #[error("SSH key not found: {path}")]
    SshKeyNotFound {
        /// The path where the SSH key was expected to be found
        path: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Nix error (Unix signal handling)
    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create a signal failed error
    pub fn signal_failed(signal: i32, reason: impl Into<String>) -> Self {
        Self::SignalFailed {
            signal,
            reason: reason.into(),
        }
    }

    /// Map a spawn-time I/O error, singling out a missing executable
    pub(crate) fn from_spawn(program: &std::ffi::OsStr, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::CommandNotFound {
                command: program.to_string_lossy().into_owned(),
            }
        } else {
            Self::spawn_failed(format!("{}: {}", program.to_string_lossy(), err))
        }
    }

    /// Prefix the error with the layer that produced it (`ssh`)
    pub fn with_layer_context(self, layer: impl Into<String>) -> Self {
        match self {
            Error::SpawnFailed { reason } => Error::SpawnFailed {
                reason: format!("{} layer: {}", layer.into(), reason),
            },
            other => other,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_missing_program_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err = Error::from_spawn(OsStr::new("ssh-keygen"), io);
        assert!(matches!(err, Error::CommandNotFound { ref command } if command == "ssh-keygen"));
    }

    #[test]
    fn test_layer_context() {
        let err = Error::spawn_failed("connection refused").with_layer_context("ssh");
        assert_eq!(
            err.to_string(),
            "failed to spawn process: ssh layer: connection refused"
        );
    }
}
