//! Error types for fixture-core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for fixture-core operations
pub type Result<T> = std::result::Result<T, FixtureError>;

/// Lines of engine output kept in build errors
pub const OUTPUT_TAIL_LINES: usize = 30;

/// Image build failures. No image tag exists after any of these.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The base image reference does not parse
    #[error("Invalid base image reference '{reference}': {reason}")]
    InvalidBaseImage {
        /// The reference as configured
        reference: String,
        /// What is wrong with it
        reason: String,
    },

    /// The tag the image would be built under is not a valid reference
    #[error("Invalid image tag '{tag}': {reason}")]
    InvalidTag {
        /// The tag as configured or derived
        tag: String,
        /// What is wrong with it
        reason: String,
    },

    /// No known OS family for the base image
    #[error("Unsupported base image '{0}': cannot tell which package manager it uses")]
    UnsupportedBase(String),

    /// The engine could not pull the base image
    #[error("Base image '{image}' is not available:\n{output_tail}")]
    BaseImageUnavailable {
        /// Base image reference
        image: String,
        /// Last lines of engine output
        output_tail: String,
    },

    /// The package install step failed
    #[error("Package installation failed while building '{tag}':\n{output_tail}")]
    PackageInstall {
        /// Image tag being built
        tag: String,
        /// Last lines of engine output
        output_tail: String,
    },

    /// Any other non-zero engine exit
    #[error("docker build of '{tag}' failed with exit code {exit_code}:\n{output_tail}")]
    EngineFailed {
        /// Image tag being built
        tag: String,
        /// Exit code of `docker build`
        exit_code: i32,
        /// Last lines of engine output
        output_tail: String,
    },

    /// The build ran longer than the configured build timeout
    #[error("docker build of '{tag}' did not finish within {seconds}s")]
    Timeout {
        /// Image tag being built
        tag: String,
        /// Configured timeout
        seconds: u64,
    },
}

/// Credential configuration failures
#[derive(Error, Debug)]
pub enum AuthConfigError {
    /// Configured public key file does not exist
    #[error("Public key file not found: {}", .0.display())]
    MissingKeyFile(PathBuf),

    /// Public key file exists but is not a single OpenSSH public key
    #[error("Malformed public key in {}: {reason}", .path.display())]
    MalformedKey {
        /// Key file
        path: PathBuf,
        /// Parse failure
        reason: String,
    },

    /// Password auth with an empty password
    #[error("Password must not be empty")]
    EmptyPassword,

    /// Password that cannot be set through chpasswd
    #[error("Password must not contain ':' or line breaks")]
    InvalidPassword,

    /// Credential does not match the image's auth method
    #[error("Image expects {expected} authentication but a {found} credential was given")]
    MethodMismatch {
        /// Method of the image
        expected: &'static str,
        /// Method of the credential
        found: &'static str,
    },

    /// `ssh-keygen` failed to produce a key pair
    #[error("Failed to generate SSH key pair: {0}")]
    KeyGeneration(String),
}

/// Errors raised by fixture-core
#[derive(Error, Debug)]
pub enum FixtureError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] fixture_config::ConfigError),

    /// Image build error
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Credential error
    #[error("Auth config error: {0}")]
    AuthConfig(#[from] AuthConfigError),

    /// The dependency install command failed
    #[error("Dependency install failed: {0}")]
    DependencyInstall(String),

    /// The test command could not be executed
    #[error("Test execution failed: {0}")]
    TestExecution(String),

    /// A container failed to start or become reachable
    #[error("Container error: {0}")]
    Container(String),

    /// Dependency cache error
    #[error("Cache error: {0}")]
    Cache(String),

    /// SSH probe error
    #[error("Probe error: {0}")]
    Probe(String),

    /// Command executor error
    #[error("Command execution error: {0}")]
    Command(#[from] command_executor::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FixtureError {
    /// Create a container error
    pub fn container(message: impl Into<String>) -> Self {
        Self::Container(message.into())
    }

    /// Create a cache error
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache(message.into())
    }

    /// Create a probe error
    pub fn probe(message: impl Into<String>) -> Self {
        Self::Probe(message.into())
    }
}
