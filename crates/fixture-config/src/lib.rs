//! # Fixture Configuration
//!
//! YAML configuration parser for ssh-fixtures.
//!
//! A `fixtures.yaml` file declares the SSH test images to build and, optionally,
//! the CI pipeline that runs a test suite against them.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod parser;
pub mod resolver;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Environment variable not found
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    /// Image reference not found
    #[error("Image '{0}' not found")]
    ImageNotFound(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Tag that is always excluded from pipeline test runs
pub const LOCAL_TAG: &str = "local";

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Optional project name, used to prefix image tags
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Optional description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,

    /// Image definitions, keyed by fixture name
    pub images: BTreeMap<String, ImageConfig>,

    /// Optional CI pipeline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,
}

impl Config {
    /// Look up an image by fixture name
    pub fn image(&self, name: &str) -> Result<&ImageConfig> {
        self.images
            .get(name)
            .ok_or_else(|| ConfigError::ImageNotFound(name.to_string()))
    }
}

/// Global settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Default log level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Seconds to wait for sshd to answer after a container starts
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: u64,

    /// Seconds allowed for a single image build
    #[serde(default = "default_build_timeout")]
    pub build_timeout: u64,

    /// Address published container ports are bound to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Where pipeline runs store their artifacts
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,

    /// Where the dependency cache lives
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: None,
            ready_timeout: default_ready_timeout(),
            build_timeout: default_build_timeout(),
            bind_address: default_bind_address(),
            artifacts_dir: default_artifacts_dir(),
            cache_dir: default_cache_dir(),
        }
    }
}

/// One SSH-accessible test image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageConfig {
    /// Base image reference, e.g. `centos:7`
    pub base: String,

    /// Extra packages to install (the SSH server is always installed)
    #[serde(default)]
    pub packages: Vec<String>,

    /// The single user allowed to log in
    #[serde(default = "default_user")]
    pub user: String,

    /// How that user authenticates
    #[serde(default)]
    pub auth: AuthConfig,

    /// Port sshd listens on inside the container
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Image tag override; defaults to `<name>-<fixture>:latest`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Authentication method of an image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Public key authentication; a key pair is generated per run when no
    /// public key file is given
    Key {
        /// Path to an OpenSSH public key file
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },

    /// Password authentication; a password is generated per run when none
    /// is given
    Password {
        /// Fixed password
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::Key { public_key: None }
    }
}

/// Pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Dependency manifests hashed into the cache key
    #[serde(default)]
    pub manifests: Vec<String>,

    /// Dependency cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Dependency install command, run from the checkout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<CommandLine>,

    /// Test stage
    pub test: TestConfig,

    /// Artifacts to keep after the run
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

/// Dependency cache settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Whether the cache is used at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefix of every cache key
    #[serde(default = "default_cache_prefix")]
    pub key_prefix: String,

    /// Checkout-relative paths stored in the cache
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: default_cache_prefix(),
            paths: Vec::new(),
        }
    }
}

/// A command, either as a shell line or as an argument vector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CommandLine {
    /// Run through `sh -c`
    Shell(String),
    /// Run directly
    Argv(Vec<String>),
}

impl CommandLine {
    /// True if there is nothing to run
    pub fn is_empty(&self) -> bool {
        match self {
            CommandLine::Shell(line) => line.trim().is_empty(),
            CommandLine::Argv(argv) => argv.first().is_none_or(|p| p.trim().is_empty()),
        }
    }
}

/// Test stage definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestConfig {
    /// The test suite invocation
    pub command: CommandLine,

    /// How tag exclusions are passed to the test command
    #[serde(default)]
    pub runner: TestRunner,

    /// Tags excluded in addition to `local`
    #[serde(default)]
    pub exclude_tags: Vec<String>,

    /// Argument template for the `custom` runner, `{tag}` is replaced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_arg: Option<String>,

    /// Fixtures started for the test stage
    #[serde(default)]
    pub fixtures: Vec<String>,

    /// Extra environment for the test command
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl TestConfig {
    /// The excluded tags, `local` first and without duplicates
    pub fn excluded_tags(&self) -> Vec<String> {
        let mut tags = vec![LOCAL_TAG.to_string()];
        for tag in &self.exclude_tags {
            let tag = tag.trim();
            if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
        tags
    }
}

/// Test runner conventions for excluding tagged tests
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestRunner {
    /// `-m "not local and not ..."`
    #[default]
    Pytest,
    /// `-- --skip local --skip ...`
    ///
    /// libtest's `--skip` matches substrings of test paths, so `local` also
    /// skips `test_localhost_parse`. Keep tagged tests in a module named after
    /// the tag (`local::...`) and avoid the tag elsewhere in test names, or
    /// use `custom` for an exact filter.
    Cargo,
    /// `exclude_arg` repeated per tag
    Custom,
}

/// Artifact collection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ArtifactsConfig {
    /// Checkout-relative files or directories to keep
    #[serde(default)]
    pub paths: Vec<String>,
}

fn default_ready_timeout() -> u64 {
    30
}
fn default_build_timeout() -> u64 {
    900
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_artifacts_dir() -> String {
    "artifacts".to_string()
}
fn default_cache_dir() -> String {
    ".fixtures-cache".to_string()
}
fn default_user() -> String {
    "sshuser".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_cache_prefix() -> String {
    "deps".to_string()
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_tags_always_start_with_local() {
        let test = TestConfig {
            command: CommandLine::Shell("pytest".to_string()),
            runner: TestRunner::Pytest,
            exclude_tags: vec!["slow".to_string(), "local".to_string(), " ".to_string()],
            exclude_arg: None,
            fixtures: vec![],
            env: BTreeMap::new(),
        };

        assert_eq!(test.excluded_tags(), vec!["local", "slow"]);
    }

    #[test]
    fn test_command_line_is_empty() {
        assert!(CommandLine::Shell("  ".to_string()).is_empty());
        assert!(CommandLine::Argv(vec![]).is_empty());
        assert!(!CommandLine::Argv(vec!["pytest".to_string()]).is_empty());
    }

    #[test]
    fn test_default_auth_is_generated_key() {
        assert_eq!(AuthConfig::default(), AuthConfig::Key { public_key: None });
    }
}
