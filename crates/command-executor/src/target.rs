//! Execution target types
//!
//! Targets say WHERE relative to the launcher a command runs. Fixtures only
//! spawn processes directly; remote execution is layered on top by wrapping
//! the command (see [`SshLauncher`](crate::backends::SshLauncher)).

/// Target types that can be executed by launchers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Target {
    /// One-off process
    #[default]
    Command,
}
