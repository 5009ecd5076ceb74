//! Backend implementations for different execution contexts
//!
//! [`local::LocalLauncher`] spawns processes on this machine.
//! [`ssh::SshLauncher`] wraps any other launcher and forwards the command to
//! a remote host.

pub mod local;
pub use local::LocalLauncher;

#[cfg(feature = "ssh")]
pub mod ssh;
#[cfg(feature = "ssh")]
pub use ssh::{SshAuth, SshConfig, SshLauncher};
