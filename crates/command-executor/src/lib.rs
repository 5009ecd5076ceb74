//! Runtime-agnostic command execution library
//!
//! Commands are described once with [`Command`] and handed to a [`Launcher`],
//! which decides where they run: as a local process, or on a remote host
//! over SSH.

#![warn(missing_docs)]

pub mod backends;
pub mod command;
pub mod error;
pub mod event;
pub mod launcher;
pub mod process;
pub mod target;

pub use command::{Command, shell_escape};
pub use error::{Error, Result};
pub use event::{LogSource, ProcessEvent, ProcessEventType};
pub use launcher::Launcher;
pub use process::{ExitResult, ExitStatus, ProcessHandle};
pub use target::Target;
