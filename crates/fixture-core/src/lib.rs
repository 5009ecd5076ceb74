//! SSH test fixtures
//!
//! Builds container images that run an SSH server authorizing exactly one
//! credential for one user, starts them as ephemeral fixtures, and drives a
//! CI pipeline (dependency cache, install, tests excluding `local`,
//! artifacts) against them.
//!
//! The `docker`, `ssh` and `ssh-keygen` binaries are driven through
//! [`command_executor`]; nothing here talks to the docker API directly.

pub mod artifacts;
pub mod builder;
pub mod cache;
pub mod container;
pub mod credentials;
pub mod dockerfile;
pub mod error;
pub mod fixture;
pub mod pipeline;
pub mod probe;
pub mod spec;
pub mod test_runner;

mod fsutil;
#[cfg(test)]
mod test_support;

pub use builder::{BuiltImage, ImageBuilder};
pub use cache::{CacheKey, CacheOutcome, CacheStore};
pub use container::{ContainerInstance, ContainerOptions, Endpoint};
pub use credentials::{Credential, PublicKey, Secret};
pub use error::{AuthConfigError, BuildError, FixtureError, Result};
pub use fixture::{Fixture, FixtureInfo};
pub use pipeline::{Pipeline, PipelineOptions, PipelineReport, Stage, StageStatus};
pub use probe::{OsRelease, SshProbe};
pub use spec::{AuthMethod, ImageRef, ImageSpec, OsFamily};
