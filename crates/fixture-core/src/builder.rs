//! Image builder driving `docker build`

use crate::credentials::Credential;
use crate::dockerfile::{FINGERPRINT_LABEL, context_files, render_dockerfile};
use crate::error::{BuildError, OUTPUT_TAIL_LINES, Result};
use crate::spec::ImageSpec;
use command_executor::backends::local::LocalLauncher;
use command_executor::{Command, ExitResult, Launcher, Target};
use sha2::{Digest, Sha256};
use std::env;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default limit for a single image build
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(900);

/// Engine output meaning the base image could not be pulled
const PULL_FAILURES: &[&str] = &[
    "pull access denied",
    "manifest unknown",
    "not found: manifest",
    "failed to resolve source metadata",
    "repository does not exist",
];

/// Package manager output naming packages that do not exist
const PACKAGE_FAILURES: &[&str] = &[
    "Unable to locate package",
    "No package",
    "No match for argument",
    "unable to select packages",
];

/// An image that exists in the local engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Image tag
    pub tag: String,
    /// Value of the fingerprint label
    pub fingerprint: String,
    /// True if an existing image was reused instead of built
    pub reused: bool,
}

/// Builds fixture images through the `docker` CLI
#[derive(Debug, Clone)]
pub struct ImageBuilder<L = LocalLauncher> {
    launcher: L,
    force: bool,
    build_timeout: Duration,
    gha_cache: bool,
}

impl ImageBuilder<LocalLauncher> {
    /// Builder running `docker` locally
    pub fn new() -> Self {
        Self::with_launcher(LocalLauncher)
    }
}

impl Default for ImageBuilder<LocalLauncher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> ImageBuilder<L>
where
    L: Launcher<Target = Target>,
{
    /// Builder running `docker` through `launcher`. Uses the GitHub Actions
    /// build cache when `GITHUB_ACTIONS` is set.
    pub fn with_launcher(launcher: L) -> Self {
        Self {
            launcher,
            force: false,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            gha_cache: env::var("GITHUB_ACTIONS").is_ok(),
        }
    }

    /// Always rebuild, even when a matching image exists
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Limit for a single build
    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    /// Toggle `--cache-from/--cache-to type=gha`
    pub fn gha_cache(mut self, enabled: bool) -> Self {
        self.gha_cache = enabled;
        self
    }

    /// Digest of the rendered Dockerfile and the authorized credential.
    /// Images whose label matches can be reused as they are.
    pub fn fingerprint(spec: &ImageSpec, credential: &Credential) -> String {
        let mut hasher = Sha256::new();
        hasher.update(render_dockerfile(spec).as_bytes());
        hasher.update(b"\0");
        hasher.update(credential.digest().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Reuse the image tagged `spec.tag` if it was built from the same
    /// Dockerfile and credential, otherwise build it
    pub async fn ensure(&self, spec: &ImageSpec, credential: &Credential) -> Result<BuiltImage> {
        credential.check_method(&spec.auth)?;
        let fingerprint = Self::fingerprint(spec, credential);

        if !self.force {
            match self.image_fingerprint(&spec.tag).await? {
                Some(existing) if existing == fingerprint => {
                    info!(image = %spec.tag, "Reusing existing image");
                    return Ok(BuiltImage {
                        tag: spec.tag.clone(),
                        fingerprint,
                        reused: true,
                    });
                }
                Some(_) => debug!(image = %spec.tag, "Existing image is stale, rebuilding"),
                None => debug!(image = %spec.tag, "Image not found, building"),
            }
        }

        self.build(spec, credential).await
    }

    /// Build `spec` with `credential` authorized
    pub async fn build(&self, spec: &ImageSpec, credential: &Credential) -> Result<BuiltImage> {
        credential.check_method(&spec.auth)?;
        let fingerprint = Self::fingerprint(spec, credential);

        let context = tempfile::Builder::new()
            .prefix("fixture-build-")
            .tempdir()?;
        let dockerfile = context.path().join("Dockerfile");
        std::fs::write(&dockerfile, render_dockerfile(spec))?;
        for (name, contents) in context_files(spec, credential) {
            std::fs::write(context.path().join(name), contents)?;
        }

        let mut cmd = Command::new("docker");
        cmd.arg("build")
            .arg("-t")
            .arg(&spec.tag)
            .arg("--label")
            .arg(format!("{}={}", FINGERPRINT_LABEL, fingerprint))
            .arg("-f")
            .arg(&dockerfile);
        if self.gha_cache {
            info!("Running in GitHub Actions, using the gha build cache");
            cmd.args(["--cache-from", "type=gha", "--cache-to", "type=gha,mode=max"]);
        }
        cmd.arg(context.path());

        info!(image = %spec.tag, base = %spec.base, family = %spec.family, "Building image");
        let tag = spec.tag.clone();
        let build = self
            .launcher
            .execute_with(&Target::Command, cmd, |_, line| debug!(image = %tag, "{}", line));
        let timeout = async {
            smol::Timer::after(self.build_timeout).await;
            None
        };
        let result = smol::future::or(async { Some(build.await) }, timeout).await;

        let result = match result {
            Some(result) => result?,
            None => {
                self.discard(&spec.tag).await;
                return Err(BuildError::Timeout {
                    tag: spec.tag.clone(),
                    seconds: self.build_timeout.as_secs(),
                }
                .into());
            }
        };

        if !result.success() {
            self.discard(&spec.tag).await;
            return Err(classify_failure(spec, &result).into());
        }

        info!(image = %spec.tag, "Built image");
        Ok(BuiltImage {
            tag: spec.tag.clone(),
            fingerprint,
            reused: false,
        })
    }

    /// Remove an image. Failures are logged, not returned.
    pub async fn remove(&self, tag: &str) -> Result<bool> {
        let cmd = Command::builder("docker").args(["rmi", tag]).build();
        let result = self.launcher.execute(&Target::Command, cmd).await?;
        if result.success() {
            info!(image = %tag, "Removed image");
        } else {
            warn!(image = %tag, "Failed to remove image: {}", result.output.trim());
        }
        Ok(result.success())
    }

    /// True if an image with this tag exists
    pub async fn image_exists(&self, tag: &str) -> Result<bool> {
        let cmd = Command::builder("docker").args(["images", "-q", tag]).build();
        let result = self.launcher.execute(&Target::Command, cmd).await?;
        Ok(result.success() && !result.output.trim().is_empty())
    }

    /// Fingerprint label of an existing image; `None` if there is no image
    async fn image_fingerprint(&self, tag: &str) -> Result<Option<String>> {
        if !self.image_exists(tag).await? {
            return Ok(None);
        }
        let format = format!("{{{{ index .Config.Labels \"{}\" }}}}", FINGERPRINT_LABEL);
        let cmd = Command::builder("docker")
            .args(["image", "inspect", "--format", &format, tag])
            .build();
        let result = self.launcher.execute(&Target::Command, cmd).await?;
        if !result.success() {
            return Ok(None);
        }
        Ok(Some(result.output.trim().to_string()))
    }

    /// Drop whatever a failed build left under `tag`
    async fn discard(&self, tag: &str) {
        let cmd = Command::builder("docker").args(["rmi", "-f", tag]).build();
        if let Err(e) = self.launcher.execute(&Target::Command, cmd).await {
            debug!(image = %tag, "Failed to discard image: {}", e);
        }
    }
}

/// Map a failed `docker build` to the matching [`BuildError`]
pub fn classify_failure(spec: &ImageSpec, result: &ExitResult) -> BuildError {
    let output_tail = result.tail(OUTPUT_TAIL_LINES);
    let lower = result.output.to_lowercase();

    if PULL_FAILURES.iter().any(|p| lower.contains(p)) {
        return BuildError::BaseImageUnavailable {
            image: spec.base.to_string(),
            output_tail,
        };
    }

    let marker = spec.family.install_marker();
    let install_step_failed = result.output.lines().any(|line| {
        line.contains(marker)
            && (line.contains("did not complete successfully")
                || line.contains("returned a non-zero code"))
    });
    if install_step_failed || PACKAGE_FAILURES.iter().any(|p| result.output.contains(p)) {
        return BuildError::PackageInstall {
            tag: spec.tag.clone(),
            output_tail,
        };
    }

    BuildError::EngineFailed {
        tag: spec.tag.clone(),
        exit_code: result.status.exit_code(),
        output_tail,
    }
}
