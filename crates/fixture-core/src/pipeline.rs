//! The CI pipeline: restore cache, install, save cache, provision fixtures,
//! test, collect artifacts, tear down.
//!
//! Stages run strictly one after another. A failing install, provision or
//! test spawn ends the run early, but artifacts are still collected and the
//! report is still written before the error is returned. A test suite that
//! runs and exits non-zero is not an error: it is recorded in the report and
//! reflected by [`PipelineReport::exit_code`].

use crate::artifacts::ArtifactCollector;
use crate::builder::ImageBuilder;
use crate::cache::{CacheKey, CacheOutcome, CacheStore};
use crate::error::{FixtureError, OUTPUT_TAIL_LINES, Result};
use crate::fixture::{Fixture, FixtureInfo};
use crate::spec::ImageSpec;
use crate::test_runner::{TestSummary, build_invocation, run_tests};
use chrono::{DateTime, Utc};
use command_executor::backends::local::LocalLauncher;
use command_executor::{Command, Launcher, Target};
use fixture_config::{CommandLine, Config, ConfigError, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Restore the dependency cache
    RestoreCache,
    /// Install dependencies
    Install,
    /// Save the dependency cache
    SaveCache,
    /// Build images and start fixtures
    Provision,
    /// Run the test suite
    Test,
    /// Collect artifacts
    Artifacts,
    /// Remove fixtures
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::RestoreCache => "restore-cache",
            Stage::Install => "install",
            Stage::SaveCache => "save-cache",
            Stage::Provision => "provision",
            Stage::Test => "test",
            Stage::Artifacts => "artifacts",
            Stage::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// Outcome of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Completed
    Passed,
    /// Failed; the message says why
    Failed,
    /// Not run
    Skipped,
}

/// Record of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    /// Which stage
    pub stage: Stage,
    /// How it ended
    pub status: StageStatus,
    /// Wall time
    pub duration_ms: u64,
    /// Failure or skip reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Exit status and counts of the test stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    /// Exit code of the test command
    pub exit_code: i32,
    /// Parsed counts
    pub summary: TestSummary,
}

/// Everything known about a run; written as `report.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Run id, also the artifact subdirectory
    pub run_id: String,
    /// Checkout the run operated on
    pub checkout: PathBuf,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: Option<DateTime<Utc>>,
    /// Dependency cache key
    pub cache_key: Option<String>,
    /// Dependency cache restore outcome
    pub cache: CacheOutcome,
    /// Stage records in execution order
    pub stages: Vec<StageResult>,
    /// Test stage result, if the suite ran
    pub test: Option<TestReport>,
    /// Fixtures the suite ran against
    pub fixtures: Vec<FixtureInfo>,
    /// Collected artifact paths
    pub artifacts: Vec<String>,
    /// Tags excluded from the test run
    pub excluded_tags: Vec<String>,
    /// Terminal error, if the run ended early
    pub error: Option<String>,
}

impl PipelineReport {
    fn new(run_id: String, checkout: PathBuf, excluded_tags: Vec<String>) -> Self {
        Self {
            run_id,
            checkout,
            started_at: Utc::now(),
            finished_at: None,
            cache_key: None,
            cache: CacheOutcome::Disabled,
            stages: Vec::new(),
            test: None,
            fixtures: Vec::new(),
            artifacts: Vec::new(),
            excluded_tags,
            error: None,
        }
    }

    /// Process exit code for the run: the test suite's, or 1 when the suite
    /// never ran to completion
    pub fn exit_code(&self) -> i32 {
        match (&self.test, &self.error) {
            (Some(test), None) => test.exit_code,
            (Some(test), Some(_)) if test.exit_code != 0 => test.exit_code,
            _ => 1,
        }
    }

    /// True if the test suite exited 0 and nothing failed terminally
    pub fn passed(&self) -> bool {
        self.exit_code() == 0
    }

    /// Record for `stage`, if it ran
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    fn record(&mut self, stage: Stage, status: StageStatus, started: Instant, message: Option<String>) {
        let duration_ms = started.elapsed().as_millis() as u64;
        match status {
            StageStatus::Failed => warn!(stage = %stage, "Stage failed: {}", message.as_deref().unwrap_or("")),
            StageStatus::Skipped => info!(stage = %stage, "Stage skipped"),
            StageStatus::Passed => info!(stage = %stage, duration_ms, "Stage finished"),
        }
        self.stages.push(StageResult {
            stage,
            status,
            duration_ms,
            message,
        });
    }

    fn record_result<T>(&mut self, stage: Stage, started: Instant, result: &Result<T>) {
        match result {
            Ok(_) => self.record(stage, StageStatus::Passed, started, None),
            Err(e) => self.record(stage, StageStatus::Failed, started, Some(e.to_string())),
        }
    }
}

/// How to run the pipeline
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Source checkout; relative settings paths resolve against it
    pub checkout: PathBuf,
    /// Restore and save the dependency cache
    pub use_cache: bool,
    /// Run id; generated when absent
    pub run_id: Option<String>,
}

impl PipelineOptions {
    /// Run on `checkout` with the cache enabled
    pub fn new(checkout: impl Into<PathBuf>) -> Self {
        Self {
            checkout: checkout.into(),
            use_cache: true,
            run_id: None,
        }
    }
}

/// Runs the `pipeline:` section of a configuration
pub struct Pipeline<'a> {
    config: &'a Config,
    pipeline: &'a PipelineConfig,
    options: PipelineOptions,
    builder: ImageBuilder,
}

impl<'a> Pipeline<'a> {
    /// Pipeline for `config`, which must have a `pipeline:` section
    pub fn new(config: &'a Config, options: PipelineOptions) -> Result<Self> {
        let pipeline = config.pipeline.as_ref().ok_or_else(|| {
            ConfigError::ValidationError("The configuration has no pipeline section".to_string())
        })?;
        let builder = ImageBuilder::new()
            .build_timeout(Duration::from_secs(config.settings.build_timeout));
        Ok(Self {
            config,
            pipeline,
            options,
            builder,
        })
    }

    /// Cache key for the checkout's current manifests
    pub fn cache_key(&self) -> Result<CacheKey> {
        CacheKey::compute(
            &self.pipeline.cache.key_prefix,
            &self.options.checkout,
            &self.pipeline.manifests,
        )
    }

    /// Run every stage. `Ok` carries the report whether or not the tests
    /// passed; `Err` is a terminal failure, reported after artifacts and the
    /// report have been written.
    pub async fn run(self) -> Result<PipelineReport> {
        let run_id = self.options.run_id.clone().unwrap_or_else(new_run_id);
        let checkout = self.options.checkout.clone();
        info!(run_id = %run_id, checkout = %checkout.display(), "Starting pipeline");

        let artifacts = ArtifactCollector::new(
            &resolve_dir(&checkout, &self.config.settings.artifacts_dir),
            &run_id,
        )?;
        let key_dir = tempfile::Builder::new().prefix("fixture-keys-").tempdir()?;
        let mut report = PipelineReport::new(
            run_id,
            checkout.clone(),
            self.pipeline.test.excluded_tags(),
        );
        let mut fixtures = Vec::new();

        let result = self
            .run_stages(&artifacts, key_dir.path(), &mut report, &mut fixtures)
            .await;

        let started = Instant::now();
        match artifacts.collect(&checkout, &self.pipeline.artifacts.paths) {
            Ok(collected) => {
                report.artifacts = collected;
                report.record(Stage::Artifacts, StageStatus::Passed, started, None);
            }
            Err(e) => report.record(Stage::Artifacts, StageStatus::Failed, started, Some(e.to_string())),
        }

        let started = Instant::now();
        if fixtures.is_empty() {
            report.record(Stage::Teardown, StageStatus::Skipped, started, None);
        } else {
            let mut failures = Vec::new();
            for fixture in fixtures {
                let name = fixture.spec.name.clone();
                if let Err(e) = fixture.teardown().await {
                    failures.push(format!("{}: {}", name, e));
                }
            }
            if failures.is_empty() {
                report.record(Stage::Teardown, StageStatus::Passed, started, None);
            } else {
                report.record(Stage::Teardown, StageStatus::Failed, started, Some(failures.join("; ")));
            }
        }

        if let Err(e) = &result {
            report.error = Some(e.to_string());
        }
        report.finished_at = Some(Utc::now());

        let written = artifacts.write_report(&report);
        result?;
        written?;

        info!(
            run_id = %report.run_id,
            exit_code = report.exit_code(),
            "Pipeline {}",
            if report.passed() { "passed" } else { "failed" }
        );
        Ok(report)
    }

    async fn run_stages(
        &self,
        artifacts: &ArtifactCollector,
        key_dir: &Path,
        report: &mut PipelineReport,
        fixtures: &mut Vec<Fixture>,
    ) -> Result<()> {
        let checkout = &self.options.checkout;

        // restore-cache
        let started = Instant::now();
        let cache = self.restore_cache(report);
        match &cache {
            Some(_) => report.record(Stage::RestoreCache, StageStatus::Passed, started, None),
            None if self.cache_enabled() => report.record(
                Stage::RestoreCache,
                StageStatus::Failed,
                started,
                Some("cache unavailable, continuing without it".to_string()),
            ),
            None => report.record(Stage::RestoreCache, StageStatus::Skipped, started, None),
        }

        // install
        let started = Instant::now();
        match &self.pipeline.install {
            Some(install) => {
                let result = install_dependencies(install, checkout).await;
                report.record_result(Stage::Install, started, &result);
                result?;
            }
            None => report.record(Stage::Install, StageStatus::Skipped, started, None),
        }

        // save-cache
        let started = Instant::now();
        match cache {
            Some((store, key)) if !report.cache.is_hit() => {
                match store.save(&key, checkout, &self.pipeline.cache.paths) {
                    Ok(_) => report.record(Stage::SaveCache, StageStatus::Passed, started, None),
                    Err(e) => report.record(Stage::SaveCache, StageStatus::Failed, started, Some(e.to_string())),
                }
            }
            _ => report.record(Stage::SaveCache, StageStatus::Skipped, started, None),
        }

        // provision
        let started = Instant::now();
        if self.pipeline.test.fixtures.is_empty() {
            report.record(Stage::Provision, StageStatus::Skipped, started, None);
        } else {
            let result = self.provision(&report.run_id, key_dir, fixtures).await;
            report.fixtures = fixtures.iter().map(Fixture::info).collect();
            report.record_result(Stage::Provision, started, &result);
            result?;
        }

        // test
        let started = Instant::now();
        let env: BTreeMap<String, String> = fixtures.iter().flat_map(Fixture::env_vars).collect();
        let command = build_invocation(&self.pipeline.test, checkout, &env);
        let outcome = run_tests(command, &artifacts.log_path()).await;
        report.record_result(Stage::Test, started, &outcome);
        let outcome = outcome?;

        report.test = Some(TestReport {
            exit_code: outcome.status.exit_code(),
            summary: outcome.summary.clone(),
        });
        if !outcome.passed() {
            warn!("Test suite failed: {}", outcome.status);
            if let Some(last) = report.stages.last_mut() {
                last.status = StageStatus::Failed;
                last.message = Some(format!("test suite exited with {}", outcome.status));
            }
        }
        Ok(())
    }

    fn cache_enabled(&self) -> bool {
        self.options.use_cache && self.pipeline.cache.enabled
    }

    /// Restore the cache; `None` when caching is off or the store is unusable
    fn restore_cache(&self, report: &mut PipelineReport) -> Option<(CacheStore, CacheKey)> {
        if !self.cache_enabled() {
            report.cache = CacheOutcome::Disabled;
            return None;
        }

        let key = match self.cache_key() {
            Ok(key) => key,
            Err(e) => {
                warn!("Failed to compute cache key: {}", e);
                return None;
            }
        };
        report.cache_key = Some(key.to_string());

        let store = CacheStore::new(resolve_dir(
            &self.options.checkout,
            &self.config.settings.cache_dir,
        ));
        match store.restore(&key, &self.options.checkout) {
            Ok(outcome) => report.cache = outcome,
            Err(e) => {
                warn!(key = %key, "Failed to restore cache: {}", e);
                report.cache = CacheOutcome::Miss {
                    key: key.to_string(),
                };
            }
        }
        Some((store, key))
    }

    async fn provision(
        &self,
        run_id: &str,
        key_dir: &Path,
        fixtures: &mut Vec<Fixture>,
    ) -> Result<()> {
        for name in &self.pipeline.test.fixtures {
            let image = self.config.image(name)?;
            let spec = ImageSpec::from_config(name, image, self.config.name.as_deref())?;
            let container_name = format!("fixtures-{}-{}", name, short_run_id(run_id));
            let fixture = Fixture::provision(
                spec,
                &self.builder,
                &self.config.settings,
                &key_dir.join(name),
                &container_name,
            )
            .await?;
            fixtures.push(fixture);
        }
        Ok(())
    }
}

/// Run the install command in `checkout`, streaming its output
pub async fn install_dependencies(install: &CommandLine, checkout: &Path) -> Result<()> {
    let mut cmd = command_for(install);
    cmd.current_dir(checkout);
    info!(command = %cmd, "Installing dependencies");

    let result = LocalLauncher
        .execute_with(&Target::Command, cmd, |_, line| info!(stage = "install", "{}", line))
        .await
        .map_err(|e| FixtureError::DependencyInstall(e.to_string()))?;

    if !result.success() {
        return Err(FixtureError::DependencyInstall(format!(
            "install command exited with {}:\n{}",
            result.status,
            result.tail(OUTPUT_TAIL_LINES)
        )));
    }
    Ok(())
}

fn command_for(line: &CommandLine) -> Command {
    match line {
        CommandLine::Shell(script) => Command::shell(script),
        CommandLine::Argv(argv) => {
            let (program, rest) = argv
                .split_first()
                .map_or(("", &[][..]), |(p, r)| (p.as_str(), r));
            let mut cmd = Command::new(program);
            cmd.args(rest);
            cmd
        }
    }
}

/// `<UTC timestamp>-<8 hex chars>`
fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &id[..8])
}

fn short_run_id(run_id: &str) -> &str {
    run_id.rsplit('-').next().unwrap_or(run_id)
}

fn resolve_dir(checkout: &Path, dir: &str) -> PathBuf {
    let dir = Path::new(dir);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        checkout.join(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixture_config::parser::parse_str;
    use tempfile::TempDir;

    struct Workspace {
        checkout: TempDir,
        artifacts: TempDir,
        cache: TempDir,
    }

    impl Workspace {
        fn new() -> Self {
            let checkout = tempfile::tempdir().unwrap();
            std::fs::write(checkout.path().join("requirements.txt"), "paramiko==2.7\n").unwrap();
            Self {
                checkout,
                artifacts: tempfile::tempdir().unwrap(),
                cache: tempfile::tempdir().unwrap(),
            }
        }

        fn config(&self, install: &str, test_script: &str) -> Config {
            let yaml = format!(
                r#"
version: "1"
settings:
  artifacts_dir: "{artifacts}"
  cache_dir: "{cache}"
images:
  centos-ssh:
    base: centos:7
pipeline:
  manifests: [requirements.txt]
  cache:
    paths: [deps]
  install: "{install}"
  test:
    command: ["sh", "-c", "{test_script}", "sh"]
    runner: custom
    exclude_arg: "--exclude={{tag}}"
    exclude_tags: [slow]
  artifacts:
    paths: [results]
"#,
                artifacts = self.artifacts.path().display(),
                cache = self.cache.path().display(),
            );
            parse_str(&yaml).unwrap()
        }

        fn options(&self, run_id: &str) -> PipelineOptions {
            PipelineOptions {
                checkout: self.checkout.path().to_path_buf(),
                use_cache: true,
                run_id: Some(run_id.to_string()),
            }
        }

        fn run_dir(&self, run_id: &str) -> PathBuf {
            self.artifacts.path().join(run_id)
        }
    }

    const INSTALL: &str = "mkdir -p deps && cp requirements.txt deps/installed";
    const PASSING: &str = "mkdir -p results && echo ok > results/junit.xml && echo \\\"args: $*\\\" && echo 'test suite::login ... ok'";

    #[smol_potat::test]
    async fn test_passing_run_excludes_local_and_writes_report() {
        let ws = Workspace::new();
        let config = ws.config(INSTALL, PASSING);

        let report = Pipeline::new(&config, ws.options("run-1"))
            .unwrap()
            .run()
            .await
            .unwrap();

        assert!(report.passed());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.excluded_tags, vec!["local", "slow"]);
        assert!(matches!(report.cache, CacheOutcome::Miss { .. }));
        assert_eq!(report.stage(Stage::SaveCache).unwrap().status, StageStatus::Passed);
        assert_eq!(report.stage(Stage::Provision).unwrap().status, StageStatus::Skipped);
        assert_eq!(report.artifacts, vec!["results"]);
        assert_eq!(report.test.as_ref().unwrap().summary.passed, 1);

        let run_dir = ws.run_dir("run-1");
        let log = std::fs::read_to_string(run_dir.join("test-output.log")).unwrap();
        assert!(log.contains("args: --exclude=local --exclude=slow"));
        assert!(run_dir.join("results/junit.xml").is_file());
        assert!(run_dir.join("report.json").is_file());
    }

    #[smol_potat::test]
    async fn test_failing_suite_still_collects_artifacts() {
        let ws = Workspace::new();
        let config = ws.config(
            INSTALL,
            "mkdir -p results && echo fail > results/junit.xml && exit 3",
        );

        let report = Pipeline::new(&config, ws.options("run-2"))
            .unwrap()
            .run()
            .await
            .unwrap();

        assert!(!report.passed());
        assert_eq!(report.exit_code(), 3);
        assert_eq!(report.stage(Stage::Test).unwrap().status, StageStatus::Failed);
        assert_eq!(report.stage(Stage::Artifacts).unwrap().status, StageStatus::Passed);
        assert!(ws.run_dir("run-2").join("results/junit.xml").is_file());

        let written: PipelineReport = serde_json::from_str(
            &std::fs::read_to_string(ws.run_dir("run-2").join("report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(written.exit_code(), 3);
    }

    #[smol_potat::test]
    async fn test_install_failure_is_terminal() {
        let ws = Workspace::new();
        std::fs::create_dir_all(ws.checkout.path().join("results")).unwrap();
        let config = ws.config("echo resolver error && exit 1", PASSING);

        let err = Pipeline::new(&config, ws.options("run-3"))
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, FixtureError::DependencyInstall(msg) if msg.contains("resolver error")));

        let written: PipelineReport = serde_json::from_str(
            &std::fs::read_to_string(ws.run_dir("run-3").join("report.json")).unwrap(),
        )
        .unwrap();
        assert!(written.test.is_none());
        assert_eq!(written.exit_code(), 1);
        assert!(written.error.is_some());
        assert_eq!(written.artifacts, vec!["results"]);
        assert!(!ws.run_dir("run-3").join("test-output.log").exists());
    }

    #[smol_potat::test]
    async fn test_second_run_hits_cache() {
        let ws = Workspace::new();
        let config = ws.config(INSTALL, PASSING);

        Pipeline::new(&config, ws.options("first")).unwrap().run().await.unwrap();
        std::fs::remove_dir_all(ws.checkout.path().join("deps")).unwrap();

        let second = Pipeline::new(&config, ws.options("second"))
            .unwrap()
            .run()
            .await
            .unwrap();
        assert!(second.cache.is_hit());
        assert_eq!(second.stage(Stage::SaveCache).unwrap().status, StageStatus::Skipped);
    }

    #[smol_potat::test]
    async fn test_no_cache_option() {
        let ws = Workspace::new();
        let config = ws.config(INSTALL, PASSING);
        let mut options = ws.options("run-4");
        options.use_cache = false;

        let report = Pipeline::new(&config, options).unwrap().run().await.unwrap();
        assert_eq!(report.cache, CacheOutcome::Disabled);
        assert!(report.cache_key.is_none());
        assert_eq!(report.stage(Stage::RestoreCache).unwrap().status, StageStatus::Skipped);
        assert!(std::fs::read_dir(ws.cache.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_exit_code_mapping() {
        let mut report = PipelineReport::new("r".to_string(), PathBuf::from("."), vec![]);
        assert_eq!(report.exit_code(), 1);

        report.test = Some(TestReport {
            exit_code: 0,
            summary: TestSummary::default(),
        });
        assert!(report.passed());

        report.error = Some("teardown".to_string());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_run_ids() {
        let id = new_run_id();
        assert_eq!(short_run_id(&id).len(), 8);
        assert_ne!(new_run_id(), id);
        assert_eq!(
            resolve_dir(Path::new("/src"), "artifacts"),
            PathBuf::from("/src/artifacts")
        );
        assert_eq!(resolve_dir(Path::new("/src"), "/tmp/a"), PathBuf::from("/tmp/a"));
    }
}
