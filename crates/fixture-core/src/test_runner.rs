//! Test suite invocation and output parsing

use crate::error::{FixtureError, Result};
use command_executor::backends::local::LocalLauncher;
use command_executor::{Command, ExitStatus, Launcher, LogSource, Target, shell_escape};
use fixture_config::{CommandLine, TestConfig, TestRunner};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

static PYTEST_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (passed|failed|skipped|deselected|errors?|xfailed|xpassed)")
        .expect("valid regex")
});
static CARGO_FILTERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) filtered out").expect("valid regex"));

/// Arguments that exclude `tags` for the given runner style
pub fn exclusion_args(runner: TestRunner, tags: &[String], exclude_arg: Option<&str>) -> Vec<String> {
    if tags.is_empty() {
        return Vec::new();
    }
    match runner {
        TestRunner::Pytest => {
            let expr = tags
                .iter()
                .map(|t| format!("not {}", t))
                .collect::<Vec<_>>()
                .join(" and ");
            vec!["-m".to_string(), expr]
        }
        // Substring filters on test paths
        TestRunner::Cargo => tags
            .iter()
            .flat_map(|t| ["--skip".to_string(), t.clone()])
            .collect(),
        TestRunner::Custom => {
            let template = exclude_arg.unwrap_or("{tag}");
            tags.iter().map(|t| template.replace("{tag}", t)).collect()
        }
    }
}

/// The test command with tag exclusions appended, running in `checkout`
/// with `env` added to its environment
pub fn build_invocation(
    test: &TestConfig,
    checkout: &Path,
    env: &BTreeMap<String, String>,
) -> Command {
    let tags = test.excluded_tags();
    let mut extra = exclusion_args(test.runner, &tags, test.exclude_arg.as_deref());

    let mut cmd = match &test.command {
        CommandLine::Argv(argv) => {
            if test.runner == TestRunner::Cargo && !argv.iter().any(|a| a == "--") {
                extra.insert(0, "--".to_string());
            }
            // An empty argv fails at spawn
            let (program, rest) = argv.split_first().map_or(("", &[][..]), |(p, r)| (p.as_str(), r));
            let mut cmd = Command::new(program);
            cmd.args(rest).args(&extra);
            cmd
        }
        CommandLine::Shell(line) => {
            if test.runner == TestRunner::Cargo && !line.split_whitespace().any(|w| w == "--") {
                extra.insert(0, "--".to_string());
            }
            let quoted: Vec<String> = extra.iter().map(|a| shell_escape(a)).collect();
            let script = if quoted.is_empty() {
                line.clone()
            } else {
                format!("{} {}", line.trim_end(), quoted.join(" "))
            };
            Command::shell(script)
        }
    };

    cmd.current_dir(checkout);
    cmd.envs(test.env.iter());
    cmd.envs(env.iter());
    cmd
}

/// Counts parsed from test output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    /// Tests run
    pub total: usize,
    /// Passed
    pub passed: usize,
    /// Failed, including errors
    pub failed: usize,
    /// Skipped or ignored
    pub ignored: usize,
    /// Deselected or filtered out by tag
    pub deselected: usize,
}

impl TestSummary {
    /// Feed one output line. Understands libtest `... ok` lines and the
    /// pytest summary line.
    pub fn parse_line(&mut self, line: &str) {
        if line.starts_with("test ") && line.contains(" ... ") {
            self.total += 1;
            if line.contains(" ... ok") {
                self.passed += 1;
            } else if line.contains(" ... FAILED") {
                self.failed += 1;
            } else if line.contains(" ... ignored") {
                self.ignored += 1;
            }
            return;
        }

        if line.starts_with("test result:") {
            if let Some(cap) = CARGO_FILTERED_RE.captures(line) {
                self.deselected += cap[1].parse::<usize>().unwrap_or(0);
            }
            return;
        }

        let trimmed = line.trim();
        if trimmed.starts_with('=') && trimmed.ends_with('=') && trimmed.contains(" in ") {
            let mut found = false;
            let mut summary = TestSummary::default();
            for cap in PYTEST_COUNT_RE.captures_iter(trimmed) {
                found = true;
                let n: usize = cap[1].parse().unwrap_or(0);
                match &cap[2] {
                    "passed" | "xpassed" => summary.passed += n,
                    "failed" | "error" | "errors" => summary.failed += n,
                    "skipped" | "xfailed" => summary.ignored += n,
                    "deselected" => summary.deselected += n,
                    _ => {}
                }
            }
            if found {
                summary.total = summary.passed + summary.failed + summary.ignored;
                *self = summary;
            }
        }
    }
}

impl fmt::Display for TestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total > 0 {
            write!(
                f,
                "Test Summary: {} total, {} passed, {} failed, {} ignored, {} deselected",
                self.total, self.passed, self.failed, self.ignored, self.deselected
            )
        } else {
            write!(f, "No test results captured")
        }
    }
}

/// Result of running the test suite
#[derive(Debug, Clone)]
pub struct TestOutcome {
    /// Exit status of the test command
    pub status: ExitStatus,
    /// Parsed counts
    pub summary: TestSummary,
    /// Full output
    pub log_path: PathBuf,
}

impl TestOutcome {
    /// True if the test command exited 0
    pub fn passed(&self) -> bool {
        self.status.success()
    }
}

/// Run `command`, streaming output to the log and to `log_path`
pub async fn run_tests(command: Command, log_path: &Path) -> Result<TestOutcome> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut log = std::io::BufWriter::new(std::fs::File::create(log_path)?);
    let mut summary = TestSummary::default();
    let mut write_failed = false;

    info!(command = %command, "Running test suite");
    let result = LocalLauncher
        .execute_with(&Target::Command, command, |source, line| {
            match source {
                LogSource::Stdout => info!("{}", line),
                LogSource::Stderr => info!(stream = "stderr", "{}", line),
            }
            summary.parse_line(line);
            if writeln!(log, "{}", line).is_err() {
                write_failed = true;
            }
        })
        .await
        .map_err(|e| FixtureError::TestExecution(e.to_string()))?;

    if write_failed {
        warn!(path = %log_path.display(), "Some test output could not be written to the log file");
    }
    log.flush()?;

    info!("{}", summary);
    Ok(TestOutcome {
        status: result.status,
        summary,
        log_path: log_path.to_path_buf(),
    })
}
