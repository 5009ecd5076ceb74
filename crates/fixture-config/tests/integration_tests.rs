//! Integration tests for fixture configuration loading

use fixture_config::parser::{load, parse_file};
use fixture_config::resolver::{ResolutionContext, missing_variables};
use fixture_config::{AuthConfig, CommandLine, ConfigError, TestRunner};
use std::io::Write;
use tempfile::NamedTempFile;

const FULL_CONFIG: &str = r#"
version: "1"
name: analyzer-fixtures
settings:
  ready_timeout: 45
  artifacts_dir: out/artifacts
images:
  centos-ssh:
    base: centos:7
    packages: [openssh-clients, which]
    user: sshuser
    auth: { method: key }
  ubuntu-root:
    base: "ubuntu:${UBUNTU_TAG:-20.04}"
    user: root
    auth: { method: password, password: "${FIXTURE_PASSWORD:-pass}" }
    port: 2222
pipeline:
  manifests: [requirements.txt, requirements-dev.txt]
  cache: { key_prefix: pip, paths: [.venv] }
  install: "python -m venv .venv && .venv/bin/pip install -r requirements.txt"
  test:
    command: [".venv/bin/pytest", "test"]
    runner: pytest
    exclude_tags: [slow]
    fixtures: [centos-ssh, ubuntu-root]
    env:
      ANALYZER_REPORT: "${REPORT_DIR}/report.xml"
  artifacts: { paths: [test-results] }
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_parse_full_config() {
    let file = write_config(FULL_CONFIG);
    let config = parse_file(file.path()).unwrap();

    assert_eq!(config.name.as_deref(), Some("analyzer-fixtures"));
    assert_eq!(config.settings.ready_timeout, 45);
    assert_eq!(config.settings.build_timeout, 900);
    assert_eq!(config.images.len(), 2);

    let centos = config.image("centos-ssh").unwrap();
    assert_eq!(centos.packages, vec!["openssh-clients", "which"]);
    assert_eq!(centos.auth, AuthConfig::Key { public_key: None });

    let pipeline = config.pipeline.as_ref().unwrap();
    assert_eq!(pipeline.cache.key_prefix, "pip");
    assert!(pipeline.cache.enabled);
    assert_eq!(pipeline.test.runner, TestRunner::Pytest);
    assert_eq!(pipeline.test.excluded_tags(), vec!["local", "slow"]);
}

#[test]
fn test_load_resolves_defaults_and_environment() {
    let file = write_config(FULL_CONFIG);

    let mut ctx = ResolutionContext::empty();
    ctx.set_env("REPORT_DIR", "/tmp/reports");
    let config = load(file.path(), &ctx).unwrap();

    let ubuntu = config.image("ubuntu-root").unwrap();
    assert_eq!(ubuntu.base, "ubuntu:20.04");
    assert_eq!(ubuntu.port, 2222);
    assert_eq!(
        ubuntu.auth,
        AuthConfig::Password {
            password: Some("pass".to_string())
        }
    );

    let pipeline = config.pipeline.unwrap();
    assert_eq!(
        pipeline.test.env.get("ANALYZER_REPORT").map(String::as_str),
        Some("/tmp/reports/report.xml")
    );
    assert_eq!(
        pipeline.test.command,
        CommandLine::Argv(vec![".venv/bin/pytest".to_string(), "test".to_string()])
    );
}

#[test]
fn test_load_reports_missing_variables() {
    let file = write_config(FULL_CONFIG);
    let ctx = ResolutionContext::empty();

    let config = parse_file(file.path()).unwrap();
    assert_eq!(missing_variables(&config, &ctx), vec!["REPORT_DIR".to_string()]);

    match load(file.path(), &ctx) {
        Err(ConfigError::EnvVarNotFound(var)) => assert_eq!(var, "REPORT_DIR"),
        other => panic!("expected EnvVarNotFound, got {:?}", other),
    }
}

#[test]
fn test_missing_file() {
    let err = parse_file("/nonexistent/fixtures.yaml").unwrap_err();
    assert!(matches!(err, ConfigError::ReadError(_)));
}

#[test]
fn test_rejects_config_without_images() {
    let file = write_config("version: \"1\"\nimages: {}\n");
    let err = parse_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("At least one image"));
}

#[test]
fn test_rejects_unknown_auth_method() {
    let file = write_config(
        "version: \"1\"\nimages:\n  a:\n    base: alpine:3.19\n    auth: { method: kerberos }\n",
    );
    assert!(matches!(
        parse_file(file.path()).unwrap_err(),
        ConfigError::YamlError(_)
    ));
}
