//! Configuration parser and validation

use crate::resolver::{ResolutionContext, resolve_config};
use crate::{Config, ConfigError, Result, TestRunner};
use regex::Regex;
use std::path::{Component, Path};
use std::sync::LazyLock;

static USER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"));
static KEY_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid regex"));

/// Supported configuration version
pub const CONFIG_VERSION: &str = "1";

/// Parse a YAML configuration file without resolving variables
pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse YAML configuration from a string without resolving variables
pub fn parse_str(content: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a configuration file and resolve every `${VAR}` against `context`
pub fn load(path: impl AsRef<Path>, context: &ResolutionContext) -> Result<Config> {
    let config = parse_file(path)?;
    let resolved = resolve_config(&config, context)?;
    validate_config(&resolved)?;
    Ok(resolved)
}

fn invalid(message: String) -> ConfigError {
    ConfigError::ValidationError(message)
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.version != CONFIG_VERSION {
        return Err(invalid(format!(
            "Unsupported version: {}, expected {}",
            config.version, CONFIG_VERSION
        )));
    }

    if config.images.is_empty() {
        return Err(invalid("At least one image must be defined".to_string()));
    }

    for (name, image) in &config.images {
        if !is_fixture_name(name) {
            return Err(invalid(format!(
                "Image name '{}' must be lowercase letters, digits, '-' or '_'",
                name
            )));
        }
        if image.base.trim().is_empty() {
            return Err(invalid(format!("Image '{}' has an empty base", name)));
        }
        if !is_unresolved(&image.user) && !USER_RE.is_match(&image.user) {
            return Err(invalid(format!(
                "Image '{}' user '{}' is not a valid user name",
                name, image.user
            )));
        }
        if image.port == 0 {
            return Err(invalid(format!("Image '{}' has port 0", name)));
        }
        if let Some(package) = image.packages.iter().find(|p| p.trim().is_empty()) {
            return Err(invalid(format!(
                "Image '{}' lists an empty package name {:?}",
                name, package
            )));
        }
    }

    if let Some(pipeline) = &config.pipeline {
        if pipeline.install.as_ref().is_some_and(|c| c.is_empty()) {
            return Err(invalid("Pipeline install command is empty".to_string()));
        }
        if pipeline.test.command.is_empty() {
            return Err(invalid("Pipeline test command is empty".to_string()));
        }
        for fixture in &pipeline.test.fixtures {
            if !config.images.contains_key(fixture) {
                return Err(invalid(format!(
                    "Pipeline test stage uses unknown image '{}'",
                    fixture
                )));
            }
        }
        if pipeline.test.runner == TestRunner::Custom
            && !pipeline
                .test
                .exclude_arg
                .as_deref()
                .is_some_and(|arg| arg.contains("{tag}"))
        {
            return Err(invalid(
                "Custom test runner requires an exclude_arg containing {tag}".to_string(),
            ));
        }
        let prefix = &pipeline.cache.key_prefix;
        if !KEY_PREFIX_RE.is_match(prefix) {
            return Err(invalid(format!(
                "Cache key prefix '{}' may only contain letters, digits, '.', '_' or '-'",
                prefix
            )));
        }

        let relative_paths = pipeline
            .manifests
            .iter()
            .map(|p| ("manifest", p))
            .chain(pipeline.cache.paths.iter().map(|p| ("cache path", p)))
            .chain(pipeline.artifacts.paths.iter().map(|p| ("artifact path", p)));
        for (kind, path) in relative_paths {
            if !is_checkout_relative(path) {
                return Err(invalid(format!(
                    "The {} '{}' must be relative to the checkout",
                    kind, path
                )));
            }
        }
    }

    Ok(())
}

fn is_fixture_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Still holds a `${VAR}` reference; checked again once resolved
fn is_unresolved(value: &str) -> bool {
    value.contains("${")
}

/// Non-empty, relative, and never climbing out through `..`
fn is_checkout_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
version: "1"
images:
  centos-ssh:
    base: centos:7
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_str(MINIMAL).unwrap();
        let image = config.image("centos-ssh").unwrap();

        assert_eq!(image.user, "sshuser");
        assert_eq!(image.port, 22);
        assert_eq!(image.auth, crate::AuthConfig::Key { public_key: None });
        assert_eq!(config.settings.ready_timeout, 30);
        assert_eq!(config.settings.bind_address, "127.0.0.1");
        assert!(config.pipeline.is_none());
    }

    #[test]
    fn test_rejects_wrong_version() {
        let err = parse_str("version: \"2\"\nimages:\n  a:\n    base: alpine\n").unwrap_err();
        assert!(err.to_string().contains("Unsupported version"));
    }

    #[test]
    fn test_rejects_unknown_fixture() {
        let yaml = format!(
            "{}pipeline:\n  test:\n    command: pytest\n    fixtures: [ubuntu-ssh]\n",
            MINIMAL
        );
        let err = parse_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown image 'ubuntu-ssh'"));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let yaml = format!(
            "{}pipeline:\n  test:\n    command: pytest\n  artifacts:\n    paths: [../outside]\n",
            MINIMAL
        );
        assert!(parse_str(&yaml).is_err());

        assert!(is_checkout_relative("test-results"));
        assert!(is_checkout_relative("./reports/junit.xml"));
        assert!(!is_checkout_relative("/etc"));
        assert!(!is_checkout_relative(""));
    }

    #[test]
    fn test_custom_runner_needs_template() {
        let yaml = format!(
            "{}pipeline:\n  test:\n    command: ./run-tests\n    runner: custom\n",
            MINIMAL
        );
        assert!(parse_str(&yaml).is_err());

        let yaml = format!(
            "{}pipeline:\n  test:\n    command: ./run-tests\n    runner: custom\n    exclude_arg: \"--skip-tag={{tag}}\"\n",
            MINIMAL
        );
        assert!(parse_str(&yaml).is_ok());
    }

    #[test]
    fn test_rejects_bad_image_name() {
        let err = parse_str("version: \"1\"\nimages:\n  Centos:\n    base: centos:7\n").unwrap_err();
        assert!(err.to_string().contains("lowercase"));
    }

    #[test]
    fn test_rejects_invalid_user_names() {
        for user in ["a b", "x/y", "Root", "", "1user"] {
            let yaml = format!(
                "version: \"1\"\nimages:\n  a:\n    base: alpine\n    user: \"{}\"\n",
                user
            );
            let err = parse_str(&yaml).unwrap_err();
            assert!(err.to_string().contains("not a valid user name"), "{}", user);
        }

        for user in ["root", "sshuser", "_svc", "test-user1"] {
            let yaml = format!(
                "version: \"1\"\nimages:\n  a:\n    base: alpine\n    user: {}\n",
                user
            );
            assert!(parse_str(&yaml).is_ok(), "{}", user);
        }
    }

    #[test]
    fn test_user_checked_after_resolution() {
        let yaml = "version: \"1\"\nimages:\n  a:\n    base: alpine\n    user: ${FIXTURE_USER:-sshuser}\n";
        assert!(parse_str(yaml).is_ok());

        let config = parse_str(yaml).unwrap();
        let mut context = ResolutionContext::empty();
        context.set_env("FIXTURE_USER", "bad user");
        let resolved = resolve_config(&config, &context).unwrap();
        assert!(validate_config(&resolved).is_err());
    }

    #[test]
    fn test_cache_key_prefix_must_be_a_single_name() {
        for prefix in ["deps/v1", "", "a b", "../deps"] {
            let yaml = format!(
                "{}pipeline:\n  cache:\n    key_prefix: \"{}\"\n  test:\n    command: pytest\n",
                MINIMAL, prefix
            );
            let err = parse_str(&yaml).unwrap_err();
            assert!(err.to_string().contains("Cache key prefix"), "{}", prefix);
        }

        let yaml = format!(
            "{}pipeline:\n  cache:\n    key_prefix: deps-v1.2_x\n  test:\n    command: pytest\n",
            MINIMAL
        );
        assert!(parse_str(&yaml).is_ok());
    }
}
