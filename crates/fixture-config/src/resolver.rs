//! Environment variable resolver
//!
//! Handles `${VAR}` and `${VAR:-default}` in image bases, users, tags and
//! credentials, and in the pipeline's install/test commands and test
//! environment. Settings, manifests, cache and artifact paths are taken
//! literally.

use crate::{AuthConfig, CommandLine, Config, ConfigError, Result};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex")
});

/// Variables available during resolution
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// Variable values, checked before falling back to defaults
    pub env_vars: HashMap<String, String>,
}

impl ResolutionContext {
    /// Context seeded from the process environment
    pub fn from_env() -> Self {
        Self {
            env_vars: std::env::vars().collect(),
        }
    }

    /// Empty context; only defaults resolve
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add or update a variable
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env_vars.insert(key.into(), value.into());
    }
}

/// Resolve all variables in a string
pub fn resolve_string(input: &str, context: &ResolutionContext) -> Result<String> {
    let mut missing = Vec::new();

    let resolved = VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        let name = &cap[1];
        match (context.env_vars.get(name), cap.get(2)) {
            (Some(value), _) => value.clone(),
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(resolved.into_owned())
}

fn resolve_opt(value: &Option<String>, context: &ResolutionContext) -> Result<Option<String>> {
    value.as_deref().map(|v| resolve_string(v, context)).transpose()
}

fn resolve_command(command: &CommandLine, context: &ResolutionContext) -> Result<CommandLine> {
    Ok(match command {
        CommandLine::Shell(line) => CommandLine::Shell(resolve_string(line, context)?),
        CommandLine::Argv(argv) => CommandLine::Argv(
            argv.iter()
                .map(|arg| resolve_string(arg, context))
                .collect::<Result<_>>()?,
        ),
    })
}

/// Return a copy of `config` with every variable resolved
pub fn resolve_config(config: &Config, context: &ResolutionContext) -> Result<Config> {
    let mut resolved = config.clone();

    for image in resolved.images.values_mut() {
        image.base = resolve_string(&image.base, context)?;
        image.user = resolve_string(&image.user, context)?;
        image.tag = resolve_opt(&image.tag, context)?;
        image.auth = match &image.auth {
            AuthConfig::Key { public_key } => AuthConfig::Key {
                public_key: resolve_opt(public_key, context)?,
            },
            AuthConfig::Password { password } => AuthConfig::Password {
                password: resolve_opt(password, context)?,
            },
        };
    }

    if let Some(pipeline) = resolved.pipeline.as_mut() {
        if let Some(install) = &pipeline.install {
            pipeline.install = Some(resolve_command(install, context)?);
        }
        pipeline.test.command = resolve_command(&pipeline.test.command, context)?;
        for value in pipeline.test.env.values_mut() {
            *value = resolve_string(value, context)?;
        }
    }

    Ok(resolved)
}

/// Names of variables referenced without a default, across the whole config
pub fn required_variables(config: &Config) -> BTreeSet<String> {
    let mut fields: Vec<&str> = Vec::new();

    for image in config.images.values() {
        fields.push(&image.base);
        fields.push(&image.user);
        if let Some(tag) = &image.tag {
            fields.push(tag);
        }
        match &image.auth {
            AuthConfig::Key { public_key: Some(v) } | AuthConfig::Password { password: Some(v) } => {
                fields.push(v)
            }
            _ => {}
        }
    }

    if let Some(pipeline) = &config.pipeline {
        let commands = pipeline.install.iter().chain(std::iter::once(&pipeline.test.command));
        for command in commands {
            match command {
                CommandLine::Shell(line) => fields.push(line),
                CommandLine::Argv(argv) => fields.extend(argv.iter().map(String::as_str)),
            }
        }
        fields.extend(pipeline.test.env.values().map(String::as_str));
    }

    fields
        .into_iter()
        .flat_map(|field| VAR_RE.captures_iter(field))
        .filter(|cap| cap.get(2).is_none())
        .map(|cap| cap[1].to_string())
        .collect()
}

/// Required variables missing from `context`
pub fn missing_variables(config: &Config, context: &ResolutionContext) -> Vec<String> {
    required_variables(config)
        .into_iter()
        .filter(|var| !context.env_vars.contains_key(var))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ResolutionContext {
        let mut ctx = ResolutionContext::empty();
        ctx.set_env("BASE_TAG", "20.04");
        ctx.set_env("FIXTURE_PASSWORD", "s3cret");
        ctx
    }

    #[test]
    fn test_resolve_env_vars() {
        let ctx = context();

        assert_eq!(resolve_string("ubuntu:${BASE_TAG}", &ctx).unwrap(), "ubuntu:20.04");
        assert_eq!(resolve_string("${MISSING:-pass}", &ctx).unwrap(), "pass");
        assert_eq!(resolve_string("${FIXTURE_PASSWORD:-ignored}", &ctx).unwrap(), "s3cret");
        assert_eq!(resolve_string("${EMPTY_DEFAULT:-}", &ctx).unwrap(), "");
        assert_eq!(resolve_string("no variables", &ctx).unwrap(), "no variables");
    }

    #[test]
    fn test_missing_variables_are_reported_together() {
        let err = resolve_string("${ONE} and ${TWO}", &ResolutionContext::empty()).unwrap_err();
        match err {
            ConfigError::EnvVarNotFound(vars) => assert_eq!(vars, "ONE, TWO"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_config_and_required_variables() {
        let yaml = r#"
version: "1"
images:
  ubuntu-root:
    base: "ubuntu:${BASE_TAG}"
    user: root
    auth:
      method: password
      password: "${FIXTURE_PASSWORD:-pass}"
pipeline:
  install: "pip install -r ${REQUIREMENTS}"
  test:
    command: ["pytest", "${TEST_DIR:-test}"]
"#;
        let config = crate::parser::parse_str(yaml).unwrap();

        let required = required_variables(&config);
        assert_eq!(
            required.into_iter().collect::<Vec<_>>(),
            vec!["BASE_TAG".to_string(), "REQUIREMENTS".to_string()]
        );

        let mut ctx = context();
        assert_eq!(missing_variables(&config, &ctx), vec!["REQUIREMENTS".to_string()]);

        ctx.set_env("REQUIREMENTS", "requirements.txt");
        let resolved = resolve_config(&config, &ctx).unwrap();
        let image = resolved.image("ubuntu-root").unwrap();
        assert_eq!(image.base, "ubuntu:20.04");
        assert_eq!(image.auth, AuthConfig::Password { password: Some("s3cret".to_string()) });

        let pipeline = resolved.pipeline.unwrap();
        assert_eq!(
            pipeline.install,
            Some(CommandLine::Shell("pip install -r requirements.txt".to_string()))
        );
        assert_eq!(
            pipeline.test.command,
            CommandLine::Argv(vec!["pytest".to_string(), "test".to_string()])
        );
    }
}
