use anyhow::{Context, Result, bail};
use fixture_config::parser;
use fixture_config::resolver::{self, ResolutionContext};
use fixture_core::ImageSpec;
use std::path::Path;

pub async fn run(config_path: &Path, strict: bool) -> Result<i32> {
    println!("Validating {}...", config_path.display());

    let config = parser::parse_file(config_path).context("Failed to parse configuration")?;
    let context = ResolutionContext::from_env();
    let missing = resolver::missing_variables(&config, &context);

    if !missing.is_empty() {
        if strict {
            bail!(
                "Configuration references undefined environment variables: {}",
                missing.join(", ")
            );
        }
        println!("✓ Configuration valid");
        println!(
            "  ⚠ References undefined environment variables: {}",
            missing.join(", ")
        );
        println!("  Images: {} (not checked until variables are set)", config.images.len());
        return Ok(0);
    }

    let config = resolver::resolve_config(&config, &context)?;
    parser::validate_config(&config)?;

    println!("✓ Configuration valid");
    println!("  Version: {}", config.version);
    if let Some(name) = &config.name {
        println!("  Name: {}", name);
    }
    println!("  Images: {}", config.images.len());

    for (name, image) in &config.images {
        let spec = ImageSpec::from_config(name, image, config.name.as_deref())
            .with_context(|| format!("Invalid image '{}'", name))?;
        println!(
            "    {} -> {} ({}, user {}, port {}, {} auth)",
            name,
            spec.tag,
            spec.family,
            spec.user,
            spec.port,
            spec.auth.kind()
        );
    }

    if let Some(pipeline) = &config.pipeline {
        println!("  Pipeline:");
        println!("    Manifests: {}", pipeline.manifests.join(", "));
        println!("    Excluded tags: {}", pipeline.test.excluded_tags().join(", "));
        if !pipeline.test.fixtures.is_empty() {
            println!("    Fixtures: {}", pipeline.test.fixtures.join(", "));
        }
    }

    Ok(0)
}
