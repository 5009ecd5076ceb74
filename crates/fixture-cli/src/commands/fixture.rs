use super::{image_spec, load_config};
use anyhow::{Context, Result, bail};
use command_executor::shell_escape;
use fixture_core::container::remove_container;
use fixture_core::{AuthMethod, Credential, Fixture, ImageBuilder, Secret, SshProbe};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub async fn up(config_path: &Path, image: &str, name: Option<String>) -> Result<i32> {
    let config = load_config(config_path)?;
    let spec = image_spec(&config, image)?;
    let name = name.unwrap_or_else(|| format!("fixtures-{}", image));
    let builder =
        ImageBuilder::new().build_timeout(Duration::from_secs(config.settings.build_timeout));

    let fixture = Fixture::provision(
        spec,
        &builder,
        &config.settings,
        &credentials_dir(&config.settings.cache_dir, &name),
        &name,
    )
    .await
    .with_context(|| format!("Failed to start fixture '{}'", image))?;

    let endpoint = fixture.container.endpoint().clone();
    println!("✓ Fixture '{}' running as {}", image, name);
    println!("  Endpoint: {}", endpoint);
    match &fixture.credential {
        Credential::Key {
            private_key: Some(key),
            ..
        } => println!(
            "  Connect:  ssh -p {} -i {} {}@{}",
            endpoint.port,
            key.display(),
            fixture.spec.user,
            endpoint.host
        ),
        _ => println!(
            "  Connect:  ssh -p {} {}@{}",
            endpoint.port, fixture.spec.user, endpoint.host
        ),
    }
    println!();
    for (key, value) in fixture.env_vars() {
        println!("export {}={}", key, shell_escape(&value));
    }

    fixture.container.keep();
    Ok(0)
}

pub async fn down(config_path: &Path, name: &str) -> Result<i32> {
    let config = load_config(config_path)?;

    let removed = remove_container(name).await?;
    let credentials = credentials_dir(&config.settings.cache_dir, name);
    if credentials.exists() {
        std::fs::remove_dir_all(&credentials)
            .with_context(|| format!("Failed to remove {}", credentials.display()))?;
    }

    if removed {
        println!("✓ Removed {}", name);
    } else {
        println!("  {} was not running", name);
    }
    Ok(0)
}

pub async fn verify(config_path: &Path, image: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let spec = image_spec(&config, image)?;
    let builder =
        ImageBuilder::new().build_timeout(Duration::from_secs(config.settings.build_timeout));
    let keys = tempfile::tempdir()?;
    let name = format!(
        "fixtures-verify-{}-{}",
        image,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );

    println!("Verifying {}...", spec.tag);
    let fixture = Fixture::provision(spec, &builder, &config.settings, keys.path(), &name)
        .await
        .with_context(|| format!("Failed to start fixture '{}'", image))?;
    println!("  Endpoint: {}", fixture.container.endpoint());

    let failures = run_checks(&fixture).await;
    fixture.teardown().await?;

    match failures {
        Ok(failures) if failures.is_empty() => {
            println!("✓ {} verified", image);
            Ok(0)
        }
        Ok(failures) => bail!("{} failed {} check(s): {}", image, failures.len(), failures.join("; ")),
        Err(e) => Err(e),
    }
}

async fn run_checks(fixture: &Fixture) -> Result<Vec<String>> {
    let mut failures = Vec::new();
    let probe = fixture.probe()?;

    if probe.login_succeeds().await? {
        println!("  ✓ Login as {} with {} accepted", fixture.spec.user, fixture.credential.kind());
    } else {
        println!("  ✗ Login as {} with {} rejected", fixture.spec.user, fixture.credential.kind());
        failures.push("login".to_string());
        return Ok(failures);
    }

    if let AuthMethod::Password { .. } = fixture.spec.auth {
        let wrong = SshProbe::new(
            fixture.container.endpoint(),
            &fixture.spec.user,
            &Credential::Password(Secret::new(format!("not-{}", uuid::Uuid::new_v4().simple()))),
        )?;
        if wrong.login_succeeds().await? {
            println!("  ✗ Wrong password accepted");
            failures.push("wrong password accepted".to_string());
        } else {
            println!("  ✓ Wrong password rejected");
        }
    }

    let release = probe.os_release().await?;
    println!(
        "  ✓ OS: {}",
        release.pretty_name.as_deref().unwrap_or(&release.id)
    );
    if release.family() != Some(fixture.spec.family) {
        println!("  ✗ Expected a {} system", fixture.spec.family);
        failures.push(format!("os family is not {}", fixture.spec.family));
    }

    let missing = probe
        .missing_packages(fixture.spec.family, &fixture.spec.all_packages())
        .await?;
    if missing.is_empty() {
        println!("  ✓ Packages installed: {}", fixture.spec.all_packages().join(", "));
    } else {
        println!("  ✗ Missing packages: {}", missing.join(", "));
        failures.push(format!("missing packages {}", missing.join(", ")));
    }

    Ok(failures)
}

fn credentials_dir(cache_dir: &str, name: &str) -> PathBuf {
    Path::new(cache_dir).join("credentials").join(name)
}
