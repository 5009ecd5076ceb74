use super::{image_spec, load_config, select_images};
use anyhow::{Context, Result};
use fixture_core::dockerfile::{AUTHORIZED_KEYS_FILE, CHPASSWD_FILE, render_dockerfile};
use fixture_core::{AuthMethod, Credential, ImageBuilder};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub async fn render(config_path: &Path, image: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let spec = image_spec(&config, image)?;

    print!("{}", render_dockerfile(&spec));

    let context_file = match spec.auth {
        AuthMethod::PublicKey { .. } => AUTHORIZED_KEYS_FILE,
        AuthMethod::Password { .. } => CHPASSWD_FILE,
    };
    eprintln!("# Build context: Dockerfile, {}", context_file);
    Ok(0)
}

pub async fn build(config_path: &Path, images: Vec<String>, force: bool) -> Result<i32> {
    let config = load_config(config_path)?;
    let specs = select_images(&config, &images)?;
    let builder = ImageBuilder::new()
        .force(force)
        .build_timeout(Duration::from_secs(config.settings.build_timeout));
    let keys = tempfile::tempdir()?;

    for spec in specs {
        if is_generated(&spec.auth) {
            info!(
                image = %spec.name,
                "No credential configured; this build warms the layer cache, fixtures rebuild the credential layer"
            );
        }
        let credential = Credential::resolve(&spec.auth, &keys.path().join(&spec.name), &spec.name)
            .await
            .with_context(|| format!("Failed to resolve credential for '{}'", spec.name))?;
        let built = builder
            .ensure(&spec, &credential)
            .await
            .with_context(|| format!("Failed to build '{}'", spec.name))?;

        let state = if built.reused { "up to date" } else { "built" };
        println!("✓ {} ({})", built.tag, state);
    }
    Ok(0)
}

pub async fn clean(config_path: &Path, images: Vec<String>) -> Result<i32> {
    let config = load_config(config_path)?;
    let builder = ImageBuilder::new();

    for spec in select_images(&config, &images)? {
        if !builder.image_exists(&spec.tag).await? {
            println!("  {} (not present)", spec.tag);
            continue;
        }
        if builder.remove(&spec.tag).await? {
            println!("✓ Removed {}", spec.tag);
        } else {
            println!("✗ Could not remove {}", spec.tag);
        }
    }
    Ok(0)
}

fn is_generated(auth: &AuthMethod) -> bool {
    matches!(
        auth,
        AuthMethod::PublicKey { public_key: None } | AuthMethod::Password { password: None }
    )
}
