pub mod fixture;
pub mod images;
pub mod pipeline;
pub mod validate;

use anyhow::{Context, Result};
use fixture_config::parser;
use fixture_config::resolver::ResolutionContext;
use fixture_config::Config;
use fixture_core::ImageSpec;
use std::path::Path;

/// Parse, resolve and validate the configuration
pub fn load_config(config_path: &Path) -> Result<Config> {
    parser::load(config_path, &ResolutionContext::from_env())
        .with_context(|| format!("Failed to load {}", config_path.display()))
}

/// Specs for `names`, or for every image when `names` is empty
pub fn select_images(config: &Config, names: &[String]) -> Result<Vec<ImageSpec>> {
    let names: Vec<&String> = if names.is_empty() {
        config.images.keys().collect()
    } else {
        names.iter().collect()
    };

    names
        .into_iter()
        .map(|name| image_spec(config, name))
        .collect()
}

/// Spec for one image
pub fn image_spec(config: &Config, name: &str) -> Result<ImageSpec> {
    let image = config.image(name)?;
    ImageSpec::from_config(name, image, config.name.as_deref())
        .with_context(|| format!("Invalid image '{}'", name))
}
