use super::load_config;
use anyhow::{Context, Result};
use fixture_core::{Pipeline, PipelineOptions, PipelineReport, StageStatus};
use std::path::{Path, PathBuf};

pub async fn run(
    config_path: &Path,
    checkout: PathBuf,
    use_cache: bool,
    run_id: Option<String>,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let options = PipelineOptions {
        checkout: checkout
            .canonicalize()
            .with_context(|| format!("Checkout {} not found", checkout.display()))?,
        use_cache,
        run_id,
    };

    let report = Pipeline::new(&config, options)?
        .run()
        .await
        .context("Pipeline failed")?;
    print_report(&report);
    Ok(report.exit_code())
}

pub async fn cache_key(config_path: &Path, checkout: PathBuf) -> Result<i32> {
    let config = load_config(config_path)?;
    let key = Pipeline::new(&config, PipelineOptions::new(checkout))?.cache_key()?;
    println!("{}", key);
    Ok(0)
}

fn print_report(report: &PipelineReport) {
    println!();
    println!("Run {}", report.run_id);
    for stage in &report.stages {
        let mark = match stage.status {
            StageStatus::Passed => "✓",
            StageStatus::Failed => "✗",
            StageStatus::Skipped => "-",
        };
        match &stage.message {
            Some(message) => println!("  {} {} ({}ms): {}", mark, stage.stage, stage.duration_ms, message),
            None => println!("  {} {} ({}ms)", mark, stage.stage, stage.duration_ms),
        }
    }
    if let Some(key) = &report.cache_key {
        println!("  Cache key: {}", key);
    }
    println!(
        "  Cache: {}",
        serde_json::to_string(&report.cache).unwrap_or_default()
    );
    if let Some(test) = &report.test {
        println!("  {}", test.summary);
    }
    println!("  Exit code: {}", report.exit_code());
}
