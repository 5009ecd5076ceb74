//! `fixtures`: build SSH test images, run them as fixtures, and run the CI
//! pipeline against them.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;

use logging::LogFormat;

#[derive(Parser)]
#[command(name = "fixtures")]
#[command(about = "SSH test fixtures - image builder and test pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "fixtures.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Strict mode - fail on missing environment variables
        #[arg(short, long)]
        strict: bool,
    },

    /// Print the Dockerfile of an image
    Render {
        /// Image name
        image: String,
    },

    /// Build images, reusing up-to-date ones
    Build {
        /// Images to build (empty means all)
        images: Vec<String>,

        /// Rebuild even if an up-to-date image exists
        #[arg(short, long)]
        force: bool,
    },

    /// Remove built images
    Clean {
        /// Images to remove (empty means all)
        images: Vec<String>,
    },

    /// Start a fixture and leave it running
    Up {
        /// Image name
        image: String,

        /// Container name
        #[arg(long)]
        name: Option<String>,
    },

    /// Remove a fixture started with `up`
    Down {
        /// Container name
        name: String,
    },

    /// Start a throwaway fixture and check login, OS and packages
    Verify {
        /// Image name
        image: String,
    },

    /// Run the CI pipeline
    Pipeline {
        /// Source checkout
        #[arg(long, default_value = ".")]
        checkout: PathBuf,

        /// Do not restore or save the dependency cache
        #[arg(long)]
        no_cache: bool,

        /// Run id (default: timestamp plus random suffix)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Print the dependency cache key of a checkout
    CacheKey {
        /// Source checkout
        #[arg(long, default_value = ".")]
        checkout: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format, &cli.config);

    let exit_code = smol::block_on(async {
        match cli.command {
            Commands::Validate { strict } => commands::validate::run(&cli.config, strict).await,
            Commands::Render { image } => commands::images::render(&cli.config, &image).await,
            Commands::Build { images, force } => {
                commands::images::build(&cli.config, images, force).await
            }
            Commands::Clean { images } => commands::images::clean(&cli.config, images).await,
            Commands::Up { image, name } => commands::fixture::up(&cli.config, &image, name).await,
            Commands::Down { name } => commands::fixture::down(&cli.config, &name).await,
            Commands::Verify { image } => commands::fixture::verify(&cli.config, &image).await,
            Commands::Pipeline {
                checkout,
                no_cache,
                run_id,
            } => commands::pipeline::run(&cli.config, checkout, !no_cache, run_id).await,
            Commands::CacheKey { checkout } => {
                commands::pipeline::cache_key(&cli.config, checkout).await
            }
        }
    })?;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
