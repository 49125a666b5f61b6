pub mod acquire;
pub mod config;
pub mod data;
pub mod error;
pub mod grid;
pub mod pipeline;
pub mod processing;
pub mod projection;
pub mod render;
pub mod smoothing;
pub mod tidy;
pub mod types;

use acquire::{Cache, HttpFetcher};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `valkarta=debug`
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and unpack the election inputs into the cache
    Fetch {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Build the faceted party popularity map
    Generate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&cli.log))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Fetch { config } => {
            let app_config = config::AppConfig::load_or_default(config)?;
            let cache = Cache::new(&app_config.input.cache_dir);
            let inputs = cache.ensure_all(&app_config.input, &HttpFetcher::new()?).await?;
            println!("votes:     {}", inputs.votes.display());
            println!("districts: {}", inputs.districts.display());
            println!("counties:  {}", inputs.counties.display());
        }
        Commands::Generate { config } => {
            let app_config = config::AppConfig::load_or_default(config)?;

            // 1. Acquire
            let cache = Cache::new(&app_config.input.cache_dir);
            let inputs = cache.ensure_all(&app_config.input, &HttpFetcher::new()?).await?;

            // 2. Load
            let sources = pipeline::Sources {
                table: tidy::load_vote_table(&inputs.votes, &app_config.table)?,
                districts: data::load_districts(&inputs.districts, &app_config.input)?,
                counties: data::load_counties(&inputs.counties, &app_config.input)?,
            };

            // 3. Tidy, join, smooth, render
            let smoother = smoothing::from_config(&app_config.model);
            let outcome = pipeline::run(&app_config, smoother.as_ref(), sources)?;

            println!(
                "{} vote rows from {} districts and {} geometries dropped in the join, {} zero-vote districts",
                outcome.join.dropped_vote_rows,
                outcome.join.dropped_vote_districts,
                outcome.join.dropped_geometries,
                outcome.normalized.zero_vote_districts.len()
            );
            println!("{} grid points inside the national boundary", outcome.grid_points);
            for (party, err) in &outcome.surfaces.failed {
                eprintln!("No panel for {}: {}", party, err);
            }
            println!(
                "Map with {} panels written to {}",
                outcome.surfaces.predictions.len(),
                app_config.output.path.display()
            );
        }
    }

    Ok(())
}
