pub mod types;
pub mod config;
pub mod data;
pub mod processing;
pub mod dissolve;
pub mod layers;
pub mod charts;
pub mod render;
pub mod server;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate one species by canton and province and write charts, layers and tables
    Generate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Occurrence file, overriding `input.occurrences`
        #[arg(long, value_name = "FILE")]
        occurrences: Option<PathBuf>,
        /// Species to map; defaults to the first alphabetically
        #[arg(long)]
        species: Option<String>,
    },
    /// Serve the interactive map with file upload
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// List the species present in an occurrence file
    Species {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(long, value_name = "FILE")]
        occurrences: Option<PathBuf>,
    },
}

fn occurrence_path(app_config: &config::AppConfig, flag: &Option<PathBuf>) -> anyhow::Result<PathBuf> {
    flag.clone()
        .or_else(|| app_config.input.occurrences.clone())
        .ok_or_else(|| anyhow!("No occurrence file given (use --occurrences or input.occurrences)"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Generate { config, occurrences, species } => {
            info!("Generating outputs with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(config)?;
            let path = occurrence_path(&app_config, occurrences)?;

            // 1. Load data
            let format = data::OccurrenceFormat::from_config(&app_config);
            let set = data::load_occurrences(&path, &format)?;
            let layer = data::load_regions(&app_config)?;
            let provinces = dissolve::dissolve_provinces(&layer);

            // 2. Filter and aggregate
            let analysis = processing::run(&set, &layer, species.as_deref())
                .context("Aggregation failed")?;

            // 3. Write artifacts
            let summary = render::write_outputs(&app_config, &layer, &provinces, &analysis)?;

            println!(
                "{}: {} records, {} counted in {} cantons ({} excluded)",
                summary.species,
                summary.records,
                summary.counted,
                summary.by_canton.len(),
                analysis.counts.excluded()
            );
        }
        Commands::Serve { config } => {
            info!("Serving map with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(config)?;

            let layer = data::load_regions(&app_config)?;
            let provinces = dissolve::dissolve_provinces(&layer);

            // A configured occurrence file is preloaded; otherwise wait for an upload
            let occurrences = match &app_config.input.occurrences {
                Some(path) => {
                    let format = data::OccurrenceFormat::from_config(&app_config);
                    Some(data::load_occurrences(path, &format)?)
                }
                None => None,
            };

            let state = server::AppState {
                config: app_config,
                layer,
                provinces,
                occurrences: tokio::sync::RwLock::new(occurrences),
            };
            server::start_server(state).await?;
        }
        Commands::Species { config, occurrences } => {
            let app_config = config::AppConfig::load_from_file(config)?;
            let path = occurrence_path(&app_config, occurrences)?;
            let format = data::OccurrenceFormat::from_config(&app_config);
            let set = data::load_occurrences(&path, &format)?;
            for name in set.species() {
                println!("{}", name);
            }
        }
    }

    Ok(())
}
