#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the flood map risk engine.
//!
//! Loads zone boundaries, runs the recomputation scheduler until Ctrl-C,
//! triggers one-off cycles, runs rainfall what-if simulations, and
//! prints hotspots, zone risk and the operator dashboard as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flood_map_config::FloodMapConfig;
use flood_map_database::{DuckDbStore, SpatialStore};
use flood_map_flood_models::ModerationStatus;
use flood_map_flood_models::clock::SystemClock;
use flood_map_pipeline::{RecomputationScheduler, ReportSubmission, RiskEngine};
use flood_map_weather::OpenWeatherProvider;
use serde::Serialize;

/// Flood report hotspot detection and ward risk scoring.
#[derive(Parser)]
#[command(name = "flood_map")]
#[command(about = "Flood hotspot detection and ward risk scoring")]
struct Cli {
    /// TOML file overriding the built-in configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Load ward boundaries from a `GeoJSON` `FeatureCollection`.
    LoadZones {
        /// Path to the `GeoJSON` file.
        file: PathBuf,
    },

    /// Run the recomputation scheduler until Ctrl-C.
    Run {
        /// Also run one cycle immediately instead of waiting an interval.
        #[arg(long)]
        now: bool,
    },

    /// Run a single recomputation cycle.
    Recompute,

    /// Score zones under scaled rainfall without saving anything.
    Simulate {
        /// Only simulate this zone (default: all zones).
        #[arg(long)]
        zone: Option<i64>,

        /// Rainfall multiplier, between 0.1 and 10.
        #[arg(long)]
        multiplier: f64,
    },

    /// List the current hotspots.
    Hotspots,

    /// List every zone's risk, or one zone's.
    Zones {
        /// Only show this zone.
        #[arg(long)]
        id: Option<i64>,
    },

    /// Show totals, recent reports and zone risk.
    Dashboard {
        /// Number of recent reports to include.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Submit a flood report. The zone is rescored on the next cycle.
    Report {
        /// Latitude in degrees.
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        /// Longitude in degrees.
        #[arg(long, allow_negative_numbers = true)]
        lng: f64,

        /// `LOW`, `MEDIUM` or `HIGH`.
        #[arg(long)]
        severity: String,

        /// Free-text note.
        #[arg(long)]
        note: Option<String>,

        /// Identity recorded as the submitter.
        #[arg(long, default_value = "cli")]
        submitted_by: String,
    },

    /// Set a report's moderation status.
    Moderate {
        /// Report id.
        id: i64,

        /// `PENDING`, `APPROVED` or `REJECTED`.
        status: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::formatted_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();
    let cli = Cli::parse();

    let config = FloodMapConfig::load(cli.config.as_deref())?;
    let store: Arc<dyn SpatialStore> = Arc::new(DuckDbStore::open(&config.database.path)?);

    if let Commands::LoadZones { file } = &cli.command {
        let text = std::fs::read_to_string(file)?;
        let zones = flood_map_spatial::parse_zone_collection(&text)?;
        let inserted = store.insert_zones(zones).await?;
        println!("Loaded {} zones from {}", inserted.len(), file.display());
        return Ok(());
    }

    if config.rainfall.api_key.is_empty() {
        log::warn!("OPENWEATHER_API_KEY is not set; rainfall will be treated as 0 mm");
    }
    let provider = Arc::new(OpenWeatherProvider::new(&config.rainfall)?);
    let engine = Arc::new(RiskEngine::new(
        store,
        provider,
        Arc::new(SystemClock),
        &config,
    ));

    match cli.command {
        Commands::LoadZones { .. } => {}
        Commands::Run { now } => {
            let scheduler = RecomputationScheduler::new(engine, config.scheduler.interval());
            if now {
                print_json(&scheduler.recompute_now().await)?;
            }
            scheduler.start();

            tokio::signal::ctrl_c().await?;
            log::info!("Ctrl-C received, stopping scheduler");
            scheduler.stop().await;
        }
        Commands::Recompute => print_json(&engine.run_cycle().await)?,
        Commands::Simulate {
            zone: Some(zone_id),
            multiplier,
        } => print_json(&engine.simulate(zone_id, multiplier).await?)?,
        Commands::Simulate {
            zone: None,
            multiplier,
        } => print_json(&engine.simulate_all(multiplier).await?)?,
        Commands::Hotspots => print_json(&engine.get_hotspots().await?)?,
        Commands::Zones { id: Some(zone_id) } => {
            print_json(&engine.get_zone_risk(zone_id).await?)?;
        }
        Commands::Zones { id: None } => print_json(&engine.zone_risks().await?)?,
        Commands::Dashboard { limit } => print_json(&engine.dashboard(limit).await?)?,
        Commands::Report {
            lat,
            lng,
            severity,
            note,
            submitted_by,
        } => {
            let report = engine
                .submit_report(ReportSubmission {
                    latitude: lat,
                    longitude: lng,
                    severity,
                    note,
                    submitted_by,
                })
                .await?;
            print_json(&report)?;
        }
        Commands::Moderate { id, status } => {
            let status = ModerationStatus::parse(&status)?;
            engine.moderate_report(id, status).await?;
            println!("Report {id} marked {status}");
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
