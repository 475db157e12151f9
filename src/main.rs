// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Video analytics runtime — multi-pipeline RTSP ingestion, detection,
//! tracking and behavior-rule dispatch.
//!
//! Usage:
//!   video-analytics run      --config config.toml
//!   video-analytics status   --config config.toml
//!   video-analytics validate --config config.toml

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use video_analytics::api;
use video_analytics::config::Config;
use video_analytics::manager::PipelineManager;

#[derive(Parser)]
#[command(name = "video-analytics", about = "Multi-pipeline video analytics runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every enabled source's pipeline and (if enabled) the HTTP API.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Load the config, start nothing, and print a brief summary.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Load and validate the config, reporting success or the first error.
    Validate {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run_pipelines(config).await,
        Command::Status { config } => run_status(config),
        Command::Validate { config } => run_validate(config),
    }
}

async fn run_pipelines(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        sources = cfg.sources.len(),
        storage_path = ?cfg.storage_path,
        max_pipelines = cfg.max_pipelines,
        "starting video analytics runtime"
    );

    let manager = match PipelineManager::new(cfg.clone()).await {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to start pipeline manager");
            std::process::exit(1);
        }
    };

    if cfg.api.enabled {
        let api_manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = api::start_server(api_manager).await {
                error!(error = %e, "API server exited with error");
            }
        });
    } else {
        warn!("API disabled in config, running headless");
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received CTRL+C, shutting down"),
        Err(e) => error!(error = %e, "signal error"),
    }

    manager.shutdown().await;
}

fn run_status(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    println!("=== Video Analytics Status ===");
    println!("Config      : {}", config_path.display());
    println!("Storage path: {}", cfg.storage_path.display());
    println!("Max pipelines: {}", cfg.max_pipelines);
    println!("API         : {}", if cfg.api.enabled { format!("enabled on :{}", cfg.api.port) } else { "disabled".to_string() });
    println!("Sources     : {}", cfg.sources.len());
    for src in &cfg.sources {
        println!(
            "  {} ({:?})  {}x{}@{}fps  enabled={}",
            src.id, src.protocol, src.width, src.height, src.fps, src.enabled
        );
    }
}

fn run_validate(config_path: PathBuf) {
    match Config::from_file(&config_path) {
        Ok(cfg) => {
            println!("OK: {} is valid ({} source(s))", config_path.display(), cfg.sources.len());
        }
        Err(e) => {
            eprintln!("Invalid config '{}': {}", config_path.display(), e);
            std::process::exit(1);
        }
    }
}
