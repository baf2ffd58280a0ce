//! SDS Pipeline - Main Entry Point

use anyhow::Context;
use clap::{Parser, Subcommand};
use inference_engine::MockClassifier;
use recorder::FileStore;
use sds_app::{init_logging, run_infer, run_play, run_record, PipelineConfig, RunReport};
use sensor_poll::SimulatedImu;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Sensor-to-stream buffering pipeline
#[derive(Parser, Debug)]
#[command(name = "sds-pipeline")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Stop after this many milliseconds instead of waiting for Ctrl-C
    #[arg(long, value_name = "MS")]
    duration_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the sensor and classify sliding windows
    Infer,
    /// Poll the sensor and record timestamped chunks
    Record {
        /// Recording directory (overrides the configuration)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Replay the next recording through the classifier
    Play {
        /// Stream name; defaults to the configured sensor name
        name: Option<String>,
        /// Recording directory (overrides the configuration)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

async fn shutdown_signal(duration_ms: Option<u64>) {
    match duration_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = PipelineConfig::load(args.config.as_deref()).context("loading configuration")?;
    init_logging(&config.log_level, args.json)?;

    info!("=== SDS Pipeline v{} ===", env!("CARGO_PKG_VERSION"));

    let shutdown = shutdown_signal(args.duration_ms);
    let input_len = Some(config.window.length * config.window.channels);

    let report: RunReport = match args.command {
        Command::Infer => {
            let source = SimulatedImu::new(config.imu.clone());
            run_infer(&config, source, MockClassifier::new(input_len), shutdown).await?
        }
        Command::Record { dir } => {
            let store = FileStore::new(dir.unwrap_or_else(|| config.record.dir.clone()))?;
            let source = SimulatedImu::new(config.imu.clone());
            run_record(&config, source, Arc::new(store), shutdown).await?
        }
        Command::Play { name, dir } => {
            let store = FileStore::new(dir.unwrap_or_else(|| config.record.dir.clone()))?;
            let name = name.unwrap_or_else(|| config.imu.name.clone());
            run_play(
                &config,
                Arc::new(store),
                &name,
                MockClassifier::new(input_len),
                shutdown,
            )
            .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
