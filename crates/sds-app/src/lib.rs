//! Sensor-to-Stream Pipeline
//!
//! Configuration, logging bootstrap and the wiring of the poll loop, ring
//! stream, window consumer and record/replay engine.

pub mod config;
mod pipeline;

pub use config::{ConfigError, PipelineConfig, RecordConfig, StreamConfig};
pub use pipeline::{run_infer, run_play, run_record, InferenceReport, RunReport};

use inference_engine::InferenceError;
use recorder::RecordError;
use sds_stream::StreamError;
use sensor_poll::SensorError;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("Pipeline task failed: {0}")]
    Task(String),
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

/// Initialize logging; `RUST_LOG` overrides `level`
pub fn init_logging(level: &str, json: bool) -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| AppError::Logging(e.to_string()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    result.map_err(|e| AppError::Logging(e.to_string()))
}
