//! Streaming Inference
//!
//! Consumer side of the sensor pipeline: an opaque classifier interface, a
//! rule-based mock classifier, and the task that turns watermark events into
//! classified windows.

mod consumer;
mod engine;

pub use consumer::{
    check_wakeups, ConsumerConfig, ConsumerStats, ConsumerStop, InferenceResult, WindowConsumer, EVENT_DATA,
    EVENT_STOP,
};
pub use engine::{Classification, InferenceEngine, LabelScore, MockClassifier};

use feature_engine::WindowError;
use sds_stream::StreamError;
use thiserror::Error;

/// Errors during inference
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Inference failed: {0}")]
    InferenceFailed(String),
    #[error("Invalid consumer configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid input shape: expected {expected} values, got {actual}")]
    InvalidInputShape { expected: usize, actual: usize },
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("Window error: {0}")]
    Window(#[from] WindowError),
}
