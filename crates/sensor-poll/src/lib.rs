//! Sensor Polling for SDS Streams
//!
//! Drives a hardware sample source at a fixed period and writes each batch
//! into a [`sds_stream::SampleSink`]. FIFO overflow, starvation and refused
//! stream writes are absorbed per tick and exposed as counters.

mod imu;
mod poller;
mod source;

pub use imu::{ImuConfig, SimulatedImu};
pub use poller::{PollConfig, PollCounters, PollStats, PollerHandle, SensorPoller};
pub use source::{SampleBatch, SampleSource};

use thiserror::Error;

/// Sensor driver errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("Failed to enable sensor {0}")]
    Enable(String),

    #[error("Failed to disable sensor {0}")]
    Disable(String),

    #[error("Sensor {0} not enabled")]
    NotEnabled(String),

    #[error("Sensor read failed: {0}")]
    Read(String),

    #[error("Batch payload is {actual} bytes, expected {expected}")]
    BatchSize { expected: usize, actual: usize },

    #[error("Poll task failed: {0}")]
    TaskFailed(String),
}
