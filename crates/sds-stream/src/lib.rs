//! Synchronous Data Stream (SDS) Buffers
//!
//! Provides the bounded byte stream that sits between a sensor producer task
//! and its consumer: all-or-nothing writes, non-blocking reads, and a
//! high-watermark event delivered through [`EventFlags`].

mod buffer;
mod events;
mod registry;

pub use buffer::{RingStream, StreamStats};
pub use events::{EventFlags, StreamEvent};
pub use registry::{StreamHandle, StreamRegistry};

use std::sync::Arc;
use thiserror::Error;

/// Errors raised by stream and event operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Invalid or exhausted buffer configuration
    #[error("Capacity error: {0}")]
    Capacity(String),
    /// Operation on a closed or unknown stream
    #[error("Invalid stream handle: {0}")]
    InvalidHandle(usize),
    /// A second subscriber tried to register on the same stream
    #[error("Stream already has an event subscriber")]
    AlreadySubscribed,
    /// Event wait exceeded its timeout
    #[error("Timed out waiting for events after {0}ms")]
    Timeout(u64),
}

/// Destination for timestamped sample batches produced by a poll loop.
///
/// Implementations must accept a batch in full or not at all and return the
/// number of bytes accepted.
pub trait SampleSink: Send + Sync {
    /// Enqueue one batch captured at `timestamp_ms`
    fn write_batch(&self, timestamp_ms: u32, data: &[u8]) -> usize;
}

impl SampleSink for RingStream {
    fn write_batch(&self, _timestamp_ms: u32, data: &[u8]) -> usize {
        self.write(data)
    }
}

impl<T: SampleSink + ?Sized> SampleSink for Arc<T> {
    fn write_batch(&self, timestamp_ms: u32, data: &[u8]) -> usize {
        (**self).write_batch(timestamp_ms, data)
    }
}
