//! Record/Replay Engine
//!
//! Persists timestamped chunks of a stream to named storage through a
//! buffered background writer, and replays them through a buffered background
//! reader with optional real-time pacing.

mod chunk;
mod player;
mod recorder;
mod session;
mod store;

pub use chunk::{decode_chunks, Chunk, ChunkHeader, CHUNK_HEADER_SIZE};
pub use player::{PlayId, Player};
pub use recorder::{RecId, RecordSink, Recorder};
pub use session::{SessionState, SessionStats};
pub use store::{FileStore, MemoryStore, StoreError, StoreReader, StoreWriter, StreamStore};

use sds_stream::StreamError;
use thiserror::Error;

/// Record and replay errors
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Invalid session handle: {0}")]
    InvalidHandle(usize),
    #[error("Session '{name}' is {state:?}")]
    InvalidState { name: String, state: SessionState },
    #[error("Capacity error: {0}")]
    Capacity(String),
    #[error("Chunk of {size} bytes does not fit a {capacity}-byte buffer")]
    ChunkTooLarge { size: usize, capacity: usize },
    #[error("Recording truncated: {0} trailing bytes")]
    Truncated(usize),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("No tokio runtime for the session I/O task")]
    NoRuntime,
}
