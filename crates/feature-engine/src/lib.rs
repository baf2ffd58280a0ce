//! Feature Window Assembly
//!
//! Builds fixed-length, overlapping sample windows from an SDS stream and
//! summarizes them for classifiers.

mod statistics;
mod window;

pub use statistics::{channel, magnitude, SignalStats, WindowStats};
pub use window::{SlidingWindow, WindowConfig, WindowState};

use thiserror::Error;

/// Errors from window assembly
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("Invalid window geometry: {0}")]
    InvalidGeometry(String),
    #[error("Shift increment must be {expected} values, got {actual}")]
    ShiftSize { expected: usize, actual: usize },
}
