//! Sliding Window Assembly
//!
//! Fixed-length window over an interleaved multi-channel sample stream. Each
//! push adds exactly one shift increment of samples; once the window is full
//! every further push drops the oldest shift increment, so consecutive windows
//! overlap by `length - shift` samples.

use crate::WindowError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Window geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Window length in samples
    pub length: usize,
    /// Samples per advance
    pub shift: usize,
    /// Values per sample (e.g. 3 accelerometer axes)
    pub channels: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        // 100 Hz × 2 s, 50% overlap
        Self {
            length: 200,
            shift: 100,
            channels: 3,
        }
    }
}

impl WindowConfig {
    /// Check the window geometry
    pub fn validate(&self) -> Result<(), WindowError> {
        if self.length == 0 || self.shift == 0 || self.channels == 0 {
            return Err(WindowError::InvalidGeometry(format!(
                "length={}, shift={}, channels={} must all be non-zero",
                self.length, self.shift, self.channels
            )));
        }
        if self.length % self.shift != 0 {
            return Err(WindowError::InvalidGeometry(format!(
                "length {} is not a multiple of shift {}",
                self.length, self.shift
            )));
        }
        Ok(())
    }

    /// Bytes in one shift increment of f32 samples
    pub fn shift_bytes(&self) -> usize {
        self.shift * self.channels * std::mem::size_of::<f32>()
    }
}

/// Fill state of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Empty,
    Filling,
    /// Full window available
    Ready,
}

/// Overlapping fixed-length window, allocated once and reused
pub struct SlidingWindow {
    length: usize,
    shift: usize,
    channels: usize,
    /// Samples filled, in [0, length]
    fill: usize,
    buf: Box<[f32]>,
    /// Complete windows produced so far
    completed: u64,
}

impl SlidingWindow {
    /// Create an empty window with the given geometry
    pub fn new(config: &WindowConfig) -> Result<Self, WindowError> {
        config.validate()?;
        debug!(
            "Sliding window: length={}, shift={}, channels={}",
            config.length, config.shift, config.channels
        );
        Ok(Self {
            length: config.length,
            shift: config.shift,
            channels: config.channels,
            fill: 0,
            buf: vec![0.0; config.length * config.channels].into_boxed_slice(),
            completed: 0,
        })
    }

    fn increment_len(&self) -> usize {
        self.shift * self.channels
    }

    /// Make room for one increment and return the value offset to write it at
    fn advance(&mut self) -> usize {
        if self.fill == self.length {
            let step = self.increment_len();
            self.buf.copy_within(step.., 0);
            (self.length - self.shift) * self.channels
        } else {
            let offset = self.fill * self.channels;
            self.fill += self.shift;
            offset
        }
    }

    fn settle(&mut self) -> WindowState {
        if self.fill == self.length {
            self.completed += 1;
            if self.completed == 1 {
                info!("First complete window after {} samples", self.length);
            }
        }
        self.state()
    }

    /// Append one shift increment of interleaved samples
    pub fn push(&mut self, samples: &[f32]) -> Result<WindowState, WindowError> {
        let n = self.increment_len();
        if samples.len() != n {
            return Err(WindowError::ShiftSize {
                expected: n,
                actual: samples.len(),
            });
        }

        let offset = self.advance();
        self.buf[offset..offset + n].copy_from_slice(samples);
        Ok(self.settle())
    }

    /// Append one shift increment given as little-endian f32 bytes
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<WindowState, WindowError> {
        let n = self.increment_len();
        let expected = n * std::mem::size_of::<f32>();
        if bytes.len() != expected {
            return Err(WindowError::ShiftSize {
                expected,
                actual: bytes.len(),
            });
        }

        let offset = self.advance();
        for (dst, src) in self.buf[offset..offset + n].iter_mut().zip(bytes.chunks_exact(4)) {
            *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        }
        Ok(self.settle())
    }

    /// Fill state of the window
    pub fn state(&self) -> WindowState {
        match self.fill {
            0 => WindowState::Empty,
            f if f == self.length => WindowState::Ready,
            _ => WindowState::Filling,
        }
    }

    /// The full window, once one has been assembled
    pub fn window(&self) -> Option<&[f32]> {
        (self.state() == WindowState::Ready).then_some(&self.buf[..])
    }

    /// Samples filled so far
    pub fn fill(&self) -> usize {
        self.fill
    }

    /// Samples per window
    pub fn length(&self) -> usize {
        self.length
    }

    /// Samples per shift increment
    pub fn shift(&self) -> usize {
        self.shift
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Bytes consumed per push
    pub fn shift_bytes(&self) -> usize {
        self.increment_len() * std::mem::size_of::<f32>()
    }

    /// Full windows assembled so far
    pub fn windows_completed(&self) -> u64 {
        self.completed
    }

    /// Return to `Empty` without reallocating
    pub fn reset(&mut self) {
        self.fill = 0;
        self.completed = 0;
        self.buf.fill(0.0);
    }
}
