//! Hardware Sample Source Interface

use crate::SensorError;

/// A hardware FIFO that can be polled for fixed-size sample units
pub trait SampleSource: Send {
    /// Human-readable sensor name (used in logs)
    fn name(&self) -> &str;

    /// Bytes per sample unit (e.g. 3 axes × 4 bytes)
    fn sample_size(&self) -> usize;

    fn enable(&mut self) -> Result<(), SensorError>;

    fn disable(&mut self) -> Result<(), SensorError>;

    /// Samples lost to FIFO overflow since the last call; 0 if none
    fn overflow_count(&mut self) -> u32;

    /// Read up to `max_count` sample units into `out`, returning the count read
    fn read_samples(&mut self, max_count: usize, out: &mut [u8]) -> Result<usize, SensorError>;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn sample_size(&self) -> usize {
        (**self).sample_size()
    }

    fn enable(&mut self) -> Result<(), SensorError> {
        (**self).enable()
    }

    fn disable(&mut self) -> Result<(), SensorError> {
        (**self).disable()
    }

    fn overflow_count(&mut self) -> u32 {
        (**self).overflow_count()
    }

    fn read_samples(&mut self, max_count: usize, out: &mut [u8]) -> Result<usize, SensorError> {
        (**self).read_samples(max_count, out)
    }
}

/// One poll's worth of samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleBatch<'a> {
    count: usize,
    stride: usize,
    timestamp_ms: u32,
    payload: &'a [u8],
}

impl<'a> SampleBatch<'a> {
    /// Wrap `payload`; its length must be exactly `count * stride`
    pub fn new(
        count: usize,
        stride: usize,
        timestamp_ms: u32,
        payload: &'a [u8],
    ) -> Result<Self, SensorError> {
        let expected = count * stride;
        if payload.len() != expected {
            return Err(SensorError::BatchSize {
                expected,
                actual: payload.len(),
            });
        }
        Ok(Self {
            count,
            stride,
            timestamp_ms,
            payload,
        })
    }

    /// Samples in the batch
    pub fn count(&self) -> usize {
        self.count
    }

    /// Bytes per sample
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Capture time relative to the start of polling
    pub fn timestamp_ms(&self) -> u32 {
        self.timestamp_ms
    }

    /// Packed sample bytes
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}
