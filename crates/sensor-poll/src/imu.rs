//! Simulated accelerometer with a bounded hardware FIFO
//!
//! Samples accumulate at `sample_rate_hz` from the moment the sensor is
//! enabled. The FIFO holds `fifo_bytes / sample_size` samples; anything older
//! is lost and reported through `overflow_count`.

use crate::source::SampleSource;
use crate::SensorError;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

/// Bytes per accelerometer sample (X, Y, Z as f32)
pub const IMU_SAMPLE_SIZE: usize = 3 * std::mem::size_of::<f32>();

/// IMU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Sensor name
    pub name: String,
    /// Output data rate in Hz
    pub sample_rate_hz: u32,
    /// Hardware FIFO size in bytes
    pub fifo_bytes: usize,
    /// Motion frequency of the simulated signal (Hz)
    pub motion_hz: f32,
    /// Motion amplitude (g)
    pub motion_g: f32,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            name: "Accelerometer".to_string(),
            sample_rate_hz: 100,
            fifo_bytes: 1024,
            motion_hz: 1.5,
            motion_g: 0.5,
        }
    }
}

/// Simulated MEMS accelerometer
pub struct SimulatedImu {
    config: ImuConfig,
    /// Enable time; `None` while disabled
    started: Option<Instant>,
    /// Index of the oldest sample still in the FIFO
    next_sample: u64,
    /// Samples dropped since the last overflow query
    lost: u64,
}

impl SimulatedImu {
    /// Create a simulated IMU with the given signal shape
    pub fn new(config: ImuConfig) -> Self {
        Self {
            config,
            started: None,
            next_sample: 0,
            lost: 0,
        }
    }

    /// FIFO depth in samples
    pub fn fifo_depth(&self) -> usize {
        self.config.fifo_bytes / IMU_SAMPLE_SIZE
    }

    /// Samples produced by the hardware since enable
    fn produced(&self, started: Instant) -> u64 {
        let elapsed = started.elapsed();
        elapsed.as_micros() as u64 * self.config.sample_rate_hz as u64 / 1_000_000
    }

    /// Drop samples the FIFO could not hold; returns the samples pending
    fn sync_fifo(&mut self, started: Instant) -> u64 {
        let produced = self.produced(started);
        let depth = self.fifo_depth() as u64;
        let pending = produced - self.next_sample;
        if pending > depth {
            let dropped = pending - depth;
            self.lost += dropped;
            self.next_sample += dropped;
            return depth;
        }
        pending
    }

    fn sample(&self, index: u64) -> [f32; 3] {
        let t = index as f32 / self.config.sample_rate_hz as f32;
        let phase = std::f32::consts::TAU * self.config.motion_hz * t;
        [
            self.config.motion_g * phase.sin(),
            0.5 * self.config.motion_g * phase.cos(),
            1.0,
        ]
    }
}

impl SampleSource for SimulatedImu {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn sample_size(&self) -> usize {
        IMU_SAMPLE_SIZE
    }

    fn enable(&mut self) -> Result<(), SensorError> {
        if self.config.sample_rate_hz == 0 || self.fifo_depth() == 0 {
            return Err(SensorError::Enable(self.config.name.clone()));
        }
        info!(
            "{} enabled: {} Hz, FIFO depth {} samples",
            self.config.name,
            self.config.sample_rate_hz,
            self.fifo_depth()
        );
        self.started = Some(Instant::now());
        self.next_sample = 0;
        self.lost = 0;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), SensorError> {
        if self.started.take().is_none() {
            return Err(SensorError::Disable(self.config.name.clone()));
        }
        debug!("{} disabled", self.config.name);
        Ok(())
    }

    fn overflow_count(&mut self) -> u32 {
        if let Some(started) = self.started {
            self.sync_fifo(started);
        }
        let lost = self.lost.min(u32::MAX as u64) as u32;
        self.lost = 0;
        lost
    }

    fn read_samples(&mut self, max_count: usize, out: &mut [u8]) -> Result<usize, SensorError> {
        let started = self
            .started
            .ok_or_else(|| SensorError::NotEnabled(self.config.name.clone()))?;

        let pending = self.sync_fifo(started) as usize;
        let count = pending.min(max_count).min(out.len() / IMU_SAMPLE_SIZE);

        for (i, slot) in out.chunks_exact_mut(IMU_SAMPLE_SIZE).take(count).enumerate() {
            let sample = self.sample(self.next_sample + i as u64);
            for (axis, bytes) in sample.iter().zip(slot.chunks_exact_mut(4)) {
                bytes.copy_from_slice(&axis.to_le_bytes());
            }
        }

        self.next_sample += count as u64;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_fifo_depth() {
        // 1024-byte FIFO, 12-byte samples
        assert_eq!(SimulatedImu::new(ImuConfig::default()).fifo_depth(), 85);
    }

    #[test]
    fn test_read_requires_enable() {
        let mut imu = SimulatedImu::new(ImuConfig::default());
        let mut out = [0u8; 120];
        assert!(matches!(imu.read_samples(10, &mut out), Err(SensorError::NotEnabled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_accumulate_with_time() {
        let mut imu = SimulatedImu::new(ImuConfig::default());
        imu.enable().unwrap();

        tokio::time::advance(Duration::from_millis(100)).await;

        let mut out = vec![0u8; 85 * IMU_SAMPLE_SIZE];
        assert_eq!(imu.read_samples(85, &mut out).unwrap(), 10);
        assert_eq!(imu.overflow_count(), 0);

        // z axis carries gravity
        let z = f32::from_le_bytes([out[8], out[9], out[10], out[11]]);
        assert_eq!(z, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_overflow_is_reported_once() {
        let mut imu = SimulatedImu::new(ImuConfig::default());
        imu.enable().unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        // 200 produced, 85 kept
        assert_eq!(imu.overflow_count(), 115);
        assert_eq!(imu.overflow_count(), 0);

        let mut out = vec![0u8; 100 * IMU_SAMPLE_SIZE];
        assert_eq!(imu.read_samples(100, &mut out).unwrap(), 85);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_respects_max_count() {
        let mut imu = SimulatedImu::new(ImuConfig::default());
        imu.enable().unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;

        let mut out = vec![0u8; 85 * IMU_SAMPLE_SIZE];
        assert_eq!(imu.read_samples(20, &mut out).unwrap(), 20);
        assert_eq!(imu.read_samples(85, &mut out).unwrap(), 30);
    }
}
