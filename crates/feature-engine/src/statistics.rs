//! Per-window signal statistics

use serde::{Deserialize, Serialize};

/// Summary statistics of one signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Root mean square
    pub rms: f64,
    /// Mean absolute sample-to-sample change
    pub mean_abs_delta: f64,
    /// Sign changes around the mean
    pub mean_crossings: usize,
}

impl SignalStats {
    /// Summary statistics of `values`; all zero when empty
    pub fn compute(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let rms = (values.iter().map(|v| v * v).sum::<f64>() / n).sqrt();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mean_abs_delta = if values.len() > 1 {
            values.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };

        let mean_crossings = values
            .windows(2)
            .filter(|w| {
                let (a, b) = (w[0] - mean, w[1] - mean);
                a != 0.0 && b != 0.0 && a.signum() != b.signum()
            })
            .count();

        Self {
            mean,
            std_dev: variance.sqrt(),
            min,
            max,
            rms,
            mean_abs_delta,
            mean_crossings,
        }
    }
}

/// Statistics of an interleaved multi-channel window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    /// One entry per channel
    pub channels: Vec<SignalStats>,
    /// Euclidean norm across channels, per sample
    pub magnitude: SignalStats,
}

impl WindowStats {
    /// Per-channel statistics of an interleaved window
    pub fn compute(window: &[f32], channels: usize) -> Self {
        if channels == 0 {
            return Self::default();
        }

        let per_channel = (0..channels)
            .map(|c| SignalStats::compute(&channel(window, channels, c)))
            .collect();

        Self {
            channels: per_channel,
            magnitude: SignalStats::compute(&magnitude(window, channels)),
        }
    }
}

/// Values of channel `index` from an interleaved window
pub fn channel(window: &[f32], channels: usize, index: usize) -> Vec<f64> {
    window
        .iter()
        .skip(index)
        .step_by(channels.max(1))
        .map(|&v| v as f64)
        .collect()
}

/// Per-sample Euclidean norm across channels
pub fn magnitude(window: &[f32], channels: usize) -> Vec<f64> {
    window
        .chunks_exact(channels.max(1))
        .map(|sample| sample.iter().map(|&v| (v as f64).powi(2)).sum::<f64>().sqrt())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_std_dev() {
        let stats = SignalStats::compute(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((stats.mean - 5.0).abs() < 1e-9);
        assert!((stats.std_dev - 2.0).abs() < 1e-9);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
    }

    #[test]
    fn test_mean_crossings() {
        let stats = SignalStats::compute(&[3.0, 7.0, 4.0, 8.0, 2.0, 6.0]);
        assert_eq!(stats.mean_crossings, 5);
    }

    #[test]
    fn test_empty_signal() {
        assert_eq!(SignalStats::compute(&[]), SignalStats::default());
    }

    #[test]
    fn test_channel_split_and_magnitude() {
        // two samples of (x, y, z)
        let window = [3.0, 4.0, 0.0, 0.0, 0.0, 2.0];
        assert_eq!(channel(&window, 3, 1), vec![4.0, 0.0]);
        assert_eq!(magnitude(&window, 3), vec![5.0, 2.0]);

        let stats = WindowStats::compute(&window, 3);
        assert_eq!(stats.channels.len(), 3);
        assert!((stats.magnitude.mean - 3.5).abs() < 1e-9);
    }
}
