//! Classifier Interface and Rule-Based Mock

use crate::InferenceError;
use feature_engine::WindowStats;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Score for one label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    /// Normalized score (0.0 to 1.0)
    pub score: f32,
}

/// Output of one inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// One score per label, in label order
    pub scores: Vec<LabelScore>,
    /// Optional anomaly score (higher is more anomalous)
    pub anomaly: Option<f32>,
}

impl Classification {
    /// Highest-scoring label
    pub fn top(&self) -> Option<&LabelScore> {
        self.scores
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

/// Opaque model consuming one assembled window
pub trait InferenceEngine: Send {
    /// Class labels, in score order
    fn labels(&self) -> &[String];

    /// Values per window the model expects, if fixed
    fn input_len(&self) -> Option<usize> {
        None
    }

    /// Classify one interleaved window of `channels` values per sample
    fn infer(&mut self, window: &[f32], channels: usize) -> Result<Classification, InferenceError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn labels(&self) -> &[String] {
        (**self).labels()
    }

    fn input_len(&self) -> Option<usize> {
        (**self).input_len()
    }

    fn infer(&mut self, window: &[f32], channels: usize) -> Result<Classification, InferenceError> {
        (**self).infer(window, channels)
    }
}

/// Motion classifier driven by window statistics (no model file)
pub struct MockClassifier {
    labels: Vec<String>,
    input_len: Option<usize>,
    /// Magnitude std-dev below which the sensor is considered still (g)
    idle_threshold: f64,
    /// Magnitude std-dev above which motion is considered shaking (g)
    shake_threshold: f64,
}

impl MockClassifier {
    /// Create a classifier, optionally pinned to an input length
    pub fn new(input_len: Option<usize>) -> Self {
        info!("Creating mock classifier");
        Self {
            labels: vec!["idle".to_string(), "motion".to_string(), "shake".to_string()],
            input_len,
            idle_threshold: 0.05,
            shake_threshold: 0.6,
        }
    }
}

impl InferenceEngine for MockClassifier {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn input_len(&self) -> Option<usize> {
        self.input_len
    }

    fn infer(&mut self, window: &[f32], channels: usize) -> Result<Classification, InferenceError> {
        if let Some(expected) = self.input_len {
            if window.len() != expected {
                return Err(InferenceError::InvalidInputShape {
                    expected,
                    actual: window.len(),
                });
            }
        }
        if channels == 0 || window.len() % channels != 0 {
            return Err(InferenceError::InferenceFailed(format!(
                "window of {} values is not a whole number of {}-channel samples",
                window.len(),
                channels
            )));
        }

        let stats = WindowStats::compute(window, channels);
        let spread = stats.magnitude.std_dev;

        let probabilities: [f32; 3] = if spread < self.idle_threshold {
            [0.90, 0.08, 0.02]
        } else if spread < self.shake_threshold {
            let conf = (0.6 + spread).clamp(0.6, 0.95) as f32;
            [(1.0 - conf) * 0.7, conf, (1.0 - conf) * 0.3]
        } else {
            let conf = (spread / 2.0).clamp(0.6, 0.99) as f32;
            [(1.0 - conf) * 0.2, (1.0 - conf) * 0.8, conf]
        };

        // distance of the mean magnitude from 1 g
        let anomaly = (stats.magnitude.mean - 1.0).abs() as f32;
        debug!("Mock inference: spread={:.3}, anomaly={:.3}", spread, anomaly);

        Ok(Classification {
            scores: self
                .labels
                .iter()
                .zip(probabilities)
                .map(|(label, score)| LabelScore {
                    label: label.clone(),
                    score,
                })
                .collect(),
            anomaly: Some(anomaly),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn still_window(samples: usize) -> Vec<f32> {
        (0..samples).flat_map(|_| [0.0, 0.0, 1.0]).collect()
    }

    #[test]
    fn test_still_sensor_is_idle() {
        let mut engine = MockClassifier::new(None);
        let result = engine.infer(&still_window(200), 3).unwrap();

        assert_eq!(result.top().unwrap().label, "idle");
        assert!(result.anomaly.unwrap() < 1e-6);
    }

    #[test]
    fn test_large_swings_are_shake() {
        let mut engine = MockClassifier::new(None);
        let window: Vec<f32> = (0..200)
            .flat_map(|i| {
                let x = if i % 2 == 0 { 2.5 } else { -0.2 };
                [x, 0.0, 1.0]
            })
            .collect();

        let result = engine.infer(&window, 3).unwrap();
        assert_eq!(result.top().unwrap().label, "shake");
    }

    #[test]
    fn test_input_shape_is_checked() {
        let mut engine = MockClassifier::new(Some(600));
        let err = engine.infer(&still_window(100), 3).unwrap_err();
        assert!(matches!(
            err,
            InferenceError::InvalidInputShape { expected: 600, actual: 300 }
        ));
    }
}
