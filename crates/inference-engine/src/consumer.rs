//! Watermark-Driven Window Consumer
//!
//! Waits for the stream's high-watermark event, drains every complete shift
//! increment into a sliding window, and runs inference on each full window.
//! Wake-ups may coalesce, so each wake drains until less than one increment
//! remains rather than assuming one threshold's worth of data.

use crate::engine::{Classification, InferenceEngine};
use crate::InferenceError;
use feature_engine::{SlidingWindow, WindowState};
use sds_stream::{EventFlags, RingStream, StreamError, StreamEvent};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Flag set by the stream's watermark event
pub const EVENT_DATA: u32 = 1 << 0;
/// Flag set to wake the consumer for shutdown
pub const EVENT_STOP: u32 = 1 << 1;

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Upper bound on one event wait; `None` waits forever
    pub wait_timeout_ms: Option<u64>,
    /// Capacity of the result channel
    pub result_queue: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: Some(1000),
            result_queue: 16,
        }
    }
}

/// One classified window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    /// 1-based index of the window
    pub window: u64,
    pub classification: Classification,
    /// Time spent inside the engine (µs)
    pub latency_us: u64,
}

/// Consumer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub wakeups: u64,
    pub increments: u64,
    pub windows: u64,
    pub inference_errors: u64,
    /// Results discarded because the result channel was full
    pub dropped_results: u64,
}

/// Handle that stops a running consumer
#[derive(Clone)]
pub struct ConsumerStop {
    shutdown: Arc<AtomicBool>,
    flags: Arc<EventFlags>,
}

impl ConsumerStop {
    /// Stop the consumer once it has drained the stream
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.flags.set(EVENT_STOP);
    }
}

/// Consumer task state
pub struct WindowConsumer<E> {
    stream: Arc<RingStream>,
    flags: Arc<EventFlags>,
    window: SlidingWindow,
    engine: E,
    results: mpsc::Sender<InferenceResult>,
    config: ConsumerConfig,
    shutdown: Arc<AtomicBool>,
    /// One shift increment of raw bytes
    scratch: Vec<u8>,
    stats: ConsumerStats,
}

impl<E: InferenceEngine> WindowConsumer<E> {
    /// Subscribe to `stream` and prepare a consumer feeding `results`
    pub fn new(
        stream: Arc<RingStream>,
        window: SlidingWindow,
        engine: E,
        results: mpsc::Sender<InferenceResult>,
        config: ConsumerConfig,
    ) -> Result<Self, InferenceError> {
        if let Some(expected) = engine.input_len() {
            let actual = window.length() * window.channels();
            if expected != actual {
                return Err(InferenceError::InvalidInputShape { expected, actual });
            }
        }

        check_wakeups(stream.threshold(), window.shift_bytes(), config.wait_timeout_ms)?;

        let flags = Arc::new(EventFlags::new());
        stream.register_events(flags.clone(), EVENT_DATA, StreamEvent::DATA_HIGH)?;

        info!(
            "Window consumer: {} samples × {} channels, shift {}",
            window.length(),
            window.channels(),
            window.shift()
        );

        Ok(Self {
            scratch: vec![0u8; window.shift_bytes()],
            stream,
            flags,
            window,
            engine,
            results,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: ConsumerStats::default(),
        })
    }

    /// Create the result channel together with the consumer
    pub fn channel(
        stream: Arc<RingStream>,
        window: SlidingWindow,
        engine: E,
        config: ConsumerConfig,
    ) -> Result<(Self, mpsc::Receiver<InferenceResult>), InferenceError> {
        let (tx, rx) = mpsc::channel(config.result_queue.max(1));
        Ok((Self::new(stream, window, engine, tx, config)?, rx))
    }

    /// Handle for stopping the consumer from another task
    pub fn stopper(&self) -> ConsumerStop {
        ConsumerStop {
            shutdown: self.shutdown.clone(),
            flags: self.flags.clone(),
        }
    }

    /// Counters so far
    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Move every complete increment from the stream into the window.
    ///
    /// Returns the number of windows classified.
    pub fn drain(&mut self) -> Result<u64, InferenceError> {
        let step = self.scratch.len();
        let mut classified = 0;

        while self.stream.available() >= step {
            let n = self.stream.read_into(&mut self.scratch);
            self.stats.increments += 1;

            if self.window.push_bytes(&self.scratch[..n])? != WindowState::Ready {
                trace!("Window filling: {}/{}", self.window.fill(), self.window.length());
                continue;
            }

            let Some(values) = self.window.window() else {
                continue;
            };

            let started = Instant::now();
            match self.engine.infer(values, self.window.channels()) {
                Ok(classification) => {
                    self.stats.windows += 1;
                    classified += 1;

                    if let Some(top) = classification.top() {
                        info!(
                            "Inference #{}: label={}, score={:.3}",
                            self.stats.windows, top.label, top.score
                        );
                    }

                    let result = InferenceResult {
                        window: self.stats.windows,
                        classification,
                        latency_us: started.elapsed().as_micros() as u64,
                    };
                    if let Err(e) = self.results.try_send(result) {
                        self.stats.dropped_results += 1;
                        debug!("Inference result dropped: {}", e);
                    }
                }
                Err(e) => {
                    self.stats.inference_errors += 1;
                    warn!("Inference failed: {}", e);
                }
            }
        }

        Ok(classified)
    }

    /// Wait for watermark events and classify windows until stopped.
    ///
    /// The stream subscription is released however the consumer exits.
    pub async fn run(mut self) -> Result<ConsumerStats, InferenceError> {
        info!("Starting window consumer");
        self.consume().await?;
        info!("Window consumer stopped: {:?}", self.stats);
        Ok(self.stats)
    }

    async fn consume(&mut self) -> Result<(), InferenceError> {
        let timeout = self.config.wait_timeout_ms.map(Duration::from_millis);

        while !self.shutdown.load(Ordering::Acquire) {
            match self.flags.wait_any(EVENT_DATA | EVENT_STOP, timeout).await {
                Ok(flags) => {
                    if flags & EVENT_DATA != 0 {
                        self.stats.wakeups += 1;
                    }
                }
                Err(StreamError::Timeout(ms)) => trace!("No stream event within {}ms", ms),
                Err(e) => return Err(e.into()),
            }

            let events = self.stream.take_events();
            trace!("Stream events: {:?}", events);

            self.drain()?;

            if self.results.is_closed() {
                debug!("Result receiver dropped");
                break;
            }
        }

        // data written between the last drain and the stop request
        self.drain()?;
        Ok(())
    }
}

impl<E> Drop for WindowConsumer<E> {
    fn drop(&mut self) {
        self.stream.unregister_events();
    }
}

/// Reject watermark settings under which the consumer could stop waking up.
///
/// Each wake drains down to less than one shift increment, so the next wake
/// needs the stream to climb back across the threshold.
pub fn check_wakeups(
    threshold: usize,
    shift_bytes: usize,
    wait_timeout_ms: Option<u64>,
) -> Result<(), InferenceError> {
    if threshold == 0 && wait_timeout_ms.is_none() {
        return Err(InferenceError::InvalidConfig(
            "a stream without a watermark needs a wait timeout".to_string(),
        ));
    }
    if threshold > 0 && threshold < shift_bytes {
        return Err(InferenceError::InvalidConfig(format!(
            "watermark of {} bytes is below one {}-byte shift increment",
            threshold, shift_bytes
        )));
    }
    Ok(())
}
