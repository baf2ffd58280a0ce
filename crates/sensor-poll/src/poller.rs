//! Fixed-Period Sensor Poll Loop

use crate::source::{SampleBatch, SampleSource};
use crate::SensorError;
use sds_stream::SampleSink;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the poll loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Poll period in milliseconds
    pub period_ms: u64,
    /// Maximum sample units read per tick
    pub max_batch: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            period_ms: 100,
            max_batch: 85,
        }
    }
}

/// Live counters shared between the poll task and its owner
#[derive(Debug, Default)]
pub struct PollCounters {
    ticks: AtomicU64,
    samples: AtomicU64,
    bytes: AtomicU64,
    overflows: AtomicU64,
    samples_lost: AtomicU64,
    starvations: AtomicU64,
    dropped_writes: AtomicU64,
    read_errors: AtomicU64,
}

impl PollCounters {
    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> PollStats {
        PollStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            samples_lost: self.samples_lost.load(Ordering::Relaxed),
            starvations: self.starvations.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of poll loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
    /// Ticks executed
    pub ticks: u64,
    /// Samples delivered to the sink
    pub samples: u64,
    /// Bytes delivered to the sink
    pub bytes: u64,
    /// Ticks on which the hardware FIFO had overflowed
    pub overflows: u64,
    /// Samples lost to FIFO overflow
    pub samples_lost: u64,
    /// Ticks that returned no samples
    pub starvations: u64,
    /// Batches refused by the sink
    pub dropped_writes: u64,
    /// Failed hardware reads
    pub read_errors: u64,
}

/// Periodic producer reading a sample source into a sink
pub struct SensorPoller<S> {
    source: S,
    config: PollConfig,
    counters: Arc<PollCounters>,
    shutdown: Arc<AtomicBool>,
}

impl<S: SampleSource> SensorPoller<S> {
    /// Create a poller for `source`; nothing runs until `run` or `spawn`
    pub fn new(source: S, config: PollConfig) -> Self {
        info!(
            "Sensor poller for {}: period={}ms, max_batch={}",
            source.name(),
            config.period_ms,
            config.max_batch
        );
        Self {
            source,
            config,
            counters: Arc::new(PollCounters::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Counters shared with the running loop
    pub fn counters(&self) -> Arc<PollCounters> {
        self.counters.clone()
    }

    /// Flag checked at every tick boundary; setting it ends `run`
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Scratch buffer large enough for one full batch
    fn scratch(&self) -> Vec<u8> {
        vec![0u8; self.config.max_batch * self.source.sample_size()]
    }

    /// Run one tick: read, check overflow, write to `sink`
    pub fn poll_once<K: SampleSink + ?Sized>(&mut self, sink: &K, timestamp_ms: u32, scratch: &mut [u8]) {
        let counters = &self.counters;
        counters.ticks.fetch_add(1, Ordering::Relaxed);

        let stride = self.source.sample_size();
        let max = self.config.max_batch.min(scratch.len() / stride.max(1));

        let mut count = match self.source.read_samples(max, scratch) {
            Ok(count) => count,
            Err(e) => {
                warn!("{}: sample read failed: {}", self.source.name(), e);
                counters.read_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if count > max {
            warn!(
                "{}: source reported {} samples for a {}-sample read",
                self.source.name(),
                count,
                max
            );
            counters.read_errors.fetch_add(1, Ordering::Relaxed);
            count = max;
        }

        let lost = self.source.overflow_count();
        if lost != 0 {
            warn!("{}: hardware FIFO overflow, {} samples lost", self.source.name(), lost);
            counters.overflows.fetch_add(1, Ordering::Relaxed);
            counters.samples_lost.fetch_add(lost as u64, Ordering::Relaxed);
        }

        if count == 0 {
            debug!("{}: no samples since last tick", self.source.name());
            counters.starvations.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let batch = match SampleBatch::new(count, stride, timestamp_ms, &scratch[..count * stride]) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("{}: {}", self.source.name(), e);
                counters.read_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let written = sink.write_batch(batch.timestamp_ms(), batch.payload());
        if written != batch.payload().len() {
            warn!("{}: SDS write failed ({} bytes)", self.source.name(), batch.payload().len());
            counters.dropped_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.samples.fetch_add(count as u64, Ordering::Relaxed);
            counters.bytes.fetch_add(written as u64, Ordering::Relaxed);
        }
    }

    /// Enable the source and poll it until the shutdown flag is set.
    ///
    /// Ticks are anchored to the start time, so a slow tick does not shift
    /// later ones.
    pub async fn run<K: SampleSink + ?Sized>(&mut self, sink: &K) -> Result<PollStats, SensorError> {
        self.source.enable()?;
        info!("Polling {}", self.source.name());

        let period = Duration::from_millis(self.config.period_ms);
        let start = Instant::now();
        let mut tick = start;
        let mut scratch = self.scratch();

        while !self.shutdown.load(Ordering::Acquire) {
            let timestamp_ms = tick.duration_since(start).as_millis() as u32;
            self.poll_once(sink, timestamp_ms, &mut scratch);

            tick += period;
            tokio::time::sleep_until(tick).await;
        }

        self.source.disable()?;
        let stats = self.counters.snapshot();
        info!("Stopped polling {}: {:?}", self.source.name(), stats);
        Ok(stats)
    }
}

impl<S: SampleSource + 'static> SensorPoller<S> {
    /// Spawn the poll loop as a task writing into `sink`
    pub fn spawn<K: SampleSink + 'static>(mut self, sink: K) -> PollerHandle {
        let shutdown = self.shutdown.clone();
        let counters = self.counters.clone();
        let task = tokio::spawn(async move { self.run(&sink).await });

        PollerHandle {
            shutdown,
            counters,
            task,
        }
    }
}

/// Owner side of a spawned poll loop
pub struct PollerHandle {
    shutdown: Arc<AtomicBool>,
    counters: Arc<PollCounters>,
    task: JoinHandle<Result<PollStats, SensorError>>,
}

impl PollerHandle {
    /// Current counters
    pub fn stats(&self) -> PollStats {
        self.counters.snapshot()
    }

    /// Ask the loop to stop at its next tick boundary
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stop the loop and wait for it to finish
    pub async fn join(self) -> Result<PollStats, SensorError> {
        self.stop();
        self.task
            .await
            .map_err(|e| SensorError::TaskFailed(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sds_stream::RingStream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Source returning a scripted number of 4-byte samples per read
    struct ScriptedSource {
        reads: VecDeque<usize>,
        overflows: VecDeque<u32>,
        enabled: Arc<AtomicBool>,
        /// Report this many samples more than were read
        overreport: usize,
    }

    impl ScriptedSource {
        fn new(reads: &[usize], overflows: &[u32]) -> Self {
            Self {
                reads: reads.iter().copied().collect(),
                overflows: overflows.iter().copied().collect(),
                enabled: Arc::new(AtomicBool::new(false)),
                overreport: 0,
            }
        }
    }

    impl SampleSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn sample_size(&self) -> usize {
            4
        }

        fn enable(&mut self) -> Result<(), SensorError> {
            self.enabled.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn disable(&mut self) -> Result<(), SensorError> {
            self.enabled.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn overflow_count(&mut self) -> u32 {
            self.overflows.pop_front().unwrap_or(0)
        }

        fn read_samples(&mut self, max_count: usize, out: &mut [u8]) -> Result<usize, SensorError> {
            let n = self.reads.pop_front().unwrap_or(1).min(max_count);
            out[..n * 4].fill(0x11);
            Ok(n + self.overreport)
        }
    }

    /// Sink recording the virtual time of every write
    #[derive(Default)]
    struct TimingSink {
        writes: Mutex<Vec<(u32, Instant)>>,
    }

    impl SampleSink for TimingSink {
        fn write_batch(&self, timestamp_ms: u32, data: &[u8]) -> usize {
            self.writes.lock().unwrap().push((timestamp_ms, Instant::now()));
            data.len()
        }
    }

    fn config(max_batch: usize) -> PollConfig {
        PollConfig {
            period_ms: 100,
            max_batch,
        }
    }

    #[test]
    fn test_poll_once_counts_conditions() {
        let source = ScriptedSource::new(&[5, 0, 5, 5], &[0, 0, 3, 0]);
        let mut poller = SensorPoller::new(source, config(8));
        let stream = RingStream::new(48, 0).unwrap();
        let mut scratch = poller.scratch();

        for tick in 0..4 {
            poller.poll_once(&stream, tick * 100, &mut scratch);
        }

        let stats = poller.counters().snapshot();
        assert_eq!(stats.ticks, 4);
        assert_eq!(stats.starvations, 1);
        assert_eq!(stats.overflows, 1);
        assert_eq!(stats.samples_lost, 3);
        // 20 + 20 bytes fit in 48, the third batch does not
        assert_eq!(stats.samples, 10);
        assert_eq!(stats.dropped_writes, 1);
        assert_eq!(stream.available(), 40);
    }

    #[test]
    fn test_batch_limited_by_max_batch() {
        let source = ScriptedSource::new(&[50], &[]);
        let mut poller = SensorPoller::new(source, config(8));
        let stream = RingStream::new(1024, 0).unwrap();
        let mut scratch = poller.scratch();

        poller.poll_once(&stream, 0, &mut scratch);
        assert_eq!(stream.available(), 8 * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_anchored_to_absolute_time() {
        let source = ScriptedSource::new(&[], &[]);
        let sink = Arc::new(TimingSink::default());
        let handle = SensorPoller::new(source, config(4)).spawn(sink.clone());

        tokio::time::sleep(Duration::from_millis(1050)).await;
        let stats = handle.join().await.unwrap();

        let writes = sink.writes.lock().unwrap();
        assert!(writes.len() >= 10);
        assert_eq!(stats.ticks as usize, writes.len());

        let first = writes[0].1;
        for (i, (timestamp_ms, at)) in writes.iter().enumerate() {
            assert_eq!(*timestamp_ms, i as u32 * 100);
            assert_eq!(at.duration_since(first), Duration::from_millis(i as u64 * 100));
        }
    }

    #[test]
    fn test_overreported_count_is_clamped() {
        let mut source = ScriptedSource::new(&[8, 2], &[]);
        source.overreport = 3;
        let mut poller = SensorPoller::new(source, config(8));
        let stream = RingStream::new(1024, 0).unwrap();
        let mut scratch = poller.scratch();

        poller.poll_once(&stream, 0, &mut scratch);
        poller.poll_once(&stream, 100, &mut scratch);

        let stats = poller.counters().snapshot();
        assert_eq!(stats.read_errors, 1);
        // 8 clamped to max_batch, then 2 + 3 within the limit
        assert_eq!(stats.samples, 13);
        assert_eq!(stream.available(), 13 * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_disables_source() {
        let source = ScriptedSource::new(&[], &[]);
        let enabled = source.enabled.clone();
        let stream = Arc::new(RingStream::new(4096, 0).unwrap());
        let handle = SensorPoller::new(source, config(4)).spawn(stream.clone());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(handle.stats().ticks >= 3);
        assert!(enabled.load(Ordering::SeqCst));

        let stats = handle.join().await.unwrap();
        assert!(!enabled.load(Ordering::SeqCst));
        assert_eq!(stats.dropped_writes, 0);
        assert_eq!(stream.available() as u64, stats.bytes);
    }
}
