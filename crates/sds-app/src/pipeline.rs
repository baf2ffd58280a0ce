//! Pipeline wiring for the `infer`, `record` and `play` modes

use crate::config::PipelineConfig;
use crate::AppError;
use feature_engine::SlidingWindow;
use inference_engine::{
    ConsumerStats, ConsumerStop, InferenceEngine, InferenceError, InferenceResult, WindowConsumer,
};
use recorder::{Player, RecordSink, Recorder, SessionState, SessionStats, StreamStore};
use sds_stream::{EventFlags, RingStream, StreamEvent, StreamHandle, StreamRegistry};
use sensor_poll::{PollStats, SampleSource, SensorPoller};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Flag raised by the record session on storage errors
const SESSION_IO_ERROR: u32 = StreamEvent::IO_ERROR.bits();

/// Outcome of the inference consumer
#[derive(Debug, Clone, Default, Serialize)]
pub struct InferenceReport {
    pub consumer: ConsumerStats,
    /// Windows per top label
    pub labels: BTreeMap<String, u64>,
    /// Writes refused by the sensor stream
    pub rejected_writes: u64,
}

/// Summary printed at the end of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub poll: Option<PollStats>,
    pub inference: Option<InferenceReport>,
    pub session: Option<SessionStats>,
    /// Chunks delivered by replay
    pub replayed_chunks: Option<u64>,
}

/// Sensor stream with a running window consumer
struct InferencePipeline {
    registry: StreamRegistry,
    handle: StreamHandle,
    stream: Arc<RingStream>,
    stop: ConsumerStop,
    consumer: JoinHandle<Result<ConsumerStats, InferenceError>>,
    collector: JoinHandle<BTreeMap<String, u64>>,
}

impl InferencePipeline {
    fn start<E: InferenceEngine + 'static>(config: &PipelineConfig, engine: E) -> Result<Self, AppError> {
        let registry = StreamRegistry::new(1, config.stream.capacity);
        let handle = registry.open(config.stream.capacity, config.stream.threshold)?;
        let stream = registry.get(handle)?;
        info!("Sensor stream {} open: {:?}", handle, stream);

        let window = SlidingWindow::new(&config.window).map_err(InferenceError::from)?;
        let (consumer, results) =
            WindowConsumer::channel(stream.clone(), window, engine, config.consumer.clone())?;
        let stop = consumer.stopper();

        Ok(Self {
            registry,
            handle,
            stream,
            stop,
            consumer: tokio::spawn(consumer.run()),
            collector: tokio::spawn(collect_results(results)),
        })
    }

    /// Stop the consumer after it has drained the stream
    async fn finish(self) -> Result<InferenceReport, AppError> {
        self.stop.stop();
        let consumer = self
            .consumer
            .await
            .map_err(|e| AppError::Task(e.to_string()))??;
        let labels = self
            .collector
            .await
            .map_err(|e| AppError::Task(e.to_string()))?;

        let stats = self.stream.stats();
        debug!("Sensor stream at close: {:?}", stats);
        self.registry.close(self.handle)?;

        Ok(InferenceReport {
            consumer,
            labels,
            rejected_writes: stats.rejected_writes,
        })
    }
}

async fn collect_results(mut results: mpsc::Receiver<InferenceResult>) -> BTreeMap<String, u64> {
    let mut labels = BTreeMap::new();
    while let Some(result) = results.recv().await {
        if let Some(top) = result.classification.top() {
            *labels.entry(top.label.clone()).or_insert(0) += 1;
        }
        debug!("Window {} classified in {}µs", result.window, result.latency_us);
    }
    labels
}

/// Poll `source` into the sensor stream and classify windows until `shutdown`
pub async fn run_infer<S, E, F>(
    config: &PipelineConfig,
    source: S,
    engine: E,
    shutdown: F,
) -> Result<RunReport, AppError>
where
    S: SampleSource + 'static,
    E: InferenceEngine + 'static,
    F: Future<Output = ()>,
{
    let pipeline = InferencePipeline::start(config, engine)?;
    let poller = SensorPoller::new(source, config.poll.clone()).spawn(pipeline.stream.clone());

    shutdown.await;
    info!("Shutting down inference pipeline");

    let poll = poller.join().await?;
    let inference = pipeline.finish().await?;

    Ok(RunReport {
        poll: Some(poll),
        inference: Some(inference),
        ..Default::default()
    })
}

/// Record `source` into `store` until `shutdown` or a storage error
pub async fn run_record<S, F>(
    config: &PipelineConfig,
    source: S,
    store: Arc<dyn StreamStore>,
    shutdown: F,
) -> Result<RunReport, AppError>
where
    S: SampleSource + 'static,
    F: Future<Output = ()>,
{
    let io_events = Arc::new(EventFlags::new());
    let recorder = Arc::new(Recorder::new(store, 1).with_events(io_events.clone(), SESSION_IO_ERROR));

    let name = source.name().to_string();
    let id = recorder.open(&name, config.record.buffer_size, config.record.io_threshold)?;
    let poller = SensorPoller::new(source, config.poll.clone()).spawn(RecordSink::new(recorder.clone(), id));

    tokio::select! {
        _ = shutdown => info!("Stopping recording of '{}'", name),
        _ = io_events.wait_any(SESSION_IO_ERROR, None) => warn!("Recording of '{}' failed", name),
    }

    let poll = poller.join().await?;
    if recorder.state(id) == SessionState::Active {
        recorder.stop(id)?;
    }
    let session = recorder.close(id).await?;

    Ok(RunReport {
        poll: Some(poll),
        session: Some(session),
        ..Default::default()
    })
}

/// Replay the next recording of `name` through the inference pipeline,
/// paced by the recorded timestamps
pub async fn run_play<E, F>(
    config: &PipelineConfig,
    store: Arc<dyn StreamStore>,
    name: &str,
    engine: E,
    shutdown: F,
) -> Result<RunReport, AppError>
where
    E: InferenceEngine + 'static,
    F: Future<Output = ()>,
{
    let player = Player::new(store, 1);
    let id = player.open(name, config.record.buffer_size, config.record.io_threshold)?;
    let pipeline = InferencePipeline::start(config, engine)?;

    let start = Instant::now();
    let mut chunks = 0u64;
    let replay = async {
        while let Some(chunk) = player.next_paced(id, start).await? {
            chunks += 1;
            if pipeline.stream.write(&chunk.data) == 0 && !chunk.data.is_empty() {
                warn!("Sensor stream full, replayed chunk at {}ms dropped", chunk.timestamp);
            }
        }
        Ok::<_, AppError>(())
    };

    tokio::select! {
        result = replay => {
            result?;
            info!("Replay of '{}' complete", name);
        }
        _ = shutdown => info!("Stopping replay of '{}'", name),
    }

    if player.state(id) == SessionState::Active {
        player.stop(id)?;
    }
    let session = player.close(id).await?;
    let inference = pipeline.finish().await?;

    Ok(RunReport {
        inference: Some(inference),
        session: Some(session),
        replayed_chunks: Some(chunks),
        ..Default::default()
    })
}
