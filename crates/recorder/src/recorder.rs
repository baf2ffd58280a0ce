//! Stream Recorder
//!
//! The producer frames each write as a chunk into a per-session ring buffer.
//! A background task moves buffered bytes to storage whenever the buffer
//! reaches its I/O threshold, and once more on stop and close.

use crate::chunk::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::session::{off_runtime, Session, SessionState, SessionStats, SessionTable, SlotKey};
use crate::store::{StoreWriter, StreamStore};
use crate::RecordError;
use sds_stream::{EventFlags, RingStream, SampleSink, StreamEvent};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

const IO_DATA: u32 = 1 << 0;
const IO_FLUSH: u32 = 1 << 1;
const IO_CLOSE: u32 = 1 << 2;

/// Record session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecId(SlotKey);

impl RecId {
    /// Session slot behind the handle
    pub fn index(&self) -> usize {
        self.0.index
    }
}

impl fmt::Display for RecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec#{}", self.0.index)
    }
}

pub struct Recorder {
    store: Arc<dyn StreamStore>,
    sessions: SessionTable,
    notify: Option<(Arc<EventFlags>, u32)>,
}

impl Recorder {
    /// Create a recorder with `max_sessions` session slots
    pub fn new(store: Arc<dyn StreamStore>, max_sessions: usize) -> Self {
        Self {
            store,
            sessions: SessionTable::new(max_sessions),
            notify: None,
        }
    }

    /// Raise `bits` on `flags` whenever a session hits an I/O error
    pub fn with_events(mut self, flags: Arc<EventFlags>, bits: u32) -> Self {
        self.notify = Some((flags, bits));
        self
    }

    /// Start recording `name` through a buffer of `buffer_size` bytes.
    ///
    /// Must be called inside a tokio runtime; the session starts `Active`.
    pub fn open(&self, name: &str, buffer_size: usize, io_threshold: usize) -> Result<RecId, RecordError> {
        let runtime = Handle::try_current().map_err(|_| RecordError::NoRuntime)?;
        if io_threshold == 0 {
            return Err(RecordError::Capacity("I/O threshold must be non-zero".to_string()));
        }
        if buffer_size <= CHUNK_HEADER_SIZE {
            return Err(RecordError::Capacity(format!(
                "buffer of {} bytes cannot hold a chunk",
                buffer_size
            )));
        }

        let buffer = RingStream::new(buffer_size, io_threshold)?;
        let writer = self.store.create(name)?;

        let session = Arc::new(Session::new(name, buffer, io_threshold, self.notify.clone()));
        session
            .buffer
            .register_events(session.io_flags.clone(), IO_DATA, StreamEvent::DATA_HIGH)?;

        let id = RecId(self.sessions.insert(session.clone())?);
        session.attach(runtime.spawn(flush_task(session.clone(), writer)));

        info!(
            "Recording '{}' as {} (buffer {} bytes, I/O threshold {})",
            name, id, buffer_size, io_threshold
        );
        Ok(id)
    }

    /// Append one timestamped chunk. Returns bytes accepted (header included),
    /// or 0 when the buffer is full or the session is not recording.
    pub fn write(&self, id: RecId, timestamp: u32, data: &[u8]) -> Result<usize, RecordError> {
        let session = self.sessions.get(id.0)?;
        if session.state() != SessionState::Active {
            trace!("{} not active, write of {} bytes ignored", id, data.len());
            return Ok(0);
        }

        let capacity = session.buffer.capacity();
        if CHUNK_HEADER_SIZE + data.len() > capacity {
            return Err(RecordError::ChunkTooLarge {
                size: data.len(),
                capacity,
            });
        }

        let header = ChunkHeader {
            timestamp,
            size: data.len() as u32,
        }
        .encode();

        let written = session.buffer.write_parts(&[&header, data]);
        if written == 0 {
            // drain even if occupancy never reaches the I/O threshold
            session.io_flags.set(IO_DATA);
            debug!("{} buffer full, chunk at {}ms dropped", id, timestamp);
        } else {
            session.chunks.fetch_add(1, Ordering::Relaxed);
        }
        Ok(written)
    }

    /// Stop accepting writes and flush what is buffered
    pub fn stop(&self, id: RecId) -> Result<(), RecordError> {
        let session = self.sessions.get(id.0)?;
        session.transition(SessionState::Active, SessionState::Idle)?;
        session.io_flags.set(IO_FLUSH);
        info!("Recording '{}' stopped", session.name);
        Ok(())
    }

    /// Flush, finish the recording and release the session
    pub async fn close(&self, id: RecId) -> Result<SessionStats, RecordError> {
        let session = self.sessions.get(id.0)?;
        match session.state() {
            SessionState::Idle | SessionState::Error => {}
            state => {
                return Err(RecordError::InvalidState {
                    name: session.name.clone(),
                    state,
                })
            }
        }
        self.sessions.remove(id.0)?;

        session.io_flags.set(IO_CLOSE);
        session.join().await?;
        session.buffer.unregister_events();

        let stats = session.stats();
        if session.state() == SessionState::Error {
            warn!("Recording '{}' closed after I/O error", session.name);
        }
        session.set_state(SessionState::Closed);
        info!(
            "Recording '{}' closed: {} chunks, {} bytes stored",
            session.name, stats.chunks, stats.storage_bytes
        );
        Ok(stats)
    }

    /// Session state; `Closed` for handles no longer open
    pub fn state(&self, id: RecId) -> SessionState {
        self.sessions
            .get(id.0)
            .map(|s| s.state())
            .unwrap_or(SessionState::Closed)
    }

    /// Counters of an open session
    pub fn stats(&self, id: RecId) -> Result<SessionStats, RecordError> {
        Ok(self.sessions.get(id.0)?.stats())
    }

    /// Record sessions currently open
    pub fn open_count(&self) -> usize {
        self.sessions.open_count()
    }
}

type WriteSide = (Box<dyn StoreWriter>, Vec<u8>);

/// Drain the session buffer to storage until closed
async fn flush_task(session: Arc<Session>, writer: Box<dyn StoreWriter>) {
    let mut io = Some((writer, vec![0u8; session.buffer.capacity()]));

    loop {
        let bits = match session
            .io_flags
            .wait_any(IO_DATA | IO_FLUSH | IO_CLOSE, None)
            .await
        {
            Ok(bits) => bits,
            Err(e) => {
                session.fail(e);
                IO_CLOSE
            }
        };

        drain_to_storage(&session, &mut io).await;

        if bits & IO_CLOSE != 0 {
            if session.state() != SessionState::Error {
                if let Some(side) = io.take() {
                    match off_runtime(side, |(writer, _)| writer.finish()).await {
                        Ok((_, Ok(()))) => {}
                        Ok((_, Err(e))) => session.fail(e),
                        Err(e) => session.fail(e),
                    }
                }
            }
            break;
        }
    }

    debug!("Flush task for '{}' finished", session.name);
}

/// Move everything buffered to storage, appending on the blocking pool
async fn drain_to_storage(session: &Session, io: &mut Option<WriteSide>) {
    while session.state() != SessionState::Error {
        let Some(mut side) = io.take() else {
            return;
        };
        let n = session.buffer.read_into(&mut side.1);
        if n == 0 {
            *io = Some(side);
            return;
        }

        match off_runtime(side, move |(writer, scratch)| writer.append(&scratch[..n])).await {
            Ok((side, result)) => {
                *io = Some(side);
                match result {
                    Ok(()) => {
                        session.storage_bytes.fetch_add(n as u64, Ordering::Relaxed);
                        trace!("'{}': {} bytes to storage", session.name, n);
                    }
                    Err(e) => session.fail(e),
                }
            }
            Err(e) => session.fail(e),
        }
    }
}

/// Feeds sensor batches into a record session
pub struct RecordSink {
    recorder: Arc<Recorder>,
    id: RecId,
}

impl RecordSink {
    /// Sink writing every batch into record session `id`
    pub fn new(recorder: Arc<Recorder>, id: RecId) -> Self {
        Self { recorder, id }
    }
}

impl SampleSink for RecordSink {
    fn write_batch(&self, timestamp_ms: u32, data: &[u8]) -> usize {
        match self.recorder.write(self.id, timestamp_ms, data) {
            // report payload bytes so the poller sees a complete write
            Ok(0) => 0,
            Ok(_) => data.len(),
            Err(e) => {
                warn!("Record write failed: {}", e);
                0
            }
        }
    }
}
