//! Stream Player
//!
//! A background feeder copies a recording from storage into the session
//! buffer in I/O-threshold pieces whenever that much space is free. The
//! application takes whole chunks out of the buffer, optionally paced by
//! their recorded timestamps.

use crate::chunk::{Chunk, ChunkHeader, CHUNK_HEADER_SIZE};
use crate::session::{off_runtime, Session, SessionState, SessionStats, SessionTable, SlotKey};
use crate::store::{StoreReader, StreamStore};
use crate::RecordError;
use sds_stream::{EventFlags, RingStream};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const FEED_SPACE: u32 = 1 << 0;
const FEED_CLOSE: u32 = 1 << 1;
const PLAY_DATA: u32 = 1 << 0;

/// Play session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlayId(SlotKey);

impl PlayId {
    /// Session slot behind the handle
    pub fn index(&self) -> usize {
        self.0.index
    }
}

impl fmt::Display for PlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "play#{}", self.0.index)
    }
}

pub struct Player {
    store: Arc<dyn StreamStore>,
    sessions: SessionTable,
    notify: Option<(Arc<EventFlags>, u32)>,
}

impl Player {
    /// Create a player with `max_sessions` session slots
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

    /// Open the next recording of `name` for replay
    pub fn open(&self, name: &str, buffer_size: usize, io_threshold: usize) -> Result<PlayId, RecordError> {
        let runtime = Handle::try_current().map_err(|_| RecordError::NoRuntime)?;
        if buffer_size <= CHUNK_HEADER_SIZE {
            return Err(RecordError::Capacity(format!(
                "buffer of {} bytes cannot hold a chunk",
                buffer_size
            )));
        }
        if io_threshold == 0 || io_threshold > buffer_size {
            return Err(RecordError::Capacity(format!(
                "I/O threshold {} must be within 1..={}",
                io_threshold, buffer_size
            )));
        }

        let buffer = RingStream::new(buffer_size, 0)?;
        let reader = self.store.open(name)?;

        let session = Arc::new(Session::new(name, buffer, io_threshold, self.notify.clone()));
        let id = PlayId(self.sessions.insert(session.clone())?);
        session.attach(runtime.spawn(feed_task(session.clone(), reader)));

        info!(
            "Replaying '{}' as {} (buffer {} bytes, I/O threshold {})",
            name, id, buffer_size, io_threshold
        );
        Ok(id)
    }

    /// Encoded length of the next chunk if it is completely buffered
    fn next_chunk_len(session: &Session) -> Result<Option<usize>, RecordError> {
        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        let available = session.buffer.peek(&mut raw);
        if available < CHUNK_HEADER_SIZE {
            if !session.eof.load(Ordering::Acquire) {
                session.starved.store(true, Ordering::Release);
                session.io_flags.set(FEED_SPACE);
            }
            return Ok(None);
        }

        let header = ChunkHeader::decode(&raw);
        let encoded = CHUNK_HEADER_SIZE + header.size as usize;
        let capacity = session.buffer.capacity();
        if encoded > capacity {
            return Err(RecordError::ChunkTooLarge {
                size: header.size as usize,
                capacity,
            });
        }

        if session.buffer.available() < encoded {
            if !session.eof.load(Ordering::Acquire) {
                session.starved.store(true, Ordering::Release);
                session.io_flags.set(FEED_SPACE);
            }
            return Ok(None);
        }
        Ok(Some(encoded))
    }

    /// Payload size of the next complete chunk, 0 if none is buffered yet
    pub fn get_size(&self, id: PlayId) -> Result<usize, RecordError> {
        let session = self.sessions.get(id.0)?;
        Ok(Self::next_chunk_len(&session)?.map_or(0, |n| n - CHUNK_HEADER_SIZE))
    }

    /// Take the next complete chunk, if buffered
    pub fn read(&self, id: PlayId) -> Result<Option<Chunk>, RecordError> {
        let session = self.sessions.get(id.0)?;
        let Some(encoded) = Self::next_chunk_len(&session)? else {
            return Ok(None);
        };

        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        session.buffer.read_into(&mut raw);
        let header = ChunkHeader::decode(&raw);

        let mut data = vec![0u8; encoded - CHUNK_HEADER_SIZE];
        session.buffer.read_into(&mut data);
        session.chunks.fetch_add(1, Ordering::Relaxed);
        session.io_flags.set(FEED_SPACE);

        trace!("{} chunk at {}ms, {} bytes", id, header.timestamp, data.len());
        Ok(Some(Chunk {
            timestamp: header.timestamp,
            data,
        }))
    }

    /// True once storage is exhausted and no complete chunk remains.
    ///
    /// An active session reaching the end moves to `Idle`.
    pub fn end_of_stream(&self, id: PlayId) -> Result<bool, RecordError> {
        let session = self.sessions.get(id.0)?;
        if !session.eof.load(Ordering::Acquire) || Self::next_chunk_len(&session)?.is_some() {
            return Ok(false);
        }

        let leftover = session.buffer.available();
        if leftover > 0 {
            warn!("'{}' ends with {} bytes of a truncated chunk", session.name, leftover);
            session.buffer.clear();
        }
        if session.transition(SessionState::Active, SessionState::Idle).is_ok() {
            info!("'{}' reached end of stream", session.name);
        }
        Ok(true)
    }

    /// Wait for the next chunk and deliver it no earlier than
    /// `start + timestamp`. Returns `None` at the end of the stream.
    pub async fn next_paced(&self, id: PlayId, start: Instant) -> Result<Option<Chunk>, RecordError> {
        let session = self.sessions.get(id.0)?;

        loop {
            if let Some(chunk) = self.read(id)? {
                let due = start + Duration::from_millis(chunk.timestamp as u64);
                tokio::time::sleep_until(due).await;
                return Ok(Some(chunk));
            }
            if self.end_of_stream(id)? {
                return Ok(None);
            }

            match session.state() {
                SessionState::Error => {
                    return Err(RecordError::Io(session.last_error().unwrap_or_default()))
                }
                SessionState::Idle | SessionState::Closed => return Ok(None),
                SessionState::Active => {}
            }

            session.app_flags.wait_any(PLAY_DATA, None).await?;
        }
    }

    /// Stop feeding from storage; buffered chunks stay readable
    pub fn stop(&self, id: PlayId) -> Result<(), RecordError> {
        let session = self.sessions.get(id.0)?;
        session.transition(SessionState::Active, SessionState::Idle)?;
        session.app_flags.set(PLAY_DATA);
        info!("Replay of '{}' stopped", session.name);
        Ok(())
    }

    /// Release the session
    pub async fn close(&self, id: PlayId) -> Result<SessionStats, RecordError> {
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

        session.io_flags.set(FEED_CLOSE);
        session.join().await?;

        let stats = session.stats();
        session.set_state(SessionState::Closed);
        info!(
            "Replay of '{}' closed: {} chunks, {} bytes read",
            session.name, stats.chunks, stats.storage_bytes
        );
        Ok(stats)
    }

    /// Session state; `Closed` for handles no longer open
    pub fn state(&self, id: PlayId) -> SessionState {
        self.sessions
            .get(id.0)
            .map(|s| s.state())
            .unwrap_or(SessionState::Closed)
    }

    /// Counters of an open session
    pub fn stats(&self, id: PlayId) -> Result<SessionStats, RecordError> {
        Ok(self.sessions.get(id.0)?.stats())
    }
}

/// Copy storage into the session buffer until closed
async fn feed_task(session: Arc<Session>, reader: Box<dyn StoreReader>) {
    let mut io = Some((reader, vec![0u8; session.io_threshold]));

    loop {
        while session.state() == SessionState::Active && !session.eof.load(Ordering::Acquire) {
            let free = session.buffer.free();
            let piece = if free >= session.io_threshold {
                session.io_threshold
            } else if free > 0 && session.starved.swap(false, Ordering::AcqRel) {
                free
            } else {
                break;
            };

            let Some(side) = io.take() else {
                break;
            };
            match off_runtime(side, move |(reader, scratch)| reader.read(&mut scratch[..piece])).await {
                Ok((side, result)) => {
                    match result {
                        Ok(0) => {
                            debug!("'{}' storage exhausted", session.name);
                            session.eof.store(true, Ordering::Release);
                        }
                        Ok(n) => {
                            session.buffer.write(&side.1[..n]);
                            session.storage_bytes.fetch_add(n as u64, Ordering::Relaxed);
                        }
                        Err(e) => session.fail(e),
                    }
                    io = Some(side);
                }
                Err(e) => session.fail(e),
            }
            session.app_flags.set(PLAY_DATA);
        }

        let bits = match session.io_flags.wait_any(FEED_SPACE | FEED_CLOSE, None).await {
            Ok(bits) => bits,
            Err(e) => {
                session.fail(e);
                FEED_CLOSE
            }
        };
        if bits & FEED_CLOSE != 0 {
            break;
        }
    }

    debug!("Feed task for '{}' finished", session.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, MemoryStore, StoreError, StoreWriter};
    use crate::Recorder;
    use std::io;
    use std::sync::{mpsc, Mutex};

    fn recording(chunks: &[(u32, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (ts, data) in chunks {
            let header = ChunkHeader {
                timestamp: *ts,
                size: data.len() as u32,
            };
            out.extend_from_slice(&header.encode());
            out.extend_from_slice(data);
        }
        out
    }

    fn player_with(name: &str, bytes: Vec<u8>) -> Player {
        let store = MemoryStore::new();
        store.insert(name, bytes);
        Player::new(Arc::new(store), 2)
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_replay_honors_timestamps() {
        let player = player_with("imu", recording(&[(0, &[1; 12]), (100, &[2; 12]), (250, &[3; 12])]));
        let id = player.open("imu", 64, 16).unwrap();

        let start = Instant::now();
        let mut delivered = Vec::new();
        while let Some(chunk) = player.next_paced(id, start).await.unwrap() {
            delivered.push((chunk.timestamp, start.elapsed()));
        }

        assert_eq!(delivered.len(), 3);
        assert!(delivered[1].1 - delivered[0].1 >= Duration::from_millis(100));
        assert!(delivered[2].1 - delivered[0].1 >= Duration::from_millis(250));
        assert!(delivered[2].1 >= Duration::from_millis(250));

        assert_eq!(player.state(id), SessionState::Idle);
        let stats = player.close(id).await.unwrap();
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.storage_bytes, 60);
    }

    #[tokio::test]
    async fn test_get_size_and_read() {
        let player = player_with("mic", recording(&[(7, &[9; 5]), (8, &[])]));
        let id = player.open("mic", 32, 8).unwrap();

        let mut size = 0;
        for _ in 0..100 {
            size = player.get_size(id).unwrap();
            if size != 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(size, 5);

        let chunk = player.read(id).unwrap().unwrap();
        assert_eq!(chunk, Chunk { timestamp: 7, data: vec![9; 5] });

        let start = Instant::now();
        let empty = player.next_paced(id, start).await.unwrap().unwrap();
        assert!(empty.data.is_empty());
        assert!(player.next_paced(id, start).await.unwrap().is_none());
        assert!(player.end_of_stream(id).unwrap());
    }

    #[tokio::test]
    async fn test_chunk_larger_than_buffer() {
        let player = player_with("big", recording(&[(0, &[0; 40])]));
        let id = player.open("big", 32, 16).unwrap();

        let err = player.next_paced(id, Instant::now()).await.unwrap_err();
        assert!(matches!(err, RecordError::ChunkTooLarge { size: 40, capacity: 32 }));
    }

    #[tokio::test]
    async fn test_small_threshold_fraction_does_not_stall() {
        // a 30-byte chunk in a 32-byte buffer fed in 24-byte pieces
        let player = player_with("odd", recording(&[(0, &[1; 22]), (5, &[2; 22])]));
        let id = player.open("odd", 32, 24).unwrap();

        let start = Instant::now();
        assert_eq!(player.next_paced(id, start).await.unwrap().unwrap().timestamp, 0);
        assert_eq!(player.next_paced(id, start).await.unwrap().unwrap().timestamp, 5);
        assert!(player.next_paced(id, start).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_requires_idle() {
        let player = player_with("x", recording(&[(0, &[1])]));
        let id = player.open("x", 32, 8).unwrap();

        assert!(matches!(
            player.close(id).await,
            Err(RecordError::InvalidState { state: SessionState::Active, .. })
        ));
        player.stop(id).unwrap();
        player.close(id).await.unwrap();
        assert!(matches!(player.read(id), Err(RecordError::InvalidHandle(0))));
        assert!(matches!(
            player.open("x", 32, 8),
            Err(RecordError::Store(StoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_record_then_replay_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StreamStore> = Arc::new(FileStore::new(dir.path()).unwrap());

        let rec = Recorder::new(store.clone(), 1);
        let id = rec.open("Accelerometer", 256, 64).unwrap();
        for ts in [0u32, 100, 200] {
            rec.write(id, ts, &ts.to_le_bytes()).unwrap();
        }
        rec.stop(id).unwrap();
        rec.close(id).await.unwrap();

        let player = Player::new(store, 1);
        let id = player.open("Accelerometer", 64, 16).unwrap();
        let mut stamps = Vec::new();
        loop {
            if let Some(chunk) = player.read(id).unwrap() {
                assert_eq!(chunk.data, chunk.timestamp.to_le_bytes());
                stamps.push(chunk.timestamp);
            } else if player.end_of_stream(id).unwrap() {
                break;
            } else {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(stamps, vec![0, 100, 200]);
    }

    /// Reads only after the test hands out a permit
    struct GatedReader {
        gate: mpsc::Receiver<()>,
        inner: Box<dyn StoreReader>,
    }

    impl StoreReader for GatedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.gate
                .recv()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "gate closed"))?;
            self.inner.read(buf)
        }
    }

    struct GatedStore {
        gate: Mutex<Option<mpsc::Receiver<()>>>,
        inner: MemoryStore,
    }

    impl StreamStore for GatedStore {
        fn create(&self, name: &str) -> Result<Box<dyn StoreWriter>, StoreError> {
            self.inner.create(name)
        }

        fn open(&self, name: &str) -> Result<Box<dyn StoreReader>, StoreError> {
            let gate = self.gate.lock().unwrap().take().unwrap();
            Ok(Box::new(GatedReader {
                gate,
                inner: self.inner.open(name)?,
            }))
        }
    }

    #[tokio::test]
    async fn test_blocked_read_leaves_runtime_free() {
        let inner = MemoryStore::new();
        inner.insert("slow", recording(&[(0, &[1; 4]), (10, &[2; 4])]));
        let (permits, gate) = mpsc::channel();
        let player = Player::new(
            Arc::new(GatedStore {
                gate: Mutex::new(Some(gate)),
                inner,
            }),
            1,
        );
        let id = player.open("slow", 64, 16).unwrap();

        // the feeder is parked in a read until a permit arrives
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(player.read(id).unwrap().is_none());

        for _ in 0..8 {
            permits.send(()).unwrap();
        }
        let start = Instant::now();
        assert_eq!(player.next_paced(id, start).await.unwrap().unwrap().timestamp, 0);
        assert_eq!(player.next_paced(id, start).await.unwrap().unwrap().timestamp, 10);
        assert!(player.next_paced(id, start).await.unwrap().is_none());
    }

    struct BrokenStore;

    struct BrokenReader;

    impl StoreReader for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "read fault"))
        }
    }

    impl StreamStore for BrokenStore {
        fn create(&self, name: &str) -> Result<Box<dyn StoreWriter>, StoreError> {
            Err(StoreError::InvalidName(name.to_string()))
        }

        fn open(&self, _name: &str) -> Result<Box<dyn StoreReader>, StoreError> {
            Ok(Box::new(BrokenReader))
        }
    }

    #[tokio::test]
    async fn test_read_error_surfaces() {
        let flags = Arc::new(EventFlags::new());
        let player = Player::new(Arc::new(BrokenStore), 1).with_events(flags.clone(), 0x4);
        let id = player.open("x", 32, 8).unwrap();

        let err = player.next_paced(id, Instant::now()).await.unwrap_err();
        assert!(matches!(err, RecordError::Io(ref msg) if msg == "read fault"));
        assert_eq!(flags.get(), 0x4);
        assert_eq!(player.state(id), SessionState::Error);
        assert_eq!(player.close(id).await.unwrap().io_errors, 1);
    }
}
