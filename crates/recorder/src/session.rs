//! Session state shared by recorders and players

use crate::RecordError;
use sds_stream::{EventFlags, RingStream};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::error;

/// Lifecycle of a record or play session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Closed,
    Idle,
    Active,
    Error,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Idle,
            2 => Self::Active,
            3 => Self::Error,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Idle => 1,
            Self::Active => 2,
            Self::Error => 3,
        }
    }
}

/// Snapshot of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub name: String,
    pub state: SessionState,
    /// Bytes waiting in the session buffer
    pub buffered: usize,
    /// Bytes moved to or from storage
    pub storage_bytes: u64,
    pub chunks: u64,
    pub io_errors: u64,
    pub last_error: Option<String>,
}

pub(crate) struct Session {
    pub name: String,
    pub buffer: Arc<RingStream>,
    pub io_threshold: usize,
    state: AtomicU8,
    /// Wakes the background I/O task
    pub io_flags: Arc<EventFlags>,
    /// Wakes the application side (player data)
    pub app_flags: Arc<EventFlags>,
    /// Storage has no more data (player only)
    pub eof: AtomicBool,
    /// Reader is waiting on a chunk the feeder has not completed (player only)
    pub starved: AtomicBool,
    pub storage_bytes: AtomicU64,
    pub chunks: AtomicU64,
    io_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    /// Application flags raised on I/O errors
    notify: Option<(Arc<EventFlags>, u32)>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// New session, initially `Active`
    pub fn new(
        name: &str,
        buffer: RingStream,
        io_threshold: usize,
        notify: Option<(Arc<EventFlags>, u32)>,
    ) -> Self {
        Self {
            name: name.to_string(),
            buffer: Arc::new(buffer),
            io_threshold,
            state: AtomicU8::new(SessionState::Active.as_u8()),
            io_flags: Arc::new(EventFlags::new()),
            app_flags: Arc::new(EventFlags::new()),
            eof: AtomicBool::new(false),
            starved: AtomicBool::new(false),
            storage_bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            io_errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
            notify,
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Move `from` → `to`, or report the state actually found
    pub fn transition(&self, from: SessionState, to: SessionState) -> Result<(), RecordError> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|found| RecordError::InvalidState {
                name: self.name.clone(),
                state: SessionState::from_u8(found),
            })
    }

    /// Record an I/O failure and raise it to the application
    pub fn fail(&self, err: impl std::fmt::Display) {
        let message = err.to_string();
        error!("Session '{}' I/O error: {}", self.name, message);

        self.io_errors.fetch_add(1, Ordering::Relaxed);
        *self.lock_error() = Some(message);
        self.set_state(SessionState::Error);

        if let Some((flags, bits)) = &self.notify {
            flags.set(*bits);
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_error().clone()
    }

    fn lock_error(&self) -> MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand over the background I/O task
    pub fn attach(&self, task: JoinHandle<()>) {
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Wait for the background task to finish
    pub async fn join(&self) -> Result<(), RecordError> {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| RecordError::Io(format!("I/O task for '{}' failed: {}", self.name, e))),
            None => Ok(()),
        }
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            name: self.name.clone(),
            state: self.state(),
            buffered: self.buffer.available(),
            storage_bytes: self.storage_bytes.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }
}

/// Run `op` on the blocking pool and hand `target` back with its result
pub(crate) async fn off_runtime<T, R, F>(mut target: T, op: F) -> Result<(T, R), RecordError>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut T) -> R + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = op(&mut target);
        (target, out)
    })
    .await
    .map_err(|e| RecordError::Io(format!("blocking storage call failed: {}", e)))
}

/// Slot index plus the slot generation it was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotKey {
    pub index: usize,
    generation: u32,
}

#[derive(Default)]
struct SessionSlot {
    session: Option<Arc<Session>>,
    /// Bumped on every removal
    generation: u32,
}

/// Fixed set of session slots; keys of removed sessions never match again
pub(crate) struct SessionTable {
    slots: Mutex<Vec<SessionSlot>>,
}

impl SessionTable {
    /// Create `max_sessions` empty slots
    pub fn new(max_sessions: usize) -> Self {
        Self {
            slots: Mutex::new((0..max_sessions).map(|_| SessionSlot::default()).collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SessionSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place `session` in the first free slot
    pub fn insert(&self, session: Arc<Session>) -> Result<SlotKey, RecordError> {
        let mut slots = self.lock();
        let total = slots.len();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.session.is_none())
            .ok_or_else(|| RecordError::Capacity(format!("all {} session slots in use", total)))?;
        slot.session = Some(session);
        Ok(SlotKey {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, key: SlotKey) -> Result<Arc<Session>, RecordError> {
        self.lock()
            .get(key.index)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.session.clone())
            .ok_or(RecordError::InvalidHandle(key.index))
    }

    pub fn remove(&self, key: SlotKey) -> Result<Arc<Session>, RecordError> {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(key.index)
            .filter(|slot| slot.generation == key.generation)
            .ok_or(RecordError::InvalidHandle(key.index))?;
        let session = slot.session.take().ok_or(RecordError::InvalidHandle(key.index))?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(session)
    }

    /// Sessions currently open
    pub fn open_count(&self) -> usize {
        self.lock().iter().filter(|slot| slot.session.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Arc<Session> {
        Arc::new(Session::new("test", RingStream::new(64, 16).unwrap(), 16, None))
    }

    #[test]
    fn test_transition_reports_found_state() {
        let s = session();
        assert_eq!(s.state(), SessionState::Active);

        s.transition(SessionState::Active, SessionState::Idle).unwrap();
        let err = s.transition(SessionState::Active, SessionState::Idle).unwrap_err();
        assert!(matches!(
            err,
            RecordError::InvalidState { state: SessionState::Idle, .. }
        ));
    }

    #[test]
    fn test_fail_raises_notification() {
        let flags = Arc::new(EventFlags::new());
        let s = Session::new("x", RingStream::new(8, 0).unwrap(), 4, Some((flags.clone(), 0x10)));

        s.fail("disk full");
        assert_eq!(s.state(), SessionState::Error);
        assert_eq!(flags.get(), 0x10);

        let stats = s.stats();
        assert_eq!(stats.io_errors, 1);
        assert_eq!(stats.last_error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_table_slots() {
        let table = SessionTable::new(2);
        let a = table.insert(session()).unwrap();
        let b = table.insert(session()).unwrap();
        assert!(matches!(table.insert(session()), Err(RecordError::Capacity(_))));

        table.remove(a).unwrap();
        assert!(matches!(table.get(a), Err(RecordError::InvalidHandle(_))));
        assert!(table.get(b).is_ok());
        assert_eq!(table.open_count(), 1);

        let c = table.insert(session()).unwrap();
        assert_eq!(c.index, a.index);
        assert_ne!(c, a);
    }

    #[test]
    fn test_stale_key_after_slot_reuse() {
        let table = SessionTable::new(1);
        let stale = table.insert(session()).unwrap();
        table.remove(stale).unwrap();
        let fresh = table.insert(session()).unwrap();

        assert!(matches!(table.get(stale), Err(RecordError::InvalidHandle(0))));
        assert!(matches!(table.remove(stale), Err(RecordError::InvalidHandle(0))));
        assert!(table.get(fresh).is_ok());
    }

    #[tokio::test]
    async fn test_off_runtime_returns_target() {
        let (buf, len) = off_runtime(vec![1u8, 2, 3], |v| {
            v.push(4);
            v.len()
        })
        .await
        .unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4]);
        assert_eq!(len, 4);

        let err = off_runtime((), |_| -> () { panic!("storage gone") }).await.unwrap_err();
        assert!(matches!(err, RecordError::Io(_)));
    }
}
