//! Stream Registry
//!
//! Fixed table of stream slots addressed by small integer handles, with a
//! bounded budget of backing bytes shared by all open streams.

use crate::buffer::RingStream;
use crate::events::{EventFlags, StreamEvent};
use crate::StreamError;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Default number of stream slots
pub const DEFAULT_MAX_STREAMS: usize = 8;

/// Default backing storage budget (64 KiB)
pub const DEFAULT_BACKING_BYTES: usize = 64 * 1024;

/// Handle of an open stream.
///
/// Carries the generation of its slot, so a handle kept past `close` stays
/// invalid after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    index: usize,
    generation: u32,
}

impl StreamHandle {
    /// Slot index behind the handle
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sds#{}", self.index)
    }
}

#[derive(Default)]
struct Slot {
    stream: Option<Arc<RingStream>>,
    /// Bumped on every close
    generation: u32,
}

struct Slots {
    streams: Vec<Slot>,
    /// Backing bytes held by open streams
    reserved: usize,
}

/// Table of open streams
pub struct StreamRegistry {
    slots: Mutex<Slots>,
    backing_bytes: usize,
}

impl StreamRegistry {
    /// Create a registry with `max_streams` slots and `backing_bytes` of storage budget
    pub fn new(max_streams: usize, backing_bytes: usize) -> Self {
        info!(
            "Creating stream registry: {} slots, {} backing bytes",
            max_streams, backing_bytes
        );
        Self {
            slots: Mutex::new(Slots {
                streams: (0..max_streams).map(|_| Slot::default()).collect(),
                reserved: 0,
            }),
            backing_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a stream of `capacity` bytes with a watermark at `threshold` bytes
    pub fn open(&self, capacity: usize, threshold: usize) -> Result<StreamHandle, StreamError> {
        let mut slots = self.lock();

        let remaining = self.backing_bytes - slots.reserved;
        if capacity > remaining {
            return Err(StreamError::Capacity(format!(
                "capacity {} exceeds remaining backing storage {}",
                capacity, remaining
            )));
        }

        let index = slots
            .streams
            .iter()
            .position(|slot| slot.stream.is_none())
            .ok_or_else(|| StreamError::Capacity("no free stream slots".to_string()))?;

        let stream = RingStream::new(capacity, threshold)?;
        let slot = &mut slots.streams[index];
        slot.stream = Some(Arc::new(stream));
        let handle = StreamHandle {
            index,
            generation: slot.generation,
        };
        slots.reserved += capacity;

        debug!("Opened {} (capacity={}, threshold={})", handle, capacity, threshold);
        Ok(handle)
    }

    /// Shared reference to an open stream, for handing to producer/consumer tasks
    pub fn get(&self, handle: StreamHandle) -> Result<Arc<RingStream>, StreamError> {
        self.lock()
            .streams
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.stream.clone())
            .ok_or(StreamError::InvalidHandle(handle.index))
    }

    /// Write `data` in full to the stream; 0 when it does not fit
    pub fn write(&self, handle: StreamHandle, data: &[u8]) -> Result<usize, StreamError> {
        Ok(self.get(handle)?.write(data))
    }

    /// Read up to `max` bytes from the stream
    pub fn read(&self, handle: StreamHandle, max: usize) -> Result<Vec<u8>, StreamError> {
        Ok(self.get(handle)?.read(max))
    }

    /// Subscribe `flags` to the stream's events
    pub fn register_events(
        &self,
        handle: StreamHandle,
        flags: Arc<EventFlags>,
        bits: u32,
        mask: StreamEvent,
    ) -> Result<(), StreamError> {
        self.get(handle)?.register_events(flags, bits, mask)
    }

    /// Close the stream, unsubscribe its consumer and release its storage budget
    pub fn close(&self, handle: StreamHandle) -> Result<(), StreamError> {
        let mut slots = self.lock();
        let slot = slots
            .streams
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation && slot.stream.is_some())
            .ok_or(StreamError::InvalidHandle(handle.index))?;
        let stream = slot.stream.take().ok_or(StreamError::InvalidHandle(handle.index))?;
        slot.generation = slot.generation.wrapping_add(1);

        stream.unregister_events();
        slots.reserved -= stream.capacity();
        debug!("Closed {}", handle);
        Ok(())
    }

    /// Number of open streams
    pub fn open_count(&self) -> usize {
        self.lock().streams.iter().filter(|s| s.stream.is_some()).count()
    }

    /// Backing bytes still available for new streams
    pub fn remaining_bytes(&self) -> usize {
        self.backing_bytes - self.lock().reserved
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STREAMS, DEFAULT_BACKING_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_write_read_close() {
        let registry = StreamRegistry::default();
        let handle = registry.open(1024, 512).unwrap();

        assert_eq!(registry.write(handle, &[1, 2, 3]).unwrap(), 3);
        assert_eq!(registry.read(handle, 10).unwrap(), vec![1, 2, 3]);

        registry.close(handle).unwrap();
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_close_twice_is_invalid_handle() {
        let registry = StreamRegistry::default();
        let handle = registry.open(64, 0).unwrap();
        registry.close(handle).unwrap();

        assert_eq!(registry.close(handle), Err(StreamError::InvalidHandle(handle.index())));
        assert_eq!(registry.write(handle, &[0]), Err(StreamError::InvalidHandle(handle.index())));
    }

    #[test]
    fn test_capacity_budget() {
        let registry = StreamRegistry::new(4, 1000);

        assert!(matches!(registry.open(0, 0), Err(StreamError::Capacity(_))));
        assert!(matches!(registry.open(1001, 0), Err(StreamError::Capacity(_))));

        let a = registry.open(600, 0).unwrap();
        assert!(matches!(registry.open(600, 0), Err(StreamError::Capacity(_))));

        registry.close(a).unwrap();
        assert_eq!(registry.remaining_bytes(), 1000);
        assert!(registry.open(600, 0).is_ok());
    }

    #[test]
    fn test_slots_are_reused() {
        let registry = StreamRegistry::new(2, 1000);
        let a = registry.open(10, 0).unwrap();
        let _b = registry.open(10, 0).unwrap();
        assert!(matches!(registry.open(10, 0), Err(StreamError::Capacity(_))));

        registry.close(a).unwrap();
        let c = registry.open(10, 0).unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let registry = StreamRegistry::new(1, 1000);
        let stale = registry.open(64, 0).unwrap();
        registry.close(stale).unwrap();
        let fresh = registry.open(64, 0).unwrap();

        assert_eq!(registry.write(stale, &[1, 2, 3]), Err(StreamError::InvalidHandle(0)));
        assert_eq!(registry.read(stale, 8), Err(StreamError::InvalidHandle(0)));
        assert_eq!(registry.close(stale), Err(StreamError::InvalidHandle(0)));

        // the new stream is untouched and still open
        assert_eq!(registry.get(fresh).unwrap().available(), 0);
        assert_eq!(registry.open_count(), 1);
    }

    #[test]
    fn test_close_unsubscribes() {
        let registry = StreamRegistry::default();
        let handle = registry.open(64, 8).unwrap();
        let flags = Arc::new(EventFlags::new());
        registry
            .register_events(handle, flags.clone(), 0b1, StreamEvent::DATA_HIGH)
            .unwrap();

        let stream = registry.get(handle).unwrap();
        registry.close(handle).unwrap();

        // a task still holding the stream no longer reaches the subscriber
        stream.write(&[0; 16]);
        assert_eq!(flags.get(), 0);
    }
}
