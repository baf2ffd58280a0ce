//! Bounded Ring Stream Implementation

use crate::events::{EventFlags, StreamEvent};
use crate::StreamError;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Cursor state and storage, guarded by the stream's own lock
struct Ring {
    /// Pre-allocated storage
    buf: Box<[u8]>,
    /// Next byte to read
    read_pos: usize,
    /// Next byte to write
    write_pos: usize,
    /// Unread bytes
    len: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            len: 0,
        }
    }

    fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Caller guarantees `data.len() <= self.free()`
    fn push(&mut self, data: &[u8]) {
        let cap = self.buf.len();
        let first = data.len().min(cap - self.write_pos);
        let (head, tail) = data.split_at(first);

        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(head);
        self.buf[..tail.len()].copy_from_slice(tail);

        self.write_pos = (self.write_pos + data.len()) % cap;
        self.len += data.len();
    }

    fn copy_out(&self, out: &mut [u8]) -> usize {
        let cap = self.buf.len();
        let n = out.len().min(self.len);
        let first = n.min(cap - self.read_pos);

        out[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        n
    }

    fn consume(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n) % self.buf.len();
        self.len -= n;
    }
}

/// Registered consumer of stream events
struct Subscriber {
    flags: Arc<EventFlags>,
    bits: u32,
    mask: StreamEvent,
}

/// Snapshot of stream counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub capacity: usize,
    pub occupancy: usize,
    pub bytes_written: u64,
    pub bytes_read: u64,
    /// Writes refused for lack of space
    pub rejected_writes: u64,
    /// Below → at-or-above threshold crossings
    pub watermark_events: u64,
}

/// Bounded SPSC byte stream with a high-watermark event.
///
/// Writes are all-or-nothing: a write that does not fit is refused in full and
/// counted, leaving unread data untouched. The only state shared between the
/// producer and the consumer is behind one mutex created with the stream.
pub struct RingStream {
    capacity: usize,
    /// High-watermark in bytes (0 disables the event)
    threshold: usize,
    ring: Mutex<Ring>,
    subscriber: Mutex<Option<Subscriber>>,
    /// Event kinds raised since the consumer last called `take_events`
    pending: AtomicU32,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    rejected_writes: AtomicU64,
    watermark_events: AtomicU64,
}

impl RingStream {
    /// Create a stream of `capacity` bytes with a watermark at `threshold` bytes
    pub fn new(capacity: usize, threshold: usize) -> Result<Self, StreamError> {
        if capacity == 0 {
            return Err(StreamError::Capacity("capacity must be non-zero".to_string()));
        }
        if threshold > capacity {
            return Err(StreamError::Capacity(format!(
                "threshold {} exceeds capacity {}",
                threshold, capacity
            )));
        }

        Ok(Self {
            capacity,
            threshold,
            ring: Mutex::new(Ring::new(capacity)),
            subscriber: Mutex::new(None),
            pending: AtomicU32::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            rejected_writes: AtomicU64::new(0),
            watermark_events: AtomicU64::new(0),
        })
    }

    fn lock_ring(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `data` in full. Returns `data.len()`, or 0 if it does not fit.
    pub fn write(&self, data: &[u8]) -> usize {
        self.write_parts(&[data])
    }

    /// Enqueue the concatenation of `parts` in full, or nothing at all
    pub fn write_parts(&self, parts: &[&[u8]]) -> usize {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total == 0 {
            return 0;
        }

        let crossed = {
            let mut ring = self.lock_ring();
            if total > ring.free() {
                let free = ring.free();
                drop(ring);
                self.rejected_writes.fetch_add(1, Ordering::Relaxed);
                debug!("Stream write of {} bytes rejected ({} free)", total, free);
                return 0;
            }

            let before = ring.len;
            for part in parts {
                ring.push(part);
            }
            self.threshold != 0 && before < self.threshold && ring.len >= self.threshold
        };

        self.bytes_written.fetch_add(total as u64, Ordering::Relaxed);

        if crossed {
            self.watermark_events.fetch_add(1, Ordering::Relaxed);
            self.raise(StreamEvent::DATA_HIGH);
        }

        total
    }

    /// Dequeue up to `out.len()` bytes. Never blocks.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let n = {
            let mut ring = self.lock_ring();
            let n = ring.copy_out(out);
            ring.consume(n);
            n
        };
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Dequeue up to `max` bytes into a new vector
    pub fn read(&self, max: usize) -> Vec<u8> {
        let mut out = vec![0u8; max.min(self.available())];
        let n = self.read_into(&mut out);
        out.truncate(n);
        out
    }

    /// Copy up to `out.len()` unread bytes without consuming them
    pub fn peek(&self, out: &mut [u8]) -> usize {
        self.lock_ring().copy_out(out)
    }

    /// Unread bytes
    pub fn available(&self) -> usize {
        self.lock_ring().len
    }

    /// Bytes that can be written before a write is refused
    pub fn free(&self) -> usize {
        self.lock_ring().free()
    }

    /// No unread bytes
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Buffer size in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// High-watermark in bytes; 0 disables the event
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Drop all unread data
    pub fn clear(&self) {
        let mut ring = self.lock_ring();
        let len = ring.len;
        ring.consume(len);
    }

    /// Subscribe `flags` to the event kinds in `mask`; matching events set `bits`.
    ///
    /// Only one subscriber is allowed per stream.
    pub fn register_events(
        &self,
        flags: Arc<EventFlags>,
        bits: u32,
        mask: StreamEvent,
    ) -> Result<(), StreamError> {
        let mut subscriber = self.subscriber.lock().unwrap_or_else(PoisonError::into_inner);
        if subscriber.is_some() {
            return Err(StreamError::AlreadySubscribed);
        }
        *subscriber = Some(Subscriber { flags, bits, mask });
        Ok(())
    }

    /// Remove the event subscriber, if any
    pub fn unregister_events(&self) {
        self.subscriber.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Event kinds raised since the last call
    pub fn take_events(&self) -> StreamEvent {
        StreamEvent::from_bits_truncate(self.pending.swap(0, Ordering::AcqRel))
    }

    fn raise(&self, event: StreamEvent) {
        let subscriber = self.subscriber.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sub) = subscriber.as_ref().filter(|s| s.mask.intersects(event)) {
            trace!("Stream event {:?}", event);
            self.pending.fetch_or(event.bits(), Ordering::AcqRel);
            sub.flags.set(sub.bits);
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            capacity: self.capacity,
            occupancy: self.available(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
            watermark_events: self.watermark_events.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingStream")
            .field("capacity", &self.capacity)
            .field("threshold", &self.threshold)
            .field("occupancy", &self.available())
            .finish()
    }
}
