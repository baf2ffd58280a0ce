//! Event Flags for Producer → Consumer Notification
//!
//! A 32-bit wait set owned by the consumer task. Producers set bits without
//! blocking; the consumer waits for any bit in a mask and clears what it
//! received. Several sets before a wake coalesce into one wake-up, so the
//! consumer must re-check the actual stream occupancy after waking.

use crate::StreamError;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

bitflags! {
    /// Event kinds a stream or session can raise
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StreamEvent: u32 {
        /// Occupancy crossed the high-watermark threshold
        const DATA_HIGH = 1 << 0;
        /// Backing storage failed during record or replay
        const IO_ERROR = 1 << 1;
    }
}

/// Single-reader wait set of event bits
#[derive(Debug, Default)]
pub struct EventFlags {
    bits: AtomicU32,
    notify: Notify,
}

impl EventFlags {
    /// Create an empty wait set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `bits` and wake the waiter. Returns the flags after the update.
    pub fn set(&self, bits: u32) -> u32 {
        let prev = self.bits.fetch_or(bits, Ordering::AcqRel);
        // notify_one stores a permit when nobody is waiting yet
        self.notify.notify_one();
        prev | bits
    }

    /// Current flags without clearing them
    pub fn get(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Clear and return the flags in `mask` that are currently set
    pub fn take(&self, mask: u32) -> u32 {
        self.bits.fetch_and(!mask, Ordering::AcqRel) & mask
    }

    /// Wait until any flag in `mask` is set, then clear and return those flags.
    ///
    /// With `timeout == None` the wait is unbounded.
    pub async fn wait_any(&self, mask: u32, timeout: Option<Duration>) -> Result<u32, StreamError> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait(mask))
                .await
                .map_err(|_| StreamError::Timeout(limit.as_millis() as u64)),
            None => Ok(self.wait(mask).await),
        }
    }

    async fn wait(&self, mask: u32) -> u32 {
        loop {
            let got = self.take(mask);
            if got != 0 {
                return got;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_before_wait_is_not_lost() {
        let flags = EventFlags::new();
        flags.set(0b01);

        let got = flags.wait_any(0b01, Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(got, 0b01);
        assert_eq!(flags.get(), 0);
    }

    #[tokio::test]
    async fn test_wait_only_clears_masked_bits() {
        let flags = EventFlags::new();
        flags.set(0b11);

        assert_eq!(flags.wait_any(0b10, None).await.unwrap(), 0b10);
        assert_eq!(flags.get(), 0b01);
    }

    #[tokio::test]
    async fn test_multiple_sets_coalesce() {
        let flags = EventFlags::new();
        flags.set(0b01);
        flags.set(0b01);
        flags.set(0b01);

        assert_eq!(flags.wait_any(0b01, None).await.unwrap(), 0b01);
        let second = flags.wait_any(0b01, Some(Duration::from_millis(5))).await;
        assert_eq!(second, Err(StreamError::Timeout(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_from_other_task() {
        let flags = Arc::new(EventFlags::new());
        let producer = flags.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.set(0b100);
        });

        let got = flags.wait_any(0b100, None).await.unwrap();
        assert_eq!(got, 0b100);
    }
}
