//! Worker event flags
//!
//! An OR-combined flag word the session worker blocks on. Producers raise
//! bits from any thread without blocking or allocating (the capture
//! callback relies on this); the worker atomically takes and clears the
//! whole word on wake. Coalesced raises collapse into one wake, so
//! delivery is at-least-once and handlers are written idempotently.

use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Notify;

/// Mic ring crossed the one-frame threshold
pub const MIC_RX: u32 = 1 << 0;

/// Mic closed; flush and commit the input buffer
pub const MIC_CLOSE: u32 = 1 << 1;

/// Session is shutting down
pub const EXIT: u32 = 1 << 2;

/// Atomically OR-combined, cleared-on-receipt event flags
pub struct EventFlags {
    bits: AtomicU32,
    notify: Notify,
}

impl EventFlags {
    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            notify: Notify::new(),
        }
    }

    /// Raise one or more flag bits. Never blocks.
    pub fn raise(&self, bits: u32) {
        self.bits.fetch_or(bits, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Wait until any flag is raised, then take and clear the whole word.
    pub async fn wait(&self) -> u32 {
        loop {
            let bits = self.bits.swap(0, Ordering::AcqRel);
            if bits != 0 {
                return bits;
            }
            self.notify.notified().await;
        }
    }

    /// Take and clear without waiting; 0 when nothing is pending
    pub fn take(&self) -> u32 {
        self.bits.swap(0, Ordering::AcqRel)
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_raised_bits() {
        let flags = EventFlags::new();
        flags.raise(MIC_RX);
        assert_eq!(flags.wait().await, MIC_RX);
    }

    #[tokio::test]
    async fn test_raises_coalesce_into_one_wake() {
        let flags = EventFlags::new();
        flags.raise(MIC_RX);
        flags.raise(MIC_RX);
        flags.raise(MIC_CLOSE);

        assert_eq!(flags.wait().await, MIC_RX | MIC_CLOSE);
        // Everything was consumed by the single wake.
        assert_eq!(flags.take(), 0);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_raise() {
        let flags = Arc::new(EventFlags::new());

        let waiter = {
            let flags = flags.clone();
            tokio::spawn(async move { flags.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        flags.raise(EXIT);
        assert_eq!(waiter.await.unwrap(), EXIT);
    }

    #[tokio::test]
    async fn test_raise_from_plain_thread() {
        let flags = Arc::new(EventFlags::new());
        let producer = {
            let flags = flags.clone();
            std::thread::spawn(move || flags.raise(MIC_RX))
        };
        producer.join().unwrap();
        assert_eq!(flags.wait().await, MIC_RX);
    }
}
