//! Bounded, drop-newest block queue between the capture callback and consumers

use super::AudioBlock;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Single-producer / single-consumer queue of audio blocks.
///
/// Publishing never blocks: when the queue is full the new block is
/// discarded and counted. Cloning shares the same underlying queue.
#[derive(Clone)]
pub struct BlockQueue {
    tx: Sender<AudioBlock>,
    rx: Receiver<AudioBlock>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl BlockQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Try to enqueue a copy of `block`. Returns false if it was dropped.
    ///
    /// Safe to call from the real-time callback.
    pub fn try_publish(&self, block: AudioBlock) -> bool {
        match self.tx.try_send(block) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop the oldest block without waiting.
    pub fn try_pop(&self) -> Option<AudioBlock> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for a block.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<AudioBlock> {
        match self.rx.recv_timeout(timeout) {
            Ok(block) => Some(block),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take every block currently queued, oldest first.
    pub fn drain(&self) -> impl Iterator<Item = AudioBlock> + '_ {
        self.rx.try_iter()
    }

    /// Discard everything currently queued. Returns how many blocks were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of blocks rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
