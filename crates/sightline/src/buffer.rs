//! Single-slot latest-wins frame buffer
//!
//! The buffer is the backpressure mechanism between the camera and its two
//! consumers:
//! - A fast producer never stalls: `publish` replaces whatever is unread.
//! - A slow consumer never sees a backlog: it gets the freshest frame or nothing.
//!
//! There are two readers with different contracts:
//! - The local broadcaster is the primary reader and clears the slot with
//!   [`FrameBuffer::take_if_present`].
//! - The upstream link peeks without clearing via [`FrameBuffer::peek_newer`],
//!   tracking the sequence number of the last frame it sent.
//!
//! Both readers may skip frames relative to each other; neither can starve the
//! other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::frame::Frame;

/// Statistics about buffer traffic (snapshot of atomic counters)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Frames written by the producer
    pub published: u64,
    /// Unread frames replaced by a newer publish
    pub overwritten: u64,
    /// Frames removed by the primary reader
    pub taken: u64,
}

struct AtomicBufferStats {
    published: AtomicU64,
    overwritten: AtomicU64,
    taken: AtomicU64,
}

impl AtomicBufferStats {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
            taken: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> BufferStats {
        BufferStats {
            published: self.published.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            taken: self.taken.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Slot {
    /// Frame not yet consumed by the primary reader
    unread: Option<Arc<Frame>>,
    /// Most recent frame, kept for peeking readers
    latest: Option<Arc<Frame>>,
    /// Sequence number of `latest` (0 = nothing published yet)
    seq: u64,
}

/// Latest-wins holding cell shared between the capture thread and the async
/// consumers.
///
/// The mutex is only held for pointer swaps and never across an `.await`, so
/// `publish` is safe to call from a blocking thread.
pub struct FrameBuffer {
    slot: Mutex<Slot>,
    seq_tx: watch::Sender<u64>,
    stats: AtomicBufferStats,
}

impl FrameBuffer {
    pub fn new() -> Self {
        let (seq_tx, _) = watch::channel(0);
        Self {
            slot: Mutex::new(Slot::default()),
            seq_tx,
            stats: AtomicBufferStats::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Slot updates are plain assignments, so a poisoned guard is still consistent.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new frame, discarding any unread one.
    ///
    /// Returns the sequence number assigned to the frame.
    pub fn publish(&self, frame: Frame) -> u64 {
        let frame = Arc::new(frame);
        let seq = {
            let mut slot = self.lock();
            slot.seq += 1;
            if slot.unread.replace(Arc::clone(&frame)).is_some() {
                self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
            }
            slot.latest = Some(frame);
            slot.seq
        };
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.seq_tx.send_replace(seq);
        seq
    }

    /// Remove and return the unread frame, if any. Never blocks.
    pub fn take_if_present(&self) -> Option<Arc<Frame>> {
        let frame = self.lock().unread.take();
        if frame.is_some() {
            self.stats.taken.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Return the latest frame if its sequence number is greater than `after`,
    /// without clearing the slot.
    pub fn peek_newer(&self, after: u64) -> Option<(u64, Arc<Frame>)> {
        let slot = self.lock();
        if slot.seq > after {
            slot.latest.as_ref().map(|f| (slot.seq, Arc::clone(f)))
        } else {
            None
        }
    }

    /// Wait until a frame newer than `after` is published and return it
    /// without clearing the slot.
    pub async fn wait_newer(&self, after: u64) -> (u64, Arc<Frame>) {
        let mut rx = self.subscribe();
        loop {
            if let Some(found) = self.peek_newer(after) {
                return found;
            }
            // The sender lives as long as `self`, so this cannot fail.
            let _ = rx.changed().await;
        }
    }

    /// Receiver notified with the sequence number of every publish
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.seq_tx.subscribe()
    }

    /// Sequence number of the most recent publish (0 if none)
    #[cfg(test)]
    pub(crate) fn latest_seq(&self) -> u64 {
        *self.seq_tx.borrow()
    }

    /// Whether an unread frame is waiting for the primary reader
    #[cfg(test)]
    pub(crate) fn has_unread(&self) -> bool {
        self.lock().unread.is_some()
    }

    pub fn stats(&self) -> BufferStats {
        self.stats.snapshot()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
