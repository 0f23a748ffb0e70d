//! Bounded outbound frame buffer
//!
//! The writer side of a client connection pulls from this buffer. When a
//! client consumes slower than the camera produces, the buffer drops the
//! oldest frame instead of growing; every JPEG frame is independently
//! decodable so dropping old ones only costs latency, never corruption.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::debug;

/// Counters for slow-client diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
}

impl BufferStats {
    /// Drop rate as a percentage of received frames.
    pub fn drop_rate(&self) -> f64 {
        if self.frames_received == 0 {
            0.0
        } else {
            (self.frames_dropped as f64 / self.frames_received as f64) * 100.0
        }
    }
}

/// Fixed-capacity FIFO of encoded frames with drop-oldest overflow.
pub struct FrameBuffer {
    buffer: VecDeque<Bytes>,
    capacity: usize,
    stats: BufferStats,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame buffer capacity must be nonzero");
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            stats: BufferStats::default(),
        }
    }

    /// Push a frame, evicting the oldest if full. Returns false when a frame
    /// was evicted to make room.
    pub fn push(&mut self, frame: Bytes) -> bool {
        self.stats.frames_received += 1;
        let mut kept_all = true;
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
            self.stats.frames_dropped += 1;
            kept_all = false;
            if self.stats.frames_dropped % 100 == 1 {
                debug!(
                    dropped = self.stats.frames_dropped,
                    "slow client, dropping oldest frames"
                );
            }
        }
        self.buffer.push_back(frame);
        kept_all
    }

    /// Pop the oldest buffered frame.
    pub fn pop(&mut self) -> Option<Bytes> {
        self.buffer.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }
}
