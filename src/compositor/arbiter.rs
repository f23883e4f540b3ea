//! Multi-monitor arbitration of submitted frames
//!
//! One producer submits frames; any number of consumers (one per output)
//! pull them independently. Each consumer walks the submitted frames in order
//! and repeats its last frame when nothing new arrived, so a slow output never
//! sees frames out of order and a fast output never waits for a slow one.
//!
//! A frame goes back to the producer only once it is no longer the newest
//! frame, nobody holds it, and every registered consumer has moved past it.
//! A consumer that stops pulling therefore pins frames until the pool runs
//! dry; [`MultiMonitorArbiter::drop_oldest`] is the escape valve used by the
//! frame dropping paths. With no consumer registered nothing is watching the
//! stream, and superseded frames go back whether or not anyone saw them.
//!
//! The arbiter itself is plain data. [`super::swapper::BufferSwapper`] drives
//! it under the stream's lock.

use super::{ConsumerId, SwapperError};
use crate::geometry::{Rectangle, Size};
use crate::graphics::{Buffer, BufferId};
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug)]
struct Frame {
    seq: u64,
    buffer: Arc<Buffer>,
    dest_size: Size,
    src_bounds: Rectangle,
    /// Acquired by at least one consumer
    seen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Has not acquired anything yet; starts at the first frame with at
    /// least this sequence number
    From(u64),
    /// Last frame handed to this consumer
    Seen(u64),
}

#[derive(Debug)]
struct Consumer {
    cursor: Cursor,
    /// Sequence numbers acquired and not yet released
    held: Vec<u64>,
}

impl Consumer {
    fn starting_at(seq: u64) -> Self {
        Self {
            cursor: Cursor::From(seq),
            held: Vec::new(),
        }
    }
}

/// Geometry the producer attached to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub buffer_id: BufferId,
    pub dest_size: Size,
    pub src_bounds: Rectangle,
}

impl FrameInfo {
    /// Geometry of a frame that shows the whole buffer at its own size
    pub fn whole(buffer: &Buffer) -> Self {
        Self {
            buffer_id: buffer.id(),
            dest_size: buffer.size(),
            src_bounds: Rectangle::from_size(buffer.size()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MultiMonitorArbiter {
    frames: VecDeque<Frame>,
    next_seq: u64,
    consumers: HashMap<ConsumerId, Consumer>,
    /// Sequence numbers pinned by snapshot readers
    snapshots: Vec<u64>,
}

impl MultiMonitorArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer pushes its newest frame. Every registered consumer now has
    /// it pending.
    pub fn submit_buffer(
        &mut self,
        buffer: Arc<Buffer>,
        dest_size: Size,
        src_bounds: Rectangle,
    ) -> Result<(), SwapperError> {
        if self.frames.iter().any(|f| f.buffer.id() == buffer.id()) {
            return Err(SwapperError::AlreadySubmitted(buffer.id()));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        trace!("📥 Frame {} submitted with buffer {}", seq, buffer.id());

        self.frames.push_back(Frame {
            seq,
            buffer,
            dest_size,
            src_bounds,
            seen: false,
        });
        Ok(())
    }

    /// Submits a frame that counts as already consumed, so it is recycled as
    /// soon as anything newer arrives. Used for the blank startup frame.
    pub(crate) fn submit_placeholder(&mut self, buffer: Arc<Buffer>) -> Result<(), SwapperError> {
        let size = buffer.size();
        self.submit_buffer(buffer, size, Rectangle::from_size(size))?;
        if let Some(frame) = self.frames.back_mut() {
            frame.seen = true;
        }
        Ok(())
    }

    pub fn register_consumer(&mut self, consumer: ConsumerId) {
        let start = self.start_seq();
        self.consumers.entry(consumer).or_insert_with(|| {
            debug!("🖥️ Consumer {} registered", consumer);
            Consumer::starting_at(start)
        });
    }

    /// Forgets the consumer along with everything it still holds
    pub fn unregister_consumer(&mut self, consumer: ConsumerId) {
        if self.consumers.remove(&consumer).is_some() {
            debug!("🖥️ Consumer {} unregistered", consumer);
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Hands the consumer its next frame, or the same one again when nothing
    /// newer was submitted. Never blocks.
    pub fn compositor_acquire(&mut self, consumer: ConsumerId) -> Result<Arc<Buffer>, SwapperError> {
        if self.frames.is_empty() {
            return Err(SwapperError::NothingSubmitted);
        }

        self.register_consumer(consumer);
        let cursor = self.consumers[&consumer].cursor;
        let index = self.next_index(cursor);

        let frame = &mut self.frames[index];
        frame.seen = true;
        let seq = frame.seq;
        let buffer = frame.buffer.clone();

        if let Some(state) = self.consumers.get_mut(&consumer) {
            state.cursor = Cursor::Seen(seq);
            state.held.push(seq);
        }

        trace!("🎞️ Consumer {} acquired frame {} ({})", consumer, seq, buffer.id());
        Ok(buffer)
    }

    pub fn compositor_release(&mut self, consumer: ConsumerId, buffer: BufferId) -> Result<(), SwapperError> {
        let frames = &self.frames;
        let state = self
            .consumers
            .get_mut(&consumer)
            .ok_or(SwapperError::NotHeldByCompositor(buffer))?;

        let position = state
            .held
            .iter()
            .position(|seq| {
                frames
                    .iter()
                    .any(|f| f.seq == *seq && f.buffer.id() == buffer)
            })
            .ok_or(SwapperError::NotHeldByCompositor(buffer))?;

        state.held.swap_remove(position);
        Ok(())
    }

    /// Pins the newest frame for a screenshot without advancing anybody
    pub fn snapshot_acquire(&mut self) -> Result<Arc<Buffer>, SwapperError> {
        let frame = self.frames.back().ok_or(SwapperError::NothingSubmitted)?;
        self.snapshots.push(frame.seq);
        Ok(frame.buffer.clone())
    }

    pub fn snapshot_release(&mut self, buffer: BufferId) -> Result<(), SwapperError> {
        let frames = &self.frames;
        let position = self
            .snapshots
            .iter()
            .position(|seq| frames.iter().any(|f| f.seq == *seq && f.buffer.id() == buffer))
            .ok_or(SwapperError::NotHeldByCompositor(buffer))?;

        self.snapshots.swap_remove(position);
        Ok(())
    }

    /// Number of submitted frames the consumer has not yet seen. Zero for
    /// consumers that never registered.
    pub fn buffers_ready(&self, consumer: ConsumerId) -> usize {
        let Some(cursor) = self.consumers.get(&consumer).map(|c| c.cursor) else {
            return 0;
        };

        match cursor {
            Cursor::Seen(last) => self.frames.iter().filter(|f| f.seq > last).count(),
            Cursor::From(first) => self.frames.iter().filter(|f| f.seq >= first).count(),
        }
    }

    /// Removes every frame that can go back to the producer
    pub fn collect_retired(&mut self) -> Vec<Arc<Buffer>> {
        let Some(newest) = self.frames.back().map(|f| f.seq) else {
            return Vec::new();
        };

        let floors: Vec<u64> = self
            .consumers
            .values()
            .map(|c| Self::floor(c.cursor))
            .collect();
        let watched = !floors.is_empty();

        let mut retired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.frames.len());
        for frame in self.frames.drain(..) {
            let retirable = frame.seq != newest
                && (frame.seen || !watched)
                && floors.iter().all(|floor| *floor > frame.seq)
                && !Self::pinned(&self.consumers, &self.snapshots, frame.seq);

            if retirable {
                trace!("♻️ Frame {} retired ({})", frame.seq, frame.buffer.id());
                retired.push(frame.buffer);
            } else {
                kept.push_back(frame);
            }
        }
        self.frames = kept;
        retired
    }

    /// Drops the oldest frame that is neither the newest nor held, whether or
    /// not every consumer has seen it. Consumers that had not reached it skip
    /// it.
    pub fn drop_oldest(&mut self) -> Option<Arc<Buffer>> {
        let newest = self.frames.back()?.seq;
        let index = self.frames.iter().position(|f| {
            f.seq != newest && !Self::pinned(&self.consumers, &self.snapshots, f.seq)
        })?;

        let frame = self.frames.remove(index)?;
        debug!("🗑️ Dropped frame {} ({})", frame.seq, frame.buffer.id());
        Some(frame.buffer)
    }

    /// Frame geometry for a buffer currently on the compositor side
    pub fn frame_info(&self, buffer: BufferId) -> Option<FrameInfo> {
        self.frames
            .iter()
            .find(|f| f.buffer.id() == buffer)
            .map(|f| FrameInfo {
                buffer_id: f.buffer.id(),
                dest_size: f.dest_size,
                src_bounds: f.src_bounds,
            })
    }

    pub fn contains(&self, buffer: BufferId) -> bool {
        self.frames.iter().any(|f| f.buffer.id() == buffer)
    }

    /// Number of frames currently on the compositor side
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Whether `collect_retired` would hand this buffer back right now
    pub fn is_retirable(&self, buffer: BufferId) -> bool {
        let Some(newest) = self.frames.back().map(|f| f.seq) else {
            return false;
        };
        let watched = !self.consumers.is_empty();
        self.frames.iter().any(|f| {
            f.buffer.id() == buffer
                && f.seq != newest
                && (f.seen || !watched)
                && self.consumers.values().all(|c| Self::floor(c.cursor) > f.seq)
                && !Self::pinned(&self.consumers, &self.snapshots, f.seq)
        })
    }

    fn pinned(consumers: &HashMap<ConsumerId, Consumer>, snapshots: &[u64], seq: u64) -> bool {
        snapshots.contains(&seq) || consumers.values().any(|c| c.held.contains(&seq))
    }

    /// Oldest sequence number the consumer may still need
    fn floor(cursor: Cursor) -> u64 {
        match cursor {
            Cursor::Seen(seq) | Cursor::From(seq) => seq,
        }
    }

    /// Where a new consumer starts: the oldest frame nobody has seen yet,
    /// or the newest frame when everything was seen.
    fn start_seq(&self) -> u64 {
        self.frames
            .iter()
            .find(|f| !f.seen)
            .or_else(|| self.frames.back())
            .map(|f| f.seq)
            .unwrap_or(self.next_seq)
    }

    fn next_index(&self, cursor: Cursor) -> usize {
        match cursor {
            Cursor::From(first) => self
                .frames
                .iter()
                .position(|f| f.seq >= first)
                .unwrap_or(self.frames.len() - 1),
            Cursor::Seen(last) => self
                .frames
                .iter()
                .position(|f| f.seq > last)
                .or_else(|| self.frames.iter().position(|f| f.seq == last))
                .unwrap_or(self.frames.len() - 1),
        }
    }
}
