//! Buffer pool state machine for one stream
//!
//! Every buffer of the pool is in exactly one place at any instant:
//!
//! - **free**: idle, next in line for the client
//! - **client**: being drawn into, in acquisition order
//! - **compositor**: submitted, tracked by the [`MultiMonitorArbiter`] until
//!   every consumer is done with it
//!
//! All state sits behind one mutex. Client completions are queued while the
//! pool is empty and invoked after the lock is released, so a completion may
//! call straight back into the swapper.
//!
//! # Policies
//!
//! - [`SwapPolicy::Synchronous`]: a client waits until a buffer comes back
//!   from the compositor side
//! - [`SwapPolicy::FrameDropping`]: a waiting client takes the oldest
//!   submitted frame nobody holds instead, so it never waits while such a
//!   frame exists
//!
//! A startup frame is seeded at construction, so compositor acquires never
//! fail and the client can take the remaining `nbuffers - 1` buffers without
//! waiting.

use super::arbiter::{FrameInfo, MultiMonitorArbiter};
use super::frame_dropping::FrameDroppingPolicy;
use super::{ConsumerId, SwapperError};
use crate::geometry::{Rectangle, Size};
use crate::graphics::{Buffer, BufferId, BufferProperties, GraphicBufferAllocator};
use log::{debug, info, trace};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPolicy {
    Synchronous,
    FrameDropping,
}

impl SwapPolicy {
    pub fn from_framedropping(framedropping: bool) -> Self {
        if framedropping {
            SwapPolicy::FrameDropping
        } else {
            SwapPolicy::Synchronous
        }
    }
}

/// What [`BufferSwapper::drop_frame`] managed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    /// A frame was dropped and its buffer handed to the first waiting client
    Dropped,
    /// No client was waiting
    NoWaiter,
    /// A client is waiting but every submitted frame is held or newest
    AllHeld,
}

/// Where the pool's buffers currently are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapperCensus {
    pub free: usize,
    pub client: usize,
    pub compositor: usize,
    pub pending_requests: usize,
}

impl SwapperCensus {
    pub fn total(&self) -> usize {
        self.free + self.client + self.compositor
    }
}

/// Completion for an asynchronous client acquire
pub type Completion = Box<dyn FnOnce(Result<Arc<Buffer>, SwapperError>) + Send>;

type Ready = Vec<(Completion, Result<Arc<Buffer>, SwapperError>)>;

struct SwapperState {
    arbiter: MultiMonitorArbiter,
    free: VecDeque<Arc<Buffer>>,
    client_owned: VecDeque<Arc<Buffer>>,
    pending: VecDeque<Completion>,
    policy: SwapPolicy,
    stopped: bool,
    dropping_policy: Option<Box<dyn FrameDroppingPolicy>>,
}

impl SwapperState {
    fn take_for_client(&mut self, allow_drop: bool) -> Option<Arc<Buffer>> {
        self.free.pop_front().or_else(|| {
            if allow_drop {
                self.arbiter.drop_oldest()
            } else {
                None
            }
        })
    }

    fn hand_to_client(&mut self, buffer: &Arc<Buffer>) {
        self.client_owned.push_back(Arc::clone(buffer));
    }

    fn unblocked(&self) {
        if let Some(policy) = &self.dropping_policy {
            policy.swap_unblocked();
        }
    }

    /// Returns retired frames to the pool and serves waiting clients from it
    fn settle(&mut self) -> Ready {
        let retired = self.arbiter.collect_retired();
        self.free.extend(retired);

        let allow_drop = self.policy == SwapPolicy::FrameDropping;
        let mut ready = Ready::new();
        while !self.pending.is_empty() {
            let Some(buffer) = self.take_for_client(allow_drop) else {
                break;
            };
            let Some(completion) = self.pending.pop_front() else {
                self.free.push_front(buffer);
                break;
            };

            trace!("🔁 Waiting client given buffer {}", buffer.id());
            self.hand_to_client(&buffer);
            self.unblocked();
            ready.push((completion, Ok(buffer)));
        }
        ready
    }
}

fn complete(ready: Ready) {
    for (completion, result) in ready {
        completion(result);
    }
}

pub struct BufferSwapper {
    state: Mutex<SwapperState>,
    nbuffers: usize,
    properties: BufferProperties,
}

impl BufferSwapper {
    /// Allocates the whole pool up front. The first buffer becomes the blank
    /// startup frame.
    pub fn new(
        allocator: &dyn GraphicBufferAllocator,
        properties: BufferProperties,
        nbuffers: usize,
        policy: SwapPolicy,
    ) -> Result<Self, SwapperError> {
        if nbuffers < 2 {
            return Err(SwapperError::InvalidBufferCount(nbuffers));
        }

        let mut buffers = (0..nbuffers)
            .map(|_| allocator.alloc_buffer(&properties))
            .collect::<Result<VecDeque<_>, _>>()?;

        let mut arbiter = MultiMonitorArbiter::new();
        if let Some(startup) = buffers.pop_front() {
            if let Ok(mut mapping) = startup.map() {
                mapping.fill(0);
            }
            arbiter.submit_placeholder(startup)?;
        }

        info!(
            "🔄 Buffer swapper ready: {} x {} {:?}, {:?}",
            nbuffers, properties.size, properties.format, policy
        );

        Ok(Self {
            state: Mutex::new(SwapperState {
                arbiter,
                free: buffers,
                client_owned: VecDeque::new(),
                pending: VecDeque::new(),
                policy,
                stopped: false,
                dropping_policy: None,
            }),
            nbuffers,
            properties,
        })
    }

    pub fn nbuffers(&self) -> usize {
        self.nbuffers
    }

    pub fn properties(&self) -> &BufferProperties {
        &self.properties
    }

    /// Requests a buffer for the client. `completion` runs immediately when a
    /// buffer is available, otherwise later on whichever thread frees one.
    pub fn client_acquire_async<F>(&self, completion: F)
    where
        F: FnOnce(Result<Arc<Buffer>, SwapperError>) + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.stopped {
            drop(state);
            completion(Err(SwapperError::Stopped));
            return;
        }

        if state.pending.is_empty() {
            let allow_drop = state.policy == SwapPolicy::FrameDropping;
            if let Some(buffer) = state.take_for_client(allow_drop) {
                state.hand_to_client(&buffer);
                drop(state);
                trace!("✏️ Client acquired buffer {}", buffer.id());
                completion(Ok(buffer));
                return;
            }
        }

        debug!("⏳ Client acquire waiting ({} already queued)", state.pending.len());
        state.pending.push_back(Box::new(completion));
        if let Some(policy) = &state.dropping_policy {
            policy.swap_now_blocking();
        }
    }

    /// Blocks the calling thread until a buffer is available or the swapper
    /// stops
    pub fn client_acquire(&self) -> Result<Arc<Buffer>, SwapperError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.client_acquire_async(move |result| {
            let _ = tx.send(result);
        });
        rx.recv().unwrap_or(Err(SwapperError::Stopped))
    }

    /// Submits the buffer as the newest frame, covering the whole buffer
    pub fn client_release(&self, buffer: &Arc<Buffer>) -> Result<(), SwapperError> {
        let size = buffer.size();
        self.client_submit(buffer, size, Rectangle::from_size(size))
    }

    /// Submits the buffer as the newest frame. Buffers must come back in the
    /// order they were acquired.
    pub fn client_submit(
        &self,
        buffer: &Arc<Buffer>,
        dest_size: Size,
        src_bounds: Rectangle,
    ) -> Result<(), SwapperError> {
        let id = buffer.id();
        let ready = {
            let mut state = self.state.lock();
            match state.client_owned.front() {
                Some(front) if front.id() == id => {}
                Some(front) if state.client_owned.iter().any(|b| b.id() == id) => {
                    return Err(SwapperError::OutOfOrderRelease {
                        expected: front.id(),
                        released: id,
                    });
                }
                _ => return Err(SwapperError::NotOwnedByClient(id)),
            }

            if let Some(owned) = state.client_owned.pop_front() {
                if let Err(err) = state.arbiter.submit_buffer(Arc::clone(&owned), dest_size, src_bounds) {
                    state.client_owned.push_front(owned);
                    return Err(err);
                }
            }
            trace!("📤 Client submitted buffer {}", id);
            state.settle()
        };

        complete(ready);
        Ok(())
    }

    /// Never blocks. Returns the consumer's next frame, or its last one again.
    pub fn compositor_acquire(&self, consumer: ConsumerId) -> Result<Arc<Buffer>, SwapperError> {
        self.compositor_acquire_frame(consumer).map(|(buffer, _)| buffer)
    }

    /// [`compositor_acquire`](Self::compositor_acquire) along with the
    /// geometry the client submitted the frame with
    pub fn compositor_acquire_frame(&self, consumer: ConsumerId) -> Result<(Arc<Buffer>, FrameInfo), SwapperError> {
        let (result, ready) = {
            let mut state = self.state.lock();
            let result = state.arbiter.compositor_acquire(consumer).map(|buffer| {
                let info = state
                    .arbiter
                    .frame_info(buffer.id())
                    .unwrap_or_else(|| FrameInfo::whole(&buffer));
                (buffer, info)
            });
            (result, state.settle())
        };
        complete(ready);
        result
    }

    pub fn compositor_release(&self, consumer: ConsumerId, buffer: &Buffer) -> Result<(), SwapperError> {
        let (result, ready) = {
            let mut state = self.state.lock();
            let result = state.arbiter.compositor_release(consumer, buffer.id());
            (result, state.settle())
        };
        complete(ready);
        result
    }

    pub fn snapshot_acquire(&self) -> Result<Arc<Buffer>, SwapperError> {
        self.state.lock().arbiter.snapshot_acquire()
    }

    pub fn snapshot_release(&self, buffer: &Buffer) -> Result<(), SwapperError> {
        let (result, ready) = {
            let mut state = self.state.lock();
            let result = state.arbiter.snapshot_release(buffer.id());
            (result, state.settle())
        };
        complete(ready);
        result
    }

    pub fn register_consumer(&self, consumer: ConsumerId) {
        self.state.lock().arbiter.register_consumer(consumer);
    }

    pub fn unregister_consumer(&self, consumer: ConsumerId) {
        let ready = {
            let mut state = self.state.lock();
            state.arbiter.unregister_consumer(consumer);
            state.settle()
        };
        complete(ready);
    }

    /// Frames the consumer has not seen yet
    pub fn buffers_ready_for_compositor(&self, consumer: ConsumerId) -> usize {
        self.state.lock().arbiter.buffers_ready(consumer)
    }

    /// Takes effect for the next buffer a client waits on
    pub fn allow_framedropping(&self, allow: bool) {
        let mut state = self.state.lock();
        state.policy = SwapPolicy::from_framedropping(allow);
        debug!("🎚️ Swapper policy set to {:?}", state.policy);
    }

    pub fn framedropping_allowed(&self) -> bool {
        self.state.lock().policy == SwapPolicy::FrameDropping
    }

    /// Hands the oldest unheld frame to the first waiting client. Does nothing
    /// when no client is waiting.
    pub fn drop_frame(&self) -> DropOutcome {
        let (completion, buffer) = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return DropOutcome::NoWaiter;
            }
            let Some(buffer) = state.take_for_client(true) else {
                debug!("🧊 No frame can be dropped, every submitted frame is held");
                return DropOutcome::AllHeld;
            };
            let Some(completion) = state.pending.pop_front() else {
                state.free.push_front(buffer);
                return DropOutcome::NoWaiter;
            };
            state.hand_to_client(&buffer);
            state.unblocked();
            (completion, buffer)
        };

        debug!("🗑️ Dropped a frame to unblock client, gave it buffer {}", buffer.id());
        completion(Ok(buffer));
        DropOutcome::Dropped
    }

    /// Fails every waiting and future client acquire with
    /// [`SwapperError::Stopped`]. Idempotent.
    pub fn force_client_abort(&self) {
        let aborted: Vec<Completion> = {
            let mut state = self.state.lock();
            state.stopped = true;
            let aborted: Vec<_> = state.pending.drain(..).collect();
            for _ in &aborted {
                state.unblocked();
            }
            aborted
        };

        if !aborted.is_empty() {
            info!("🛑 Aborted {} waiting client acquires", aborted.len());
        }
        for completion in aborted {
            completion(Err(SwapperError::Stopped));
        }
    }

    /// Satisfies every waiting client it can, dropping frames if needed, then
    /// stops the swapper. Used when the pool is being replaced.
    pub fn force_requests_to_complete(&self) {
        let ready = {
            let mut state = self.state.lock();
            let mut ready = Ready::new();
            while let Some(completion) = state.pending.pop_front() {
                match state.take_for_client(true) {
                    Some(buffer) => {
                        state.hand_to_client(&buffer);
                        ready.push((completion, Ok(buffer)));
                    }
                    None => ready.push((completion, Err(SwapperError::Stopped))),
                }
                state.unblocked();
            }
            state.stopped = true;
            ready
        };

        debug!("🏁 Forced {} waiting client acquires to complete", ready.len());
        complete(ready);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn client_owns(&self, buffer: BufferId) -> bool {
        self.state.lock().client_owned.iter().any(|b| b.id() == buffer)
    }

    /// Takes a buffer back from the client without showing it. Returns false
    /// when the client does not own it.
    pub fn discard_client_buffer(&self, buffer: BufferId) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.client_owned.iter().position(|b| b.id() == buffer) else {
            return false;
        };
        if let Some(discarded) = state.client_owned.remove(index) {
            state.free.push_back(discarded);
        }
        true
    }

    /// Whether the client still has a handle on any buffer it acquired
    pub fn client_holds_buffers(&self) -> bool {
        self.state
            .lock()
            .client_owned
            .iter()
            .any(|buffer| Arc::strong_count(buffer) > 1)
    }

    pub fn census(&self) -> SwapperCensus {
        let state = self.state.lock();
        SwapperCensus {
            free: state.free.len(),
            client: state.client_owned.len(),
            compositor: state.arbiter.frame_count(),
            pending_requests: state.pending.len(),
        }
    }

    /// Installs the hooks told when a client starts and stops waiting
    pub fn set_frame_dropping_policy(&self, policy: Box<dyn FrameDroppingPolicy>) {
        self.state.lock().dropping_policy = Some(policy);
    }

    pub fn clear_frame_dropping_policy(&self) -> Option<Box<dyn FrameDroppingPolicy>> {
        self.state.lock().dropping_policy.take()
    }
}

impl std::fmt::Debug for BufferSwapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSwapper")
            .field("nbuffers", &self.nbuffers)
            .field("census", &self.census())
            .finish()
    }
}

#[cfg(test)]
mod tests;
