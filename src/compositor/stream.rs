//! Client-facing buffer stream
//!
//! A stream owns the swapper for one surface. Clients swap buffers through
//! it, compositors lock buffers from it with RAII guards, and the scene
//! subscribes to it to learn when a new frame was posted.
//!
//! # Resizing
//!
//! A resize builds a complete new swapper before touching the old one, so a
//! failed allocation leaves the stream exactly as it was. Clients waiting on
//! the old pool are released with old-size buffers; submitting those later is
//! accepted and the buffer is discarded. A request the old pool could not
//! serve moves on to the new one. Replaced pools are kept only while the
//! client still holds one of their buffers.
//!
//! # Usage
//!
//! ```no_run
//! use mir_compositor::compositor::{BufferStream, ConsumerId, StreamConfig};
//! use mir_compositor::geometry::Size;
//! use mir_compositor::graphics::{BufferProperties, BufferUsage, PixelFormat, ShmAllocator};
//! use std::sync::Arc;
//!
//! let properties = BufferProperties::new(Size::new(640, 480), PixelFormat::Argb8888, BufferUsage::Software);
//! let stream = BufferStream::new(StreamConfig::default(), properties, Arc::new(ShmAllocator::new()), None)?;
//!
//! let buffer = stream.swap_buffers_blocking(None)?;
//! buffer.map()?.fill(0xff336699);
//! stream.swap_buffers_blocking(Some(buffer))?;
//!
//! let frame = stream.lock_compositor_buffer(ConsumerId(1))?;
//! assert_eq!(frame.map()?.first_word(), 0xff336699);
//! # Ok::<(), anyhow::Error>(())
//! ```

use super::frame_dropping::FrameDroppingPolicyFactory;
use super::swapper::{BufferSwapper, Completion, DropOutcome, SwapPolicy, SwapperCensus};
use super::{ConsumerId, SwapperError};
use crate::config::BufferConfig;
use crate::geometry::{Rectangle, Size};
use crate::graphics::{Buffer, BufferProperties, GraphicBufferAllocator, PixelFormat};
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub nbuffers: usize,
    pub framedropping: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            nbuffers: 3,
            framedropping: false,
        }
    }
}

impl From<&BufferConfig> for StreamConfig {
    fn from(config: &BufferConfig) -> Self {
        Self {
            nbuffers: config.nbuffers,
            framedropping: config.framedropping,
        }
    }
}

/// Handle returned by [`BufferStream::add_frame_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameObserverId(u64);

type FrameObserver = Arc<dyn Fn(&Rectangle) + Send + Sync>;

/// The stream's current swapper, swapped out by resizes
type SwapperSlot = Arc<RwLock<Arc<BufferSwapper>>>;

pub struct BufferStream {
    allocator: Arc<dyn GraphicBufferAllocator>,
    policy_factory: Option<Arc<dyn FrameDroppingPolicyFactory>>,
    nbuffers: usize,
    properties: Mutex<BufferProperties>,
    swapper: SwapperSlot,
    /// Pools replaced by a resize whose buffers the client may still submit
    replaced: Mutex<Vec<Arc<BufferSwapper>>>,
    consumers: Mutex<HashSet<ConsumerId>>,
    framedropping: AtomicBool,
    aborted: AtomicBool,
    observers: Mutex<Vec<(FrameObserverId, FrameObserver)>>,
    next_observer: AtomicU64,
}

impl BufferStream {
    pub fn new(
        config: StreamConfig,
        properties: BufferProperties,
        allocator: Arc<dyn GraphicBufferAllocator>,
        policy_factory: Option<Arc<dyn FrameDroppingPolicyFactory>>,
    ) -> Result<Self, SwapperError> {
        let swapper = build_swapper(
            allocator.as_ref(),
            policy_factory.as_deref(),
            properties,
            config.nbuffers,
            config.framedropping,
        )?;

        Ok(Self {
            allocator,
            policy_factory,
            nbuffers: config.nbuffers,
            properties: Mutex::new(properties),
            swapper: Arc::new(RwLock::new(swapper)),
            replaced: Mutex::new(Vec::new()),
            consumers: Mutex::new(HashSet::new()),
            framedropping: AtomicBool::new(config.framedropping),
            aborted: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        })
    }

    fn current(&self) -> Arc<BufferSwapper> {
        Arc::clone(&self.swapper.read())
    }

    pub fn stream_size(&self) -> Size {
        self.properties.lock().size
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.properties.lock().format
    }

    /// Submits `old` (if any) as the newest frame, then requests the next
    /// buffer. Submission errors are returned directly and `completion` is
    /// not called; acquisition results always go to `completion`.
    pub fn swap_buffers<F>(&self, old: Option<Arc<Buffer>>, completion: F) -> Result<(), SwapperError>
    where
        F: FnOnce(Result<Arc<Buffer>, SwapperError>) + Send + 'static,
    {
        if let Some(old) = old {
            self.submit_whole_buffer(&old)?;
        }
        acquire_from(Arc::clone(&self.swapper), Box::new(completion));
        Ok(())
    }

    pub fn swap_buffers_blocking(&self, old: Option<Arc<Buffer>>) -> Result<Arc<Buffer>, SwapperError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.swap_buffers(old, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv().unwrap_or(Err(SwapperError::Stopped))
    }

    /// Async form of [`BufferStream::swap_buffers`]
    pub async fn next_buffer(&self, old: Option<Arc<Buffer>>) -> Result<Arc<Buffer>, SwapperError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.swap_buffers(old, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(SwapperError::Stopped))
    }

    /// Posts the buffer as the newest frame without asking for another.
    /// `src_bounds` is the part of the buffer to show, scaled to `dest_size`
    /// on screen.
    pub fn submit_buffer(
        &self,
        buffer: &Arc<Buffer>,
        dest_size: Size,
        src_bounds: Rectangle,
    ) -> Result<(), SwapperError> {
        let swapper = self.current();
        if !swapper.client_owns(buffer.id()) && self.discard_replaced(buffer) {
            debug!("🧹 Discarding buffer {} from a replaced pool", buffer.id());
            return Ok(());
        }

        swapper.client_submit(buffer, dest_size, src_bounds)?;
        self.notify_frame_posted(&Rectangle::from_size(buffer.size()));
        Ok(())
    }

    fn submit_whole_buffer(&self, buffer: &Arc<Buffer>) -> Result<(), SwapperError> {
        self.submit_buffer(buffer, buffer.size(), Rectangle::from_size(buffer.size()))
    }

    /// Returns a buffer to the replaced pool that lent it, forgetting pools
    /// the client no longer has buffers from
    fn discard_replaced(&self, buffer: &Buffer) -> bool {
        let mut replaced = self.replaced.lock();
        let found = replaced.iter().any(|pool| pool.discard_client_buffer(buffer.id()));
        replaced.retain(|pool| pool.client_holds_buffers());
        found
    }

    /// Locks the consumer's next frame until the guard is dropped
    pub fn lock_compositor_buffer(&self, consumer: ConsumerId) -> Result<CompositorBuffer, SwapperError> {
        self.consumers.lock().insert(consumer);
        let swapper = self.current();
        let (buffer, info) = swapper.compositor_acquire_frame(consumer)?;
        Ok(CompositorBuffer {
            swapper,
            consumer,
            buffer,
            dest_size: info.dest_size,
            src_bounds: info.src_bounds,
        })
    }

    /// Locks the newest frame for reading without consuming it
    pub fn lock_snapshot_buffer(&self) -> Result<SnapshotBuffer, SwapperError> {
        let swapper = self.current();
        let buffer = swapper.snapshot_acquire()?;
        Ok(SnapshotBuffer { swapper, buffer })
    }

    pub fn buffers_ready_for_compositor(&self, consumer: ConsumerId) -> usize {
        self.current().buffers_ready_for_compositor(consumer)
    }

    pub fn register_consumer(&self, consumer: ConsumerId) {
        self.consumers.lock().insert(consumer);
        self.current().register_consumer(consumer);
    }

    /// Stops tracking the consumer so it no longer holds back frames.
    /// Cheap when the consumer never used this stream.
    pub fn unregister_consumer(&self, consumer: ConsumerId) {
        if self.consumers.lock().remove(&consumer) {
            self.current().unregister_consumer(consumer);
        }
    }

    pub fn has_consumer(&self, consumer: ConsumerId) -> bool {
        self.consumers.lock().contains(&consumer)
    }

    pub fn allow_framedropping(&self, allow: bool) {
        self.framedropping.store(allow, Ordering::SeqCst);
        self.current().allow_framedropping(allow);
    }

    pub fn framedropping_allowed(&self) -> bool {
        self.framedropping.load(Ordering::SeqCst)
    }

    /// Replaces the pool with buffers of the new size
    pub fn resize(&self, size: Size) -> Result<(), SwapperError> {
        let mut properties = *self.properties.lock();
        if properties.size == size {
            return Ok(());
        }
        properties.size = size;

        let replacement = build_swapper(
            self.allocator.as_ref(),
            self.policy_factory.as_deref(),
            properties,
            self.nbuffers,
            self.framedropping_allowed(),
        )?;
        for consumer in self.consumers.lock().iter() {
            replacement.register_consumer(*consumer);
        }

        let old = {
            let mut slot = self.swapper.write();
            let old = std::mem::replace(&mut *slot, Arc::clone(&replacement));
            self.replaced.lock().push(Arc::clone(&old));
            old
        };
        *self.properties.lock() = properties;
        if self.aborted.load(Ordering::SeqCst) {
            replacement.force_client_abort();
        }

        drop(old.clear_frame_dropping_policy());
        old.force_requests_to_complete();
        self.replaced.lock().retain(|pool| pool.client_holds_buffers());

        info!("📐 Stream resized to {}", size);
        Ok(())
    }

    /// Pools replaced by a resize that still lent the client a buffer
    pub fn replaced_pools(&self) -> usize {
        self.replaced.lock().len()
    }

    /// Fails all waiting and future client acquires, including ones made
    /// after a resize
    pub fn force_client_abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.current().force_client_abort();
    }

    /// Unblocks a waiting client by dropping its oldest unheld frame
    pub fn drop_frame(&self) -> DropOutcome {
        self.current().drop_frame()
    }

    /// Releases waiting clients, with a buffer where one can be had
    pub fn force_requests_to_complete(&self) {
        self.current().force_requests_to_complete();
    }

    pub fn census(&self) -> SwapperCensus {
        self.current().census()
    }

    /// Calls `observer` with the damaged buffer area each time a frame is
    /// posted
    pub fn add_frame_observer<F>(&self, observer: F) -> FrameObserverId
    where
        F: Fn(&Rectangle) + Send + Sync + 'static,
    {
        let id = FrameObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    pub fn remove_frame_observer(&self, id: FrameObserverId) {
        self.observers.lock().retain(|(existing, _)| *existing != id);
    }

    fn notify_frame_posted(&self, damage: &Rectangle) {
        let observers: Vec<FrameObserver> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(damage);
        }
    }
}

impl Drop for BufferStream {
    fn drop(&mut self) {
        let swapper = self.current();
        drop(swapper.clear_frame_dropping_policy());
        swapper.force_client_abort();
    }
}

impl std::fmt::Debug for BufferStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferStream")
            .field("size", &self.stream_size())
            .field("nbuffers", &self.nbuffers)
            .field("framedropping", &self.framedropping_allowed())
            .finish()
    }
}

/// Requests a buffer from the current pool. A request that a resize stopped
/// before it could be served is passed on to the pool that replaced it.
fn acquire_from(slot: SwapperSlot, completion: Completion) {
    let swapper = Arc::clone(&slot.read());
    let asked = Arc::clone(&swapper);
    swapper.client_acquire_async(move |result| {
        let moved = matches!(result, Err(SwapperError::Stopped)) && !Arc::ptr_eq(&asked, &*slot.read());
        if moved {
            trace!("🔁 Pool replaced while waiting, asking the new one");
            acquire_from(slot, completion);
        } else {
            completion(result);
        }
    });
}

fn build_swapper(
    allocator: &dyn GraphicBufferAllocator,
    policy_factory: Option<&dyn FrameDroppingPolicyFactory>,
    properties: BufferProperties,
    nbuffers: usize,
    framedropping: bool,
) -> Result<Arc<BufferSwapper>, SwapperError> {
    let swapper = Arc::new(BufferSwapper::new(
        allocator,
        properties,
        nbuffers,
        SwapPolicy::from_framedropping(framedropping),
    )?);

    if let Some(factory) = policy_factory {
        let weak = Arc::downgrade(&swapper);
        let policy = factory.create_policy(Box::new(move || {
            weak.upgrade()
                .map_or(true, |swapper| swapper.drop_frame() != DropOutcome::AllHeld)
        }));
        swapper.set_frame_dropping_policy(policy);
    }

    Ok(swapper)
}

/// A frame locked for composition. Released back to the swapper that
/// produced it when dropped, even if the stream was resized meanwhile.
pub struct CompositorBuffer {
    swapper: Arc<BufferSwapper>,
    consumer: ConsumerId,
    buffer: Arc<Buffer>,
    dest_size: Size,
    src_bounds: Rectangle,
}

impl CompositorBuffer {
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Size the client asked the frame to be shown at
    pub fn dest_size(&self) -> Size {
        self.dest_size
    }

    /// Part of the buffer the client asked to show
    pub fn src_bounds(&self) -> Rectangle {
        self.src_bounds
    }
}

impl Deref for CompositorBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buffer
    }
}

impl Drop for CompositorBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.swapper.compositor_release(self.consumer, &self.buffer) {
            warn!("⚠️ Failed to release compositor buffer {}: {}", self.buffer.id(), e);
        }
    }
}

/// A frame pinned for reading, e.g. for a screenshot
pub struct SnapshotBuffer {
    swapper: Arc<BufferSwapper>,
    buffer: Arc<Buffer>,
}

impl SnapshotBuffer {
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }
}

impl Deref for SnapshotBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buffer
    }
}

impl Drop for SnapshotBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.swapper.snapshot_release(&self.buffer) {
            warn!("⚠️ Failed to release snapshot buffer {}: {}", self.buffer.id(), e);
        }
    }
}
