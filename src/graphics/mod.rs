//! Graphic buffers and the allocator seam
//!
//! A [`Buffer`] is one frame's worth of pixel storage. It is always shared as
//! an `Arc<Buffer>`; whoever holds the last reference keeps the storage alive.
//! The swapper decides who may *write* or *read* a buffer at any instant, the
//! reference count only decides when the memory goes away.
//!
//! Backends differ only in how pixels are stored, so instead of a type per
//! platform there is one `Buffer` type with a tagged [`BufferStorage`]:
//! shared memory that the CPU can map, or an opaque native handle owned by a
//! GPU allocator living outside this crate.

use crate::geometry::Size;
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

mod shm;

pub use shm::ShmAllocator;

/// Process-unique buffer identity, assigned by the allocator that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u32);

impl BufferId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source. Each allocator owns one; there is no global counter.
#[derive(Debug)]
pub struct BufferIdGenerator {
    next: AtomicU32,
}

impl BufferIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next_id(&self) -> BufferId {
        BufferId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for BufferIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Rgb565 => 2,
            _ => 4,
        }
    }

    pub fn has_alpha(&self) -> bool {
        matches!(self, PixelFormat::Argb8888 | PixelFormat::Abgr8888)
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::Argb8888
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferUsage {
    /// Rendered by the GPU, scanout capable
    Hardware,
    /// Written by the CPU
    Software,
}

/// What a client asks the allocator for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferProperties {
    pub size: Size,
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

impl BufferProperties {
    pub fn new(size: Size, format: PixelFormat, usage: BufferUsage) -> Self {
        Self {
            size,
            format,
            usage,
        }
    }
}

/// Opaque token for storage owned by an external GPU allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeHandle {
    pub fd: i32,
    pub modifier: u64,
}

/// Where the pixels live
pub enum BufferStorage {
    /// CPU-visible memory, kept as 32-bit words so it is always aligned
    Shm(Mutex<Vec<u32>>),
    Native(NativeHandle),
}

impl fmt::Debug for BufferStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferStorage::Shm(_) => f.write_str("Shm"),
            BufferStorage::Native(handle) => write!(f, "Native({:?})", handle),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("buffer allocator exhausted ({limit} buffers live)")]
    Exhausted { limit: usize },

    #[error("invalid buffer properties: {0}")]
    InvalidProperties(String),

    #[error("allocation backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer {0} has no CPU mapping")]
    NotMappable(BufferId),
}

/// One frame's worth of pixel storage
#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    properties: BufferProperties,
    stride: u32,
    storage: BufferStorage,
}

impl Buffer {
    pub fn new(
        id: BufferId,
        properties: BufferProperties,
        stride: u32,
        storage: BufferStorage,
    ) -> Self {
        Self {
            id,
            properties,
            stride,
            storage,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> Size {
        self.properties.size
    }

    /// Bytes per row
    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.properties.format
    }

    pub fn usage(&self) -> BufferUsage {
        self.properties.usage
    }

    pub fn properties(&self) -> &BufferProperties {
        &self.properties
    }

    pub fn native_handle(&self) -> Option<NativeHandle> {
        match &self.storage {
            BufferStorage::Native(handle) => Some(*handle),
            BufferStorage::Shm(_) => None,
        }
    }

    /// Maps the pixels for CPU access. The mapping is released when the guard
    /// goes out of scope.
    pub fn map(&self) -> Result<MappedBuffer<'_>, BufferError> {
        match &self.storage {
            BufferStorage::Shm(words) => Ok(MappedBuffer {
                id: self.id,
                stride: self.stride,
                words: words.lock(),
            }),
            BufferStorage::Native(_) => Err(BufferError::NotMappable(self.id)),
        }
    }
}

/// Scoped CPU mapping of a shared-memory buffer
pub struct MappedBuffer<'a> {
    id: BufferId,
    stride: u32,
    words: MutexGuard<'a, Vec<u32>>,
}

impl MappedBuffer<'_> {
    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.words.as_slice())
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(self.words.as_mut_slice())
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Fills every 32-bit word with `value`
    pub fn fill(&mut self, value: u32) {
        self.words.iter_mut().for_each(|w| *w = value);
    }

    /// First word of storage; clients stamp frame numbers here in tests
    pub fn first_word(&self) -> u32 {
        self.words.first().copied().unwrap_or(0)
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        debug!("🔓 Unmapped buffer {}", self.id);
    }
}

/// Produces buffers for swapper pools
#[cfg_attr(test, mockall::automock)]
pub trait GraphicBufferAllocator: Send + Sync {
    fn alloc_buffer(&self, properties: &BufferProperties) -> Result<Arc<Buffer>, AllocError>;
}
