//! Shared-memory allocator

use super::{
    AllocError, Buffer, BufferIdGenerator, BufferProperties, BufferStorage,
    GraphicBufferAllocator,
};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Allocates CPU-visible buffers. Used for software clients, the headless
/// display and tests.
#[derive(Debug, Default)]
pub struct ShmAllocator {
    ids: BufferIdGenerator,
    allocated: AtomicUsize,
    /// Total allocations allowed over the allocator's lifetime
    limit: Option<usize>,
}

impl ShmAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every allocation after the first `limit`
    pub fn with_allocation_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl GraphicBufferAllocator for ShmAllocator {
    fn alloc_buffer(&self, properties: &BufferProperties) -> Result<Arc<Buffer>, AllocError> {
        if properties.size.is_empty() {
            return Err(AllocError::InvalidProperties(format!(
                "zero-sized buffer {}",
                properties.size
            )));
        }

        let (stride, words) = layout(properties)?;

        let count = self.allocated.fetch_add(1, Ordering::Relaxed);
        if let Some(limit) = self.limit {
            if count >= limit {
                self.allocated.fetch_sub(1, Ordering::Relaxed);
                warn!("⚠️ Shm allocator refused buffer: {} allocations made", limit);
                return Err(AllocError::Exhausted { limit });
            }
        }

        let id = self.ids.next_id();
        debug!(
            "🆕 Allocated shm buffer {} ({} {:?}, stride {})",
            id, properties.size, properties.format, stride
        );

        Ok(Arc::new(Buffer::new(
            id,
            *properties,
            stride,
            BufferStorage::Shm(Mutex::new(vec![0; words])),
        )))
    }
}

/// Word-aligned stride and pixel storage size in words
fn layout(properties: &BufferProperties) -> Result<(u32, usize), AllocError> {
    let too_large = || AllocError::InvalidProperties(format!("buffer {} is too large", properties.size));

    let stride = properties
        .size
        .width
        .checked_mul(properties.format.bytes_per_pixel())
        .and_then(|row_bytes| row_bytes.checked_add(3))
        .map(|row_bytes| row_bytes & !3)
        .ok_or_else(too_large)?;
    let bytes = (stride as usize)
        .checked_mul(properties.size.height as usize)
        .ok_or_else(too_large)?;

    Ok((stride, bytes / 4))
}
