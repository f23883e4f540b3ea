//! Headless display backend
//!
//! Outputs that exist only in memory. Composition reads the first pixel word
//! of every layer so tests can check what each output actually showed, and
//! failures can be injected to exercise the retry path.

use super::{Display, DisplayBuffer, DisplayError, DisplaySyncGroup, Layer};
use crate::geometry::Rectangle;
use crate::graphics::{Buffer, BufferId};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What an output showed most recently, plus counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputRecord {
    pub frames_rendered: u64,
    pub frames_bypassed: u64,
    pub failed_posts: u64,
    /// Buffers of the last composited frame, bottom to top
    pub last_layers: Vec<BufferId>,
    /// First pixel word of each layer of the last composited frame
    pub last_pixels: Vec<u32>,
    /// Buffer area sampled for each layer of the last composited frame
    pub last_src_bounds: Vec<Rectangle>,
    pub last_bypass: Option<BufferId>,
}

pub struct HeadlessOutput {
    area: Rectangle,
    record: Mutex<OutputRecord>,
    fail_next: AtomicUsize,
}

impl HeadlessOutput {
    pub fn new(area: Rectangle) -> Self {
        Self {
            area,
            record: Mutex::new(OutputRecord::default()),
            fail_next: AtomicUsize::new(0),
        }
    }

    pub fn record(&self) -> OutputRecord {
        self.record.lock().clone()
    }

    /// Makes the next `count` posts fail
    pub fn fail_next_posts(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), DisplayError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.record.lock().failed_posts += 1;
            return Err(DisplayError::PostFailed {
                area: self.area,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl DisplayBuffer for HeadlessOutput {
    fn view_area(&self) -> Rectangle {
        self.area
    }

    fn post(&self, buffer: &Arc<Buffer>) -> Result<(), DisplayError> {
        self.injected_failure()?;

        let mut record = self.record.lock();
        record.frames_bypassed += 1;
        record.last_bypass = Some(buffer.id());
        Ok(())
    }

    fn render_and_post(&self, layers: &[Layer]) -> Result<(), DisplayError> {
        self.injected_failure()?;

        let pixels = layers
            .iter()
            .map(|layer| layer.buffer.map().map(|m| m.first_word()).unwrap_or(0))
            .collect();

        let mut record = self.record.lock();
        record.frames_rendered += 1;
        record.last_layers = layers.iter().map(|l| l.buffer.id()).collect();
        record.last_pixels = pixels;
        record.last_src_bounds = layers.iter().map(|l| l.src_bounds).collect();
        record.last_bypass = None;
        Ok(())
    }
}

pub struct HeadlessSyncGroup {
    outputs: Vec<Arc<HeadlessOutput>>,
    refresh: Duration,
    commits: AtomicU64,
}

impl HeadlessSyncGroup {
    pub fn new(outputs: Vec<Arc<HeadlessOutput>>, refresh: Duration) -> Self {
        Self {
            outputs,
            refresh,
            commits: AtomicU64::new(0),
        }
    }

    pub fn outputs(&self) -> &[Arc<HeadlessOutput>] {
        &self.outputs
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }
}

impl DisplaySyncGroup for HeadlessSyncGroup {
    fn display_buffers(&self) -> Vec<Arc<dyn DisplayBuffer>> {
        self.outputs
            .iter()
            .map(|o| Arc::clone(o) as Arc<dyn DisplayBuffer>)
            .collect()
    }

    fn commit(&self) -> Result<(), DisplayError> {
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("🖼️ Headless group committed frame {}", n);
        Ok(())
    }

    fn recommended_sleep(&self) -> Duration {
        self.refresh
    }
}

pub struct HeadlessDisplay {
    groups: Vec<Arc<HeadlessSyncGroup>>,
}

impl HeadlessDisplay {
    /// One sync group per output
    pub fn new(areas: &[Rectangle], refresh: Duration) -> Self {
        let groups = areas
            .iter()
            .map(|area| {
                Arc::new(HeadlessSyncGroup::new(
                    vec![Arc::new(HeadlessOutput::new(*area))],
                    refresh,
                ))
            })
            .collect();
        info!("🖥️ Headless display with {} outputs", areas.len());
        Self { groups }
    }

    /// All outputs in a single sync group
    pub fn mirrored(areas: &[Rectangle], refresh: Duration) -> Self {
        let outputs = areas
            .iter()
            .map(|area| Arc::new(HeadlessOutput::new(*area)))
            .collect();
        info!("🖥️ Headless display with {} outputs in one group", areas.len());
        Self {
            groups: vec![Arc::new(HeadlessSyncGroup::new(outputs, refresh))],
        }
    }

    /// `count` outputs of `width`x`height` laid out left to right
    pub fn side_by_side(count: usize, width: u32, height: u32, refresh: Duration) -> Self {
        let areas: Vec<Rectangle> = (0..count)
            .map(|i| Rectangle::new(i as i32 * width as i32, 0, width, height))
            .collect();
        Self::new(&areas, refresh)
    }

    pub fn groups(&self) -> &[Arc<HeadlessSyncGroup>] {
        &self.groups
    }

    pub fn outputs(&self) -> Vec<Arc<HeadlessOutput>> {
        self.groups
            .iter()
            .flat_map(|g| g.outputs().iter().cloned())
            .collect()
    }
}

impl Display for HeadlessDisplay {
    fn sync_groups(&self) -> Vec<Arc<dyn DisplaySyncGroup>> {
        self.groups
            .iter()
            .map(|g| Arc::clone(g) as Arc<dyn DisplaySyncGroup>)
            .collect()
    }
}
