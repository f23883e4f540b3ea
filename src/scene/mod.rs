//! Scene model
//!
//! The scene is the ordered stack of surfaces the compositor draws. It has
//! its own lock, separate from every stream's swapper lock: compositing
//! threads snapshot it once per pass as a list of [`Renderable`]s, and
//! clients never touch it while swapping.
//!
//! Observers hear about two kinds of change: the stack itself changed
//! (surfaces added, moved, restyled) or a surface posted a new frame.

use crate::compositor::{BufferStream, CompositingCriteria, ConsumerId, FrameObserverId};
use crate::display::DisplayListener;
use crate::geometry::Rectangle;
use cgmath::{Matrix4, SquareMatrix};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

/// Snapshot of one visible surface, taken under the scene lock
#[derive(Clone)]
pub struct Renderable {
    pub id: SurfaceId,
    pub screen_position: Rectangle,
    pub alpha: f32,
    pub shaped: bool,
    pub transformation: Matrix4<f32>,
    pub stream: Arc<BufferStream>,
}

impl CompositingCriteria for Renderable {
    fn screen_position(&self) -> Rectangle {
        self.screen_position
    }

    fn alpha(&self) -> f32 {
        self.alpha
    }

    fn shaped(&self) -> bool {
        self.shaped
    }

    fn transformation(&self) -> Matrix4<f32> {
        self.transformation
    }
}

impl fmt::Debug for Renderable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderable")
            .field("id", &self.id)
            .field("screen_position", &self.screen_position)
            .field("alpha", &self.alpha)
            .field("shaped", &self.shaped)
            .finish()
    }
}

pub trait SceneObserver: Send + Sync {
    /// The stack or a surface's placement changed
    fn scene_changed(&self);

    /// A surface posted `frames` new frames covering `damage`
    fn frame_posted(&self, frames: usize, damage: &Rectangle);
}

pub trait Scene: Send + Sync {
    /// Visible surfaces, bottom to top
    fn scene_elements(&self) -> Vec<Renderable>;

    /// Most frames any visible surface has waiting for `consumer`
    fn frames_pending(&self, consumer: ConsumerId) -> usize;

    fn register_compositor(&self, consumer: ConsumerId);

    /// Forgets the compositor everywhere, releasing anything it holds back
    fn unregister_compositor(&self, consumer: ConsumerId);

    fn add_observer(&self, observer: Arc<dyn SceneObserver>);
    fn remove_observer(&self, observer: &Arc<dyn SceneObserver>);
}

#[derive(Debug, Clone, Copy)]
struct SurfaceState {
    position: Rectangle,
    alpha: f32,
    shaped: bool,
    transformation: Matrix4<f32>,
    visible: bool,
}

struct Surface {
    id: SurfaceId,
    stream: Arc<BufferStream>,
    state: Arc<RwLock<SurfaceState>>,
    frame_observer: FrameObserverId,
}

type Observers = Arc<RwLock<Vec<Arc<dyn SceneObserver>>>>;

/// The default [`Scene`]: a z-ordered stack of surfaces
pub struct SurfaceStack {
    surfaces: RwLock<Vec<Surface>>,
    observers: Observers,
    compositors: Mutex<HashSet<ConsumerId>>,
    outputs: RwLock<Vec<Rectangle>>,
    next_id: AtomicU64,
}

impl SurfaceStack {
    pub fn new() -> Self {
        Self {
            surfaces: RwLock::new(Vec::new()),
            observers: Arc::new(RwLock::new(Vec::new())),
            compositors: Mutex::new(HashSet::new()),
            outputs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Puts a surface on top of the stack
    pub fn add_surface(&self, stream: Arc<BufferStream>, position: Rectangle) -> SurfaceId {
        let id = SurfaceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(RwLock::new(SurfaceState {
            position,
            alpha: 1.0,
            shaped: false,
            transformation: Matrix4::identity(),
            visible: true,
        }));

        let observers = Arc::clone(&self.observers);
        let surface_state = Arc::clone(&state);
        let frame_observer = stream.add_frame_observer(move |_damage| {
            let state = *surface_state.read();
            if !state.visible {
                return;
            }
            let observers: Vec<_> = observers.read().iter().cloned().collect();
            for observer in observers {
                observer.frame_posted(1, &state.position);
            }
        });

        self.surfaces.write().push(Surface {
            id,
            stream,
            state,
            frame_observer,
        });

        info!("➕ Added {} at {}", id, position);
        self.emit_scene_changed();
        id
    }

    pub fn remove_surface(&self, id: SurfaceId) -> bool {
        let removed = {
            let mut surfaces = self.surfaces.write();
            surfaces
                .iter()
                .position(|s| s.id == id)
                .map(|index| surfaces.remove(index))
        };

        let Some(surface) = removed else {
            return false;
        };
        surface.stream.remove_frame_observer(surface.frame_observer);
        for consumer in self.compositors.lock().iter() {
            surface.stream.unregister_consumer(*consumer);
        }

        info!("➖ Removed {}", id);
        self.emit_scene_changed();
        true
    }

    pub fn move_surface(&self, id: SurfaceId, position: Rectangle) -> bool {
        self.update(id, |state| state.position = position)
    }

    pub fn set_alpha(&self, id: SurfaceId, alpha: f32) -> bool {
        self.update(id, |state| state.alpha = alpha.clamp(0.0, 1.0))
    }

    pub fn set_shaped(&self, id: SurfaceId, shaped: bool) -> bool {
        self.update(id, |state| state.shaped = shaped)
    }

    pub fn set_transformation(&self, id: SurfaceId, transformation: Matrix4<f32>) -> bool {
        self.update(id, |state| state.transformation = transformation)
    }

    /// Hiding a surface also stops every compositor from holding back its
    /// frames
    pub fn set_visible(&self, id: SurfaceId, visible: bool) -> bool {
        if !visible {
            if let Some(stream) = self.stream(id) {
                for consumer in self.compositors.lock().iter() {
                    stream.unregister_consumer(*consumer);
                }
            }
        }
        self.update(id, |state| state.visible = visible)
    }

    /// Moves the surface to the top of the stack
    pub fn raise(&self, id: SurfaceId) -> bool {
        let raised = {
            let mut surfaces = self.surfaces.write();
            match surfaces.iter().position(|s| s.id == id) {
                Some(index) => {
                    let surface = surfaces.remove(index);
                    surfaces.push(surface);
                    true
                }
                None => false,
            }
        };
        if raised {
            self.emit_scene_changed();
        }
        raised
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.read().len()
    }

    pub fn stream(&self, id: SurfaceId) -> Option<Arc<BufferStream>> {
        self.surfaces
            .read()
            .iter()
            .find(|s| s.id == id)
            .map(|s| Arc::clone(&s.stream))
    }

    /// Output areas currently being composited
    pub fn outputs(&self) -> Vec<Rectangle> {
        self.outputs.read().clone()
    }

    pub fn compositor_count(&self) -> usize {
        self.compositors.lock().len()
    }

    fn update(&self, id: SurfaceId, change: impl FnOnce(&mut SurfaceState)) -> bool {
        let found = {
            let surfaces = self.surfaces.read();
            match surfaces.iter().find(|s| s.id == id) {
                Some(surface) => {
                    change(&mut surface.state.write());
                    true
                }
                None => false,
            }
        };
        if found {
            debug!("✏️ Updated {}", id);
            self.emit_scene_changed();
        }
        found
    }

    fn emit_scene_changed(&self) {
        let observers: Vec<_> = self.observers.read().iter().cloned().collect();
        for observer in observers {
            observer.scene_changed();
        }
    }
}

impl Default for SurfaceStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene for SurfaceStack {
    fn scene_elements(&self) -> Vec<Renderable> {
        self.surfaces
            .read()
            .iter()
            .filter_map(|surface| {
                let state = *surface.state.read();
                state.visible.then(|| Renderable {
                    id: surface.id,
                    screen_position: state.position,
                    alpha: state.alpha,
                    shaped: state.shaped,
                    transformation: state.transformation,
                    stream: Arc::clone(&surface.stream),
                })
            })
            .collect()
    }

    fn frames_pending(&self, consumer: ConsumerId) -> usize {
        self.surfaces
            .read()
            .iter()
            .filter(|surface| surface.state.read().visible)
            .map(|surface| surface.stream.buffers_ready_for_compositor(consumer))
            .max()
            .unwrap_or(0)
    }

    fn register_compositor(&self, consumer: ConsumerId) {
        self.compositors.lock().insert(consumer);
        debug!("🖥️ Scene registered {}", consumer);
    }

    fn unregister_compositor(&self, consumer: ConsumerId) {
        self.compositors.lock().remove(&consumer);
        for surface in self.surfaces.read().iter() {
            surface.stream.unregister_consumer(consumer);
        }
        debug!("🖥️ Scene unregistered {}", consumer);
    }

    fn add_observer(&self, observer: Arc<dyn SceneObserver>) {
        self.observers.write().push(observer);
    }

    fn remove_observer(&self, observer: &Arc<dyn SceneObserver>) {
        self.observers
            .write()
            .retain(|existing| Arc::as_ptr(existing) as *const () != Arc::as_ptr(observer) as *const ());
    }
}

impl DisplayListener for SurfaceStack {
    fn add_display(&self, area: &Rectangle) {
        self.outputs.write().push(*area);
        self.emit_scene_changed();
    }

    fn remove_display(&self, area: &Rectangle) {
        {
            let mut outputs = self.outputs.write();
            if let Some(index) = outputs.iter().position(|o| o == area) {
                outputs.remove(index);
            }
        }
        self.emit_scene_changed();
    }
}

impl Drop for SurfaceStack {
    fn drop(&mut self) {
        for surface in self.surfaces.get_mut().iter() {
            surface.stream.remove_frame_observer(surface.frame_observer);
        }
    }
}

#[cfg(test)]
mod tests;
