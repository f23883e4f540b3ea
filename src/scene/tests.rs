//! Unit tests for the surface stack

use super::*;
use crate::compositor::StreamConfig;
use crate::geometry::Size;
use crate::graphics::{BufferProperties, BufferUsage, PixelFormat, ShmAllocator};
use std::sync::atomic::AtomicUsize;

#[derive(Default)]
struct CountingObserver {
    changes: AtomicUsize,
    posts: AtomicUsize,
    last_damage: Mutex<Option<Rectangle>>,
}

impl SceneObserver for CountingObserver {
    fn scene_changed(&self) {
        self.changes.fetch_add(1, Ordering::SeqCst);
    }

    fn frame_posted(&self, frames: usize, damage: &Rectangle) {
        self.posts.fetch_add(frames, Ordering::SeqCst);
        *self.last_damage.lock() = Some(*damage);
    }
}

fn stream() -> Arc<BufferStream> {
    Arc::new(
        BufferStream::new(
            StreamConfig::default(),
            BufferProperties::new(Size::new(16, 16), PixelFormat::Argb8888, BufferUsage::Software),
            Arc::new(ShmAllocator::new()),
            None,
        )
        .unwrap(),
    )
}

fn observed(stack: &SurfaceStack) -> Arc<CountingObserver> {
    let observer = Arc::new(CountingObserver::default());
    stack.add_observer(observer.clone());
    observer
}

fn post_frame(stream: &BufferStream) {
    let buffer = stream.swap_buffers_blocking(None).unwrap();
    stream.submit_buffer(&buffer, buffer.size(), Rectangle::from_size(buffer.size())).unwrap();
}

#[test]
fn test_elements_are_bottom_to_top() {
    let stack = SurfaceStack::new();
    let bottom = stack.add_surface(stream(), Rectangle::new(0, 0, 10, 10));
    let top = stack.add_surface(stream(), Rectangle::new(5, 5, 10, 10));

    let ids: Vec<_> = stack.scene_elements().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![bottom, top]);

    assert!(stack.raise(bottom));
    let ids: Vec<_> = stack.scene_elements().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![top, bottom]);
}

#[test]
fn test_hidden_surfaces_are_not_rendered() {
    let stack = SurfaceStack::new();
    let id = stack.add_surface(stream(), Rectangle::new(0, 0, 10, 10));

    assert!(stack.set_visible(id, false));
    assert!(stack.scene_elements().is_empty());
    assert_eq!(stack.surface_count(), 1);
}

#[test]
fn test_surface_properties_reach_renderables() {
    let stack = SurfaceStack::new();
    let id = stack.add_surface(stream(), Rectangle::new(0, 0, 10, 10));
    stack.move_surface(id, Rectangle::new(3, 4, 10, 10));
    stack.set_alpha(id, 1.5);
    stack.set_shaped(id, true);

    let renderable = &stack.scene_elements()[0];
    assert_eq!(renderable.screen_position, Rectangle::new(3, 4, 10, 10));
    assert_eq!(renderable.alpha, 1.0);
    assert!(renderable.shaped);
}

#[test]
fn test_observers_hear_scene_changes() {
    let stack = SurfaceStack::new();
    let observer = observed(&stack);

    let id = stack.add_surface(stream(), Rectangle::new(0, 0, 10, 10));
    stack.move_surface(id, Rectangle::new(1, 1, 10, 10));
    stack.remove_surface(id);

    assert_eq!(observer.changes.load(Ordering::SeqCst), 3);
    assert!(!stack.move_surface(id, Rectangle::new(0, 0, 1, 1)));
    assert_eq!(observer.changes.load(Ordering::SeqCst), 3);
}

#[test]
fn test_frame_posts_carry_surface_position() {
    let stack = SurfaceStack::new();
    let observer = observed(&stack);
    let stream = stream();
    stack.add_surface(Arc::clone(&stream), Rectangle::new(100, 50, 16, 16));

    post_frame(&stream);

    assert_eq!(observer.posts.load(Ordering::SeqCst), 1);
    assert_eq!(*observer.last_damage.lock(), Some(Rectangle::new(100, 50, 16, 16)));
}

#[test]
fn test_hidden_surface_posts_are_silent() {
    let stack = SurfaceStack::new();
    let observer = observed(&stack);
    let stream = stream();
    let id = stack.add_surface(Arc::clone(&stream), Rectangle::new(0, 0, 16, 16));
    stack.set_visible(id, false);

    post_frame(&stream);
    assert_eq!(observer.posts.load(Ordering::SeqCst), 0);
}

#[test]
fn test_removed_observer_is_not_called() {
    let stack = SurfaceStack::new();
    let observer = observed(&stack);
    let as_dyn: Arc<dyn SceneObserver> = observer.clone();
    stack.remove_observer(&as_dyn);

    stack.add_surface(stream(), Rectangle::new(0, 0, 10, 10));
    assert_eq!(observer.changes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_removed_surface_stops_reporting_frames() {
    let stack = SurfaceStack::new();
    let observer = observed(&stack);
    let stream = stream();
    let id = stack.add_surface(Arc::clone(&stream), Rectangle::new(0, 0, 16, 16));
    assert!(stack.remove_surface(id));

    post_frame(&stream);
    assert_eq!(observer.posts.load(Ordering::SeqCst), 0);
    assert!(!stack.remove_surface(id));
}

#[test]
fn test_frames_pending_is_max_over_surfaces() {
    let stack = SurfaceStack::new();
    let consumer = ConsumerId(1);
    let busy = stream();
    let idle = stream();
    stack.add_surface(Arc::clone(&busy), Rectangle::new(0, 0, 16, 16));
    stack.add_surface(Arc::clone(&idle), Rectangle::new(0, 0, 16, 16));
    drop(busy.lock_compositor_buffer(consumer).unwrap());
    drop(idle.lock_compositor_buffer(consumer).unwrap());
    assert_eq!(stack.frames_pending(consumer), 0);

    post_frame(&busy);
    post_frame(&busy);

    assert_eq!(stack.frames_pending(consumer), 2);
}

#[test]
fn test_unregister_compositor_releases_streams() {
    let stack = SurfaceStack::new();
    let consumer = ConsumerId(4);
    let stream = stream();
    stack.add_surface(Arc::clone(&stream), Rectangle::new(0, 0, 16, 16));
    stack.register_compositor(consumer);
    assert_eq!(stack.compositor_count(), 1);

    drop(stream.lock_compositor_buffer(consumer).unwrap());
    assert!(stream.has_consumer(consumer));

    stack.unregister_compositor(consumer);
    assert!(!stream.has_consumer(consumer));
    assert_eq!(stack.compositor_count(), 0);
}

#[test]
fn test_display_listener_tracks_outputs() {
    let stack = SurfaceStack::new();
    let observer = observed(&stack);
    let area = Rectangle::new(0, 0, 1920, 1080);

    stack.add_display(&area);
    assert_eq!(stack.outputs(), vec![area]);

    stack.remove_display(&area);
    assert!(stack.outputs().is_empty());
    assert_eq!(observer.changes.load(Ordering::SeqCst), 2);
}
