//! Unit tests for the buffer swapper
//!
//! Covers ownership hand-offs between client and compositor, both swap
//! policies, and the shutdown paths that release waiting clients.

use super::*;
use crate::graphics::{BufferUsage, PixelFormat, ShmAllocator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

type Slot = Arc<Mutex<Option<Result<Arc<Buffer>, SwapperError>>>>;

const COMPOSITOR: ConsumerId = ConsumerId(1);

fn properties() -> BufferProperties {
    BufferProperties::new(Size::new(16, 16), PixelFormat::Argb8888, BufferUsage::Software)
}

fn swapper(nbuffers: usize, policy: SwapPolicy) -> BufferSwapper {
    BufferSwapper::new(&ShmAllocator::new(), properties(), nbuffers, policy).unwrap()
}

/// Starts an async acquire and returns where its result will land
fn acquire_async(swapper: &BufferSwapper) -> Slot {
    let slot: Slot = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    swapper.client_acquire_async(move |result| {
        *sink.lock() = Some(result);
    });
    slot
}

fn take(slot: &Slot) -> Option<Result<Arc<Buffer>, SwapperError>> {
    slot.lock().take()
}

fn composite_once(swapper: &BufferSwapper) -> BufferId {
    let buffer = swapper.compositor_acquire(COMPOSITOR).unwrap();
    swapper.compositor_release(COMPOSITOR, &buffer).unwrap();
    buffer.id()
}

#[derive(Default)]
struct RecordingPolicy {
    blocking: AtomicUsize,
    unblocked: AtomicUsize,
}

struct SharedPolicy(Arc<RecordingPolicy>);

impl FrameDroppingPolicy for SharedPolicy {
    fn swap_now_blocking(&self) {
        self.0.blocking.fetch_add(1, Ordering::SeqCst);
    }

    fn swap_unblocked(&self) {
        self.0.unblocked.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_rejects_fewer_than_two_buffers() {
    for nbuffers in [0, 1] {
        let result = BufferSwapper::new(
            &ShmAllocator::new(),
            properties(),
            nbuffers,
            SwapPolicy::Synchronous,
        );
        assert_eq!(result.unwrap_err(), SwapperError::InvalidBufferCount(nbuffers));
    }
}

#[test]
fn test_allocation_failure_is_reported() {
    let allocator = ShmAllocator::with_allocation_limit(2);
    let result = BufferSwapper::new(&allocator, properties(), 3, SwapPolicy::Synchronous);

    assert!(matches!(result, Err(SwapperError::Allocation(_))));
}

#[test]
fn test_compositor_gets_startup_frame_before_any_submission() {
    let swapper = swapper(3, SwapPolicy::Synchronous);

    let first = composite_once(&swapper);
    let again = composite_once(&swapper);
    assert_eq!(first, again);
}

#[test]
fn test_client_gets_all_but_startup_buffer_without_waiting() {
    for nbuffers in 2..6 {
        let swapper = swapper(nbuffers, SwapPolicy::Synchronous);

        for _ in 0..nbuffers - 1 {
            assert!(take(&acquire_async(&swapper)).is_some());
        }
        let blocked = acquire_async(&swapper);
        assert!(take(&blocked).is_none());
        assert_eq!(swapper.census().pending_requests, 1);
    }
}

#[test]
fn test_client_and_compositor_never_share_a_buffer() {
    let swapper = swapper(3, SwapPolicy::Synchronous);

    for _ in 0..20 {
        let client = swapper.client_acquire().unwrap();
        let held = swapper.compositor_acquire(COMPOSITOR).unwrap();
        assert_ne!(client.id(), held.id());
        assert!(!swapper.client_owns(held.id()));

        swapper.client_release(&client).unwrap();
        swapper.compositor_release(COMPOSITOR, &held).unwrap();
    }
}

#[test]
fn test_compositor_sees_frames_in_submission_order() {
    let swapper = swapper(4, SwapPolicy::Synchronous);
    composite_once(&swapper);

    let submitted: Vec<BufferId> = (0..3)
        .map(|_| {
            let buffer = swapper.client_acquire().unwrap();
            swapper.client_release(&buffer).unwrap();
            buffer.id()
        })
        .collect();

    let composited: Vec<BufferId> = (0..3).map(|_| composite_once(&swapper)).collect();
    assert_eq!(composited, submitted);
}

#[test]
fn test_compositor_repeats_last_frame_when_client_is_idle() {
    let swapper = swapper(3, SwapPolicy::Synchronous);
    let buffer = swapper.client_acquire().unwrap();
    swapper.client_release(&buffer).unwrap();

    for _ in 0..5 {
        assert_eq!(composite_once(&swapper), buffer.id());
    }
}

#[test]
fn test_out_of_order_release_is_rejected() {
    let swapper = swapper(3, SwapPolicy::Synchronous);
    let first = swapper.client_acquire().unwrap();
    let second = swapper.client_acquire().unwrap();

    assert_eq!(
        swapper.client_release(&second).unwrap_err(),
        SwapperError::OutOfOrderRelease {
            expected: first.id(),
            released: second.id(),
        }
    );

    swapper.client_release(&first).unwrap();
    swapper.client_release(&second).unwrap();
}

#[test]
fn test_release_of_buffer_not_owned_is_rejected() {
    let swapper = swapper(3, SwapPolicy::Synchronous);
    let buffer = swapper.client_acquire().unwrap();
    swapper.client_release(&buffer).unwrap();

    assert_eq!(
        swapper.client_release(&buffer).unwrap_err(),
        SwapperError::NotOwnedByClient(buffer.id())
    );
}

#[test]
fn test_compositor_double_release_is_rejected() {
    let swapper = swapper(3, SwapPolicy::Synchronous);
    let held = swapper.compositor_acquire(COMPOSITOR).unwrap();
    swapper.compositor_release(COMPOSITOR, &held).unwrap();

    assert_eq!(
        swapper.compositor_release(COMPOSITOR, &held).unwrap_err(),
        SwapperError::NotHeldByCompositor(held.id())
    );
}

#[test]
fn test_waiting_client_is_served_when_compositor_moves_on() {
    let swapper = swapper(2, SwapPolicy::Synchronous);

    let first = swapper.client_acquire().unwrap();
    swapper.client_release(&first).unwrap();
    swapper.register_consumer(COMPOSITOR);

    // Startup frame went back to the pool when the first frame arrived
    let second = swapper.client_acquire().unwrap();
    swapper.client_release(&second).unwrap();

    let waiting = acquire_async(&swapper);
    assert!(take(&waiting).is_none());

    // Showing a frame does not free it; moving on to the next one does
    assert_eq!(composite_once(&swapper), first.id());
    assert!(take(&waiting).is_none());

    assert_eq!(composite_once(&swapper), second.id());
    let served = take(&waiting).unwrap().unwrap();
    assert_eq!(served.id(), first.id());
}

#[test]
fn test_framedropping_client_never_waits() {
    let swapper = swapper(2, SwapPolicy::FrameDropping);

    for _ in 0..1000 {
        let slot = acquire_async(&swapper);
        let buffer = take(&slot).unwrap().unwrap();
        swapper.client_release(&buffer).unwrap();
    }
    assert_eq!(swapper.census().total(), 2);
}

#[test]
fn test_framedropping_keeps_newest_frame() {
    let swapper = swapper(3, SwapPolicy::FrameDropping);
    composite_once(&swapper);

    let mut last = None;
    for _ in 0..10 {
        let buffer = swapper.client_acquire().unwrap();
        swapper.client_release(&buffer).unwrap();
        last = Some(buffer.id());
    }

    // Older frames were dropped, but the compositor still walks forward
    // through what remains and ends on the newest
    let shown = (0..4).map(|_| composite_once(&swapper)).last();
    assert_eq!(shown, last);
}

#[test]
fn test_allow_framedropping_switches_policy() {
    let swapper = swapper(2, SwapPolicy::Synchronous);
    assert!(!swapper.framedropping_allowed());

    swapper.allow_framedropping(true);
    assert!(swapper.framedropping_allowed());

    for _ in 0..10 {
        let buffer = take(&acquire_async(&swapper)).unwrap().unwrap();
        swapper.client_release(&buffer).unwrap();
    }
}

#[test]
fn test_drop_frame_only_acts_for_waiting_client() {
    let swapper = swapper(2, SwapPolicy::Synchronous);
    assert_eq!(swapper.drop_frame(), DropOutcome::NoWaiter);

    let a = swapper.client_acquire().unwrap();
    swapper.client_release(&a).unwrap();
    swapper.register_consumer(COMPOSITOR);
    let b = swapper.client_acquire().unwrap();
    swapper.client_release(&b).unwrap();

    let waiting = acquire_async(&swapper);
    assert!(take(&waiting).is_none());

    assert_eq!(swapper.drop_frame(), DropOutcome::Dropped);
    assert_eq!(take(&waiting).unwrap().unwrap().id(), a.id());
    assert_eq!(swapper.drop_frame(), DropOutcome::NoWaiter);
}

#[test]
fn test_drop_frame_cannot_take_held_frames() {
    let swapper = swapper(2, SwapPolicy::Synchronous);
    let a = swapper.client_acquire().unwrap();
    swapper.client_release(&a).unwrap();
    let held = swapper.compositor_acquire(COMPOSITOR).unwrap();
    assert_eq!(held.id(), a.id());

    let b = swapper.client_acquire().unwrap();
    swapper.client_release(&b).unwrap();

    let waiting = acquire_async(&swapper);
    assert_eq!(swapper.drop_frame(), DropOutcome::AllHeld);
    assert!(take(&waiting).is_none());

    swapper.compositor_release(COMPOSITOR, &held).unwrap();
    composite_once(&swapper);
    assert_eq!(take(&waiting).unwrap().unwrap().id(), a.id());
}

#[test]
fn test_force_client_abort_fails_waiters_and_later_acquires() {
    let swapper = swapper(2, SwapPolicy::Synchronous);
    let _held = swapper.client_acquire().unwrap();
    let waiting = acquire_async(&swapper);

    swapper.force_client_abort();
    assert_eq!(take(&waiting).unwrap().unwrap_err(), SwapperError::Stopped);
    assert_eq!(swapper.client_acquire().unwrap_err(), SwapperError::Stopped);

    swapper.force_client_abort();
    assert!(swapper.is_stopped());
}

#[test]
fn test_force_client_abort_wakes_blocked_threads() {
    let swapper = Arc::new(swapper(2, SwapPolicy::Synchronous));
    let _held = swapper.client_acquire().unwrap();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let swapper = Arc::clone(&swapper);
            thread::spawn(move || swapper.client_acquire())
        })
        .collect();

    while swapper.census().pending_requests < 4 {
        thread::sleep(Duration::from_millis(1));
    }
    swapper.force_client_abort();

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap().unwrap_err(), SwapperError::Stopped);
    }
}

#[test]
fn test_force_requests_to_complete_serves_what_it_can() {
    let swapper = swapper(2, SwapPolicy::Synchronous);
    let a = swapper.client_acquire().unwrap();
    swapper.client_release(&a).unwrap();
    swapper.register_consumer(COMPOSITOR);
    let b = swapper.client_acquire().unwrap();
    swapper.client_release(&b).unwrap();

    let first = acquire_async(&swapper);
    let second = acquire_async(&swapper);

    swapper.force_requests_to_complete();
    assert_eq!(take(&first).unwrap().unwrap().id(), a.id());
    assert_eq!(take(&second).unwrap().unwrap_err(), SwapperError::Stopped);
    assert!(swapper.is_stopped());
}

#[test]
fn test_snapshot_does_not_consume_frames() {
    let swapper = swapper(3, SwapPolicy::Synchronous);
    composite_once(&swapper);
    let buffer = swapper.client_acquire().unwrap();
    swapper.client_release(&buffer).unwrap();

    let snapshot = swapper.snapshot_acquire().unwrap();
    assert_eq!(snapshot.id(), buffer.id());
    swapper.snapshot_release(&snapshot).unwrap();

    assert_eq!(swapper.buffers_ready_for_compositor(COMPOSITOR), 1);
    assert_eq!(composite_once(&swapper), buffer.id());
}

#[test]
fn test_census_always_accounts_for_every_buffer() {
    let swapper = swapper(4, SwapPolicy::Synchronous);
    assert_eq!(swapper.census().total(), 4);

    let a = swapper.client_acquire().unwrap();
    let held = swapper.compositor_acquire(COMPOSITOR).unwrap();
    assert_eq!(swapper.census().total(), 4);

    swapper.client_release(&a).unwrap();
    swapper.compositor_release(COMPOSITOR, &held).unwrap();
    composite_once(&swapper);

    let census = swapper.census();
    assert_eq!(census.total(), 4);
    assert_eq!(census.client, 0);
}

#[test]
fn test_unregistering_consumer_frees_its_frames() {
    let swapper = swapper(2, SwapPolicy::Synchronous);
    let frozen = ConsumerId(9);
    let a = swapper.client_acquire().unwrap();
    swapper.client_release(&a).unwrap();
    let _held = swapper.compositor_acquire(frozen).unwrap();

    let b = swapper.client_acquire().unwrap();
    swapper.client_release(&b).unwrap();
    let waiting = acquire_async(&swapper);
    assert!(take(&waiting).is_none());

    swapper.unregister_consumer(frozen);
    assert_eq!(take(&waiting).unwrap().unwrap().id(), a.id());
}

#[test]
fn test_unwatched_client_is_never_throttled() {
    let swapper = swapper(2, SwapPolicy::Synchronous);

    let mut last = None;
    for _ in 0..20 {
        let buffer = take(&acquire_async(&swapper)).unwrap().unwrap();
        swapper.client_release(&buffer).unwrap();
        last = Some(buffer.id());
    }
    assert_eq!(swapper.census().pending_requests, 0);

    // An output showing up later starts at the newest frame
    assert_eq!(composite_once(&swapper), last.unwrap());
}

#[test]
fn test_policy_hooks_follow_blocking() {
    let recorder = Arc::new(RecordingPolicy::default());
    let swapper = swapper(2, SwapPolicy::Synchronous);
    swapper.set_frame_dropping_policy(Box::new(SharedPolicy(Arc::clone(&recorder))));

    let a = swapper.client_acquire().unwrap();
    swapper.client_release(&a).unwrap();
    swapper.register_consumer(COMPOSITOR);
    let b = swapper.client_acquire().unwrap();
    swapper.client_release(&b).unwrap();
    assert_eq!(recorder.blocking.load(Ordering::SeqCst), 0);

    let waiting = acquire_async(&swapper);
    assert_eq!(recorder.blocking.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.unblocked.load(Ordering::SeqCst), 0);

    composite_once(&swapper);
    composite_once(&swapper);
    assert!(take(&waiting).is_some());
    assert_eq!(recorder.unblocked.load(Ordering::SeqCst), 1);

    assert!(swapper.clear_frame_dropping_policy().is_some());
}

#[test]
fn test_completion_may_call_back_into_swapper() {
    let swapper = Arc::new(swapper(2, SwapPolicy::Synchronous));
    let a = swapper.client_acquire().unwrap();
    swapper.client_release(&a).unwrap();
    swapper.register_consumer(COMPOSITOR);
    let b = swapper.client_acquire().unwrap();
    swapper.client_release(&b).unwrap();

    let reentrant = Arc::clone(&swapper);
    let released = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&released);
    swapper.client_acquire_async(move |result| {
        let buffer = result.unwrap();
        reentrant.client_release(&buffer).unwrap();
        count.fetch_add(1, Ordering::SeqCst);
    });

    composite_once(&swapper);
    composite_once(&swapper);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_compositor_sees_submitted_geometry() {
    let swapper = swapper(3, SwapPolicy::Synchronous);
    let buffer = swapper.client_acquire().unwrap();
    let crop = Rectangle::new(2, 2, 8, 8);
    swapper.client_submit(&buffer, Size::new(32, 32), crop).unwrap();

    let (frame, info) = swapper.compositor_acquire_frame(COMPOSITOR).unwrap();
    assert_eq!(frame.id(), buffer.id());
    assert_eq!(info.dest_size, Size::new(32, 32));
    assert_eq!(info.src_bounds, crop);
    swapper.compositor_release(COMPOSITOR, &frame).unwrap();
}

#[test]
fn test_discarded_buffer_returns_to_pool() {
    let swapper = swapper(3, SwapPolicy::Synchronous);
    let buffer = swapper.client_acquire().unwrap();
    assert!(swapper.client_holds_buffers());

    assert!(swapper.discard_client_buffer(buffer.id()));
    assert!(!swapper.discard_client_buffer(buffer.id()));
    assert!(!swapper.client_holds_buffers());

    let census = swapper.census();
    assert_eq!(census.client, 0);
    assert_eq!(census.free, 2);
}

#[test]
fn test_dropped_client_handles_are_not_held() {
    let swapper = swapper(3, SwapPolicy::Synchronous);
    let buffer = swapper.client_acquire().unwrap();
    assert!(swapper.client_holds_buffers());

    drop(buffer);
    assert!(!swapper.client_holds_buffers());
    assert_eq!(swapper.census().client, 1);
}
