//! Multi-threaded compositor
//!
//! One compositing thread per display sync group. Each thread sleeps until
//! compositing is scheduled (a client posted a frame, the scene changed, or
//! someone asked explicitly), then runs a pass over every output of its
//! group: snapshot the scene, scan a fullscreen buffer out directly when the
//! bypass predicate allows it, otherwise lock every overlapping surface's
//! buffer and render. The group is committed before any buffer is released
//! back to its stream.
//!
//! Passes that fail are logged and retried on the next schedule; a bad frame
//! never takes the thread down.

use super::bypass::BypassMatch;
use super::frame_pacing::{FramePacer, FrameStats};
use super::stream::CompositorBuffer;
use super::{CompositorError, ConsumerId};
use crate::config::MirConfig;
use crate::display::{Display, DisplayBuffer, DisplayError, DisplayListener, DisplaySyncGroup, Layer};
use crate::geometry::Rectangle;
use crate::scene::{Renderable, Scene, SceneObserver};
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const STOPPED: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;
const STOPPING: u8 = 3;

const THREAD_NAME: &str = "Mir/Comp";

#[derive(Debug, Clone, PartialEq)]
pub struct CompositorSettings {
    pub compose_on_start: bool,
    /// Sleep after each pass; the sync group's recommendation when unset
    pub fixed_composite_delay: Option<Duration>,
    pub bypass: bool,
    pub start_timeout: Duration,
    pub target_fps: u32,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            compose_on_start: true,
            fixed_composite_delay: None,
            bypass: true,
            start_timeout: Duration::from_secs(10),
            target_fps: 60,
        }
    }
}

impl From<&MirConfig> for CompositorSettings {
    fn from(config: &MirConfig) -> Self {
        Self {
            compose_on_start: config.compositor.compose_on_start,
            fixed_composite_delay: config.compositor.fixed_composite_delay(),
            bypass: config.compositor.bypass,
            start_timeout: config.compositor.start_timeout(),
            target_fps: config.pacing.target_fps,
        }
    }
}

/// Counters shared by every compositing thread
#[derive(Debug, Default)]
pub struct CompositorStats {
    passes: AtomicU64,
    frames_composited: AtomicU64,
    frames_bypassed: AtomicU64,
    post_failures: AtomicU64,
}

impl CompositorStats {
    /// Group passes, each covering every output of the group
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Output frames rendered from layers
    pub fn frames_composited(&self) -> u64 {
        self.frames_composited.load(Ordering::Relaxed)
    }

    /// Output frames scanned out straight from a client buffer
    pub fn frames_bypassed(&self) -> u64 {
        self.frames_bypassed.load(Ordering::Relaxed)
    }

    pub fn post_failures(&self) -> u64 {
        self.post_failures.load(Ordering::Relaxed)
    }
}

struct Output {
    buffer: Arc<dyn DisplayBuffer>,
    consumer: ConsumerId,
}

#[derive(Debug)]
struct RunState {
    running: bool,
    paused: bool,
    frames_scheduled: usize,
    not_posted_yet: bool,
}

/// Everything one compositing thread needs
struct CompositingFunctor {
    group_index: usize,
    group: Arc<dyn DisplaySyncGroup>,
    outputs: Vec<Output>,
    scene: Arc<dyn Scene>,
    listener: Arc<dyn DisplayListener>,
    settings: CompositorSettings,
    stats: Arc<CompositorStats>,
    pacer: Mutex<FramePacer>,
    run: Mutex<RunState>,
    wake: Condvar,
}

impl CompositingFunctor {
    fn new(
        group_index: usize,
        group: Arc<dyn DisplaySyncGroup>,
        outputs: Vec<Output>,
        scene: Arc<dyn Scene>,
        listener: Arc<dyn DisplayListener>,
        settings: CompositorSettings,
        stats: Arc<CompositorStats>,
    ) -> Self {
        let pacer = Mutex::new(FramePacer::new(settings.target_fps));
        Self {
            group_index,
            group,
            outputs,
            scene,
            listener,
            settings,
            stats,
            pacer,
            run: Mutex::new(RunState {
                running: true,
                paused: false,
                frames_scheduled: 0,
                not_posted_yet: true,
            }),
            wake: Condvar::new(),
        }
    }

    fn run(&self, started: crossbeam_channel::Sender<()>) {
        for output in &self.outputs {
            self.scene.register_compositor(output.consumer);
            self.listener.add_display(&output.buffer.view_area());
        }
        // start() may have given up waiting already
        let _ = started.send(());
        debug!(
            "🧵 Compositing thread for group {} running with {} outputs",
            self.group_index,
            self.outputs.len()
        );

        let mut run = self.run.lock();
        while run.running {
            self.wake
                .wait_while(&mut run, |r| r.running && (r.paused || r.frames_scheduled == 0));
            if !run.running {
                break;
            }

            run.frames_scheduled -= 1;
            run.not_posted_yet = false;

            let posted = MutexGuard::unlocked(&mut run, || {
                let posted = self.composite();
                let delay = self
                    .settings
                    .fixed_composite_delay
                    .unwrap_or_else(|| self.group.recommended_sleep());
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                posted
            });

            if !posted {
                run.frames_scheduled = run.frames_scheduled.max(1);
            }

            // Clients may have posted more than one frame meanwhile
            let pending = MutexGuard::unlocked(&mut run, || self.frames_pending());
            if pending > run.frames_scheduled {
                trace!("⏩ Group {} catching up on {} frames", self.group_index, pending);
                run.frames_scheduled = pending;
            }
        }
        drop(run);

        for output in &self.outputs {
            self.listener.remove_display(&output.buffer.view_area());
            self.scene.unregister_compositor(output.consumer);
        }
        debug!("🧵 Compositing thread for group {} finished", self.group_index);
    }

    /// One pass over every output of the group. False if anything failed.
    fn composite(&self) -> bool {
        self.pacer.lock().begin_frame();

        let elements = self.scene.scene_elements();
        let mut held: Vec<CompositorBuffer> = Vec::new();
        let mut posted = true;

        for output in &self.outputs {
            let view = output.buffer.view_area();

            // Streams this output no longer shows must not wait on it
            for renderable in elements.iter().filter(|r| !r.screen_position.overlaps(&view)) {
                renderable.stream.unregister_consumer(output.consumer);
            }

            if let Err(e) = self.composite_output(output, view, &elements, &mut held) {
                warn!("⚠️ Group {}: {}", self.group_index, e);
                self.stats.post_failures.fetch_add(1, Ordering::Relaxed);
                posted = false;
            }
        }

        if let Err(e) = self.group.commit() {
            warn!("⚠️ Group {}: {}", self.group_index, e);
            self.stats.post_failures.fetch_add(1, Ordering::Relaxed);
            posted = false;
        }

        // Release only once the frame is on screen
        drop(held);

        self.stats.passes.fetch_add(1, Ordering::Relaxed);
        self.pacer.lock().end_frame();
        posted
    }

    fn composite_output(
        &self,
        output: &Output,
        view: Rectangle,
        elements: &[Renderable],
        held: &mut Vec<CompositorBuffer>,
    ) -> Result<(), DisplayError> {
        if self.settings.bypass {
            if let Some(index) = BypassMatch::find(view, elements) {
                match elements[index].stream.lock_compositor_buffer(output.consumer) {
                    Ok(frame) => {
                        // Everything underneath is covered and must not wait on this output
                        for (i, covered) in elements.iter().enumerate() {
                            if i != index {
                                covered.stream.unregister_consumer(output.consumer);
                            }
                        }
                        output.buffer.post(frame.buffer())?;
                        held.push(frame);
                        self.stats.frames_bypassed.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(e) => debug!(
                        "🔀 Bypass of {} unavailable, compositing instead: {}",
                        elements[index].id, e
                    ),
                }
            }
        }

        let mut layers = Vec::new();
        for renderable in elements.iter().filter(|r| r.screen_position.overlaps(&view)) {
            match renderable.stream.lock_compositor_buffer(output.consumer) {
                Ok(frame) => {
                    layers.push(Layer {
                        buffer: Arc::clone(frame.buffer()),
                        position: renderable.screen_position,
                        src_bounds: frame.src_bounds(),
                        alpha: renderable.alpha,
                        transformation: renderable.transformation,
                    });
                    held.push(frame);
                }
                Err(e) => trace!("Skipping {}: {}", renderable.id, e),
            }
        }

        output.buffer.render_and_post(&layers)?;
        self.stats.frames_composited.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn frames_pending(&self) -> usize {
        self.outputs
            .iter()
            .map(|output| self.scene.frames_pending(output.consumer))
            .max()
            .unwrap_or(0)
    }

    fn schedule_compositing(&self, frames: usize) {
        let mut run = self.run.lock();
        if frames > run.frames_scheduled {
            run.frames_scheduled = frames;
            self.wake.notify_one();
        }
    }

    fn schedule_compositing_damage(&self, frames: usize, damage: &Rectangle) {
        let took_damage = self
            .outputs
            .iter()
            .any(|output| output.buffer.view_area().overlaps(damage));

        let mut run = self.run.lock();
        if (took_damage || run.not_posted_yet) && frames > run.frames_scheduled {
            run.frames_scheduled = frames;
            self.wake.notify_one();
        }
    }

    fn pause(&self) {
        self.run.lock().paused = true;
    }

    fn resume(&self) {
        let mut run = self.run.lock();
        run.paused = false;
        run.frames_scheduled = run.frames_scheduled.max(1);
        self.wake.notify_one();
    }

    fn stop(&self) {
        let mut run = self.run.lock();
        run.running = false;
        self.wake.notify_all();
    }

    fn frame_stats(&self) -> FrameStats {
        self.pacer.lock().stats().clone()
    }
}

type Functors = Arc<RwLock<Vec<Arc<CompositingFunctor>>>>;

/// Turns scene notifications into compositing requests
struct SceneScheduler {
    functors: Functors,
}

impl SceneObserver for SceneScheduler {
    fn scene_changed(&self) {
        for functor in self.functors.read().iter() {
            functor.schedule_compositing(1);
        }
    }

    fn frame_posted(&self, frames: usize, damage: &Rectangle) {
        for functor in self.functors.read().iter() {
            functor.schedule_compositing_damage(frames, damage);
        }
    }
}

pub struct MultiThreadedCompositor {
    display: Arc<dyn Display>,
    scene: Arc<dyn Scene>,
    listener: Arc<dyn DisplayListener>,
    settings: CompositorSettings,
    state: AtomicU8,
    compose_on_start: AtomicBool,
    functors: Functors,
    threads: Mutex<Vec<JoinHandle<()>>>,
    observer: Arc<dyn SceneObserver>,
    stats: Arc<CompositorStats>,
    next_consumer: AtomicU64,
}

impl MultiThreadedCompositor {
    pub fn new(
        display: Arc<dyn Display>,
        scene: Arc<dyn Scene>,
        listener: Arc<dyn DisplayListener>,
        settings: CompositorSettings,
    ) -> Self {
        let functors: Functors = Arc::new(RwLock::new(Vec::new()));
        let observer = Arc::new(SceneScheduler {
            functors: Arc::clone(&functors),
        });

        Self {
            display,
            scene,
            listener,
            compose_on_start: AtomicBool::new(settings.compose_on_start),
            settings,
            state: AtomicU8::new(STOPPED),
            functors,
            threads: Mutex::new(Vec::new()),
            observer,
            stats: Arc::new(CompositorStats::default()),
            next_consumer: AtomicU64::new(1),
        }
    }

    /// Spawns one compositing thread per sync group. Starting a started
    /// compositor does nothing.
    pub fn start(&self) -> Result<(), CompositorError> {
        if self
            .state
            .compare_exchange(STOPPED, STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("🎬 Compositor already started");
            return Ok(());
        }

        info!("🎬 Starting compositor");
        if let Err(e) = self.create_threads() {
            error!("❌ Compositor failed to start: {}", e);
            self.destroy_threads();
            self.state.store(STOPPED, Ordering::SeqCst);
            return Err(e);
        }

        self.scene.add_observer(Arc::clone(&self.observer));
        if self.compose_on_start.load(Ordering::SeqCst) {
            self.schedule_compositing(1);
        }

        self.state.store(STARTED, Ordering::SeqCst);
        info!(
            "✅ Compositor started with {} threads",
            self.functors.read().len()
        );
        Ok(())
    }

    /// Joins every compositing thread. Stopping a stopped compositor does
    /// nothing.
    pub fn stop(&self) {
        if self
            .state
            .compare_exchange(STARTED, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("🛑 Stopping compositor");
        self.scene.remove_observer(&self.observer);
        self.destroy_threads();

        // Whatever is on screen after a restart is stale
        self.compose_on_start.store(true, Ordering::SeqCst);
        self.state.store(STOPPED, Ordering::SeqCst);
        info!("✅ Compositor stopped");
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STARTED
    }

    /// Asks every thread for at least `frames` passes
    pub fn schedule_compositing(&self, frames: usize) {
        for functor in self.functors.read().iter() {
            functor.schedule_compositing(frames);
        }
    }

    /// Asks for `frames` passes on the threads whose outputs show `damage`
    pub fn schedule_compositing_damage(&self, frames: usize, damage: &Rectangle) {
        for functor in self.functors.read().iter() {
            functor.schedule_compositing_damage(frames, damage);
        }
    }

    /// Parks every thread without touching any stream
    pub fn pause(&self) {
        debug!("⏸️ Pausing compositor");
        for functor in self.functors.read().iter() {
            functor.pause();
        }
    }

    pub fn resume(&self) {
        debug!("▶️ Resuming compositor");
        for functor in self.functors.read().iter() {
            functor.resume();
        }
    }

    pub fn stats(&self) -> &CompositorStats {
        &self.stats
    }

    /// Timing statistics, one entry per running thread
    pub fn frame_stats(&self) -> Vec<FrameStats> {
        self.functors
            .read()
            .iter()
            .map(|functor| functor.frame_stats())
            .collect()
    }

    pub fn thread_count(&self) -> usize {
        self.functors.read().len()
    }

    fn create_threads(&self) -> Result<(), CompositorError> {
        let mut started = Vec::new();

        for (index, group) in self.display.sync_groups().into_iter().enumerate() {
            let outputs = group
                .display_buffers()
                .into_iter()
                .map(|buffer| Output {
                    buffer,
                    consumer: ConsumerId(self.next_consumer.fetch_add(1, Ordering::Relaxed)),
                })
                .collect();

            let functor = Arc::new(CompositingFunctor::new(
                index,
                group,
                outputs,
                Arc::clone(&self.scene),
                Arc::clone(&self.listener),
                self.settings.clone(),
                Arc::clone(&self.stats),
            ));

            let (tx, rx) = crossbeam_channel::bounded(1);
            let runner = Arc::clone(&functor);
            let handle = thread::Builder::new()
                .name(THREAD_NAME.to_string())
                .spawn(move || runner.run(tx))?;

            self.functors.write().push(functor);
            self.threads.lock().push(handle);
            started.push((index, rx));
        }

        for (group, rx) in started {
            rx.recv_timeout(self.settings.start_timeout)
                .map_err(|e| CompositorError::ThreadStartFailed {
                    group,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn destroy_threads(&self) {
        let functors: Vec<_> = self.functors.write().drain(..).collect();
        for functor in &functors {
            functor.stop();
        }

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("❌ A compositing thread panicked");
            }
        }
    }
}

impl Drop for MultiThreadedCompositor {
    fn drop(&mut self) {
        self.stop();
    }
}
