//! Composition timing
//!
//! Each compositing thread owns a [`FramePacer`] and wraps every composite
//! pass in `begin_frame`/`end_frame`. The pacer keeps a rolling window of pass
//! durations and counts passes that blew the frame budget.
//!
//! # Usage
//!
//! ```no_run
//! use mir_compositor::compositor::FramePacer;
//!
//! let mut pacer = FramePacer::new(60);
//!
//! pacer.begin_frame();
//! // composite and post
//! pacer.end_frame();
//!
//! println!("{:.1} fps", pacer.stats().current_fps);
//! ```

use log::{debug, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of passes kept for statistics
const FRAME_HISTORY_SIZE: usize = 120;

/// A pass this much over budget counts as missed
const MISSED_FRAME_THRESHOLD: f32 = 1.5;

#[derive(Debug, Clone, PartialEq)]
pub struct FrameStats {
    pub avg_frame_time: Duration,
    pub min_frame_time: Duration,
    pub max_frame_time: Duration,
    /// Standard deviation of pass durations
    pub frame_time_jitter: Duration,
    pub current_fps: f32,
    pub missed_frames: u64,
    pub total_frames: u64,
    /// Percentage of passes over budget
    pub miss_rate: f32,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            avg_frame_time: Duration::ZERO,
            min_frame_time: Duration::ZERO,
            max_frame_time: Duration::ZERO,
            frame_time_jitter: Duration::ZERO,
            current_fps: 0.0,
            missed_frames: 0,
            total_frames: 0,
            miss_rate: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct FramePacer {
    budget: Duration,
    history: VecDeque<Duration>,
    frame_start: Option<Instant>,
    /// Interval between consecutive pass starts, for fps
    intervals: VecDeque<Duration>,
    last_start: Option<Instant>,
    stats: FrameStats,
}

impl FramePacer {
    pub fn new(target_fps: u32) -> Self {
        let budget = Duration::from_secs_f64(1.0 / target_fps.max(1) as f64);
        debug!("🎬 Frame pacer budget {:?} ({} fps)", budget, target_fps);

        Self {
            budget,
            history: VecDeque::with_capacity(FRAME_HISTORY_SIZE),
            frame_start: None,
            intervals: VecDeque::with_capacity(FRAME_HISTORY_SIZE),
            last_start: None,
            stats: FrameStats::default(),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn begin_frame(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_start {
            push_bounded(&mut self.intervals, now.duration_since(last));
        }
        self.last_start = Some(now);
        self.frame_start = Some(now);
    }

    pub fn end_frame(&mut self) {
        let Some(start) = self.frame_start.take() else {
            warn!("end_frame called without begin_frame");
            return;
        };
        self.record(start.elapsed());
    }

    /// Records a pass that took `duration`
    pub fn record(&mut self, duration: Duration) {
        let missed = duration.as_secs_f32() > self.budget.as_secs_f32() * MISSED_FRAME_THRESHOLD;
        if missed {
            self.stats.missed_frames += 1;
            debug!("⚠️ Composite pass took {:?} (budget {:?})", duration, self.budget);
        }

        push_bounded(&mut self.history, duration);
        self.stats.total_frames += 1;
        self.update_stats();
    }

    fn update_stats(&mut self) {
        if self.history.is_empty() {
            return;
        }

        let count = self.history.len() as u32;
        let total: Duration = self.history.iter().sum();
        self.stats.avg_frame_time = total / count;
        self.stats.min_frame_time = self.history.iter().min().copied().unwrap_or_default();
        self.stats.max_frame_time = self.history.iter().max().copied().unwrap_or_default();

        let avg = self.stats.avg_frame_time.as_secs_f64();
        let variance = self
            .history
            .iter()
            .map(|d| {
                let diff = d.as_secs_f64() - avg;
                diff * diff
            })
            .sum::<f64>()
            / count as f64;
        self.stats.frame_time_jitter = Duration::from_secs_f64(variance.sqrt());

        if !self.intervals.is_empty() {
            let interval: Duration = self.intervals.iter().sum::<Duration>() / self.intervals.len() as u32;
            if interval > Duration::ZERO {
                self.stats.current_fps = 1.0 / interval.as_secs_f32();
            }
        }

        self.stats.miss_rate =
            (self.stats.missed_frames as f32 / self.stats.total_frames as f32) * 100.0;
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = FrameStats::default();
        self.history.clear();
        self.intervals.clear();
        self.last_start = None;
    }
}

fn push_bounded(history: &mut VecDeque<Duration>, value: Duration) {
    history.push_back(value);
    if history.len() > FRAME_HISTORY_SIZE {
        history.pop_front();
    }
}
