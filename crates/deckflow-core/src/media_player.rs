//! The fixed-rate render loop. It owns every pixel write to the device.
//!
//! Work reaches the loop through three buckets: generic page tasks, one pending native image
//! per key, and one pending touchscreen write. Every entry carries the page generation it was
//! queued under; the controller drops entries whose generation is no longer current.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::controller::DeckController;
use crate::device::NativeImage;
use crate::identifier::InputIdentifier;

pub type RenderTask = Box<dyn FnOnce(&std::sync::Arc<DeckController>) -> anyhow::Result<()> + Send>;

pub struct QueuedTask {
    pub generation: u64,
    pub label: String,
    pub task: RenderTask,
}

pub struct ImageTask {
    pub generation: u64,
    pub image: NativeImage,
}

pub struct TouchscreenTask {
    pub generation: u64,
    pub x: u32,
    pub y: u32,
    pub image: NativeImage,
}

#[derive(Default)]
struct Queues {
    tasks: Vec<QueuedTask>,
    images: BTreeMap<u8, ImageTask>,
    touchscreen: Option<TouchscreenTask>,
    dirty: BTreeSet<InputIdentifier>,
}

/// Rolling frame-rate window. The warning flips when the median crosses 80% of target.
struct FpsMonitor {
    samples: VecDeque<f32>,
    low: bool,
}

impl FpsMonitor {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            low: false,
        }
    }

    /// Record one frame. Returns `Some(low)` when the warning state changed.
    fn record(&mut self, fps: f32, target: u32) -> Option<(bool, f32)> {
        let window = (target.max(1) * 2) as usize;
        self.samples.push_back(fps);
        while self.samples.len() > window {
            self.samples.pop_front();
        }
        if self.samples.len() < window {
            return None;
        }
        let median = median(&self.samples);
        let low = median < target as f32 * 0.8;
        if low == self.low {
            return None;
        }
        self.low = low;
        Some((low, median))
    }
}

fn median(samples: &VecDeque<f32>) -> f32 {
    let mut sorted: Vec<f32> = samples.iter().copied().collect();
    sorted.sort_by(f32::total_cmp);
    sorted.get(sorted.len() / 2).copied().unwrap_or(0.0)
}

pub struct MediaPlayer {
    queues: Mutex<Queues>,
    tick: Mutex<u64>,
    ticked: Condvar,
    running: AtomicBool,
    paused: AtomicBool,
    fps: Mutex<FpsMonitor>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

impl Default for MediaPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaPlayer {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            tick: Mutex::new(0),
            ticked: Condvar::new(),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            fps: Mutex::new(FpsMonitor::new()),
            handle: Mutex::new(None),
            thread_id: Mutex::new(None),
        }
    }

    /// Spawn the loop thread. It exits on `stop()` or once the controller is dropped.
    pub fn start(&self, controller: Weak<DeckController>, name: &str, fps: u32) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let spawned = std::thread::Builder::new()
            .name(format!("{name}-render"))
            .spawn(move || run(controller, fps));
        match spawned {
            Ok(handle) => {
                *self.thread_id.lock() = Some(handle.thread().id());
                *self.handle.lock() = Some(handle);
            }
            Err(error) => {
                log::error!("Failed to spawn render thread: {error}");
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stop the loop and wait for it to exit. From the loop thread itself this only sets the
    /// flag; the loop returns after the current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.ticked.notify_all();
        if self.on_loop_thread() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn on_loop_thread(&self) -> bool {
        *self.thread_id.lock() == Some(std::thread::current().id())
    }

    pub fn current_tick(&self) -> u64 {
        *self.tick.lock()
    }

    pub(crate) fn finish_tick(&self) {
        *self.tick.lock() += 1;
        self.ticked.notify_all();
    }

    /// Block until the loop completes its next tick. Returns at once when the loop is not
    /// running or when called from the loop itself.
    pub fn wait_for_next_tick(&self, timeout: Duration) {
        if !self.is_running() || self.on_loop_thread() {
            return;
        }
        let deadline = Instant::now() + timeout;
        let mut tick = self.tick.lock();
        let start = *tick;
        while *tick == start && self.is_running() {
            if self.ticked.wait_until(&mut tick, deadline).timed_out() {
                log::debug!("Render loop did not tick within {timeout:?}");
                return;
            }
        }
    }

    pub fn add_task(
        &self,
        generation: u64,
        label: impl Into<String>,
        task: impl FnOnce(&std::sync::Arc<DeckController>) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.queues.lock().tasks.push(QueuedTask {
            generation,
            label: label.into(),
            task: Box::new(task),
        });
    }

    /// Queue a native image for `key`, replacing any write still pending for it.
    pub fn add_image_task(&self, key: u8, generation: u64, image: NativeImage) {
        self.queues
            .lock()
            .images
            .insert(key, ImageTask { generation, image });
    }

    /// Queue a touchscreen write, replacing any write still pending.
    pub fn add_touchscreen_task(&self, generation: u64, x: u32, y: u32, image: NativeImage) {
        self.queues.lock().touchscreen = Some(TouchscreenTask {
            generation,
            x,
            y,
            image,
        });
    }

    pub fn mark_dirty(&self, identifier: InputIdentifier) {
        self.queues.lock().dirty.insert(identifier);
    }

    /// Drop every queued task and write. Dirty inputs stay dirty.
    pub fn cancel_pending(&self) {
        let mut queues = self.queues.lock();
        queues.tasks.clear();
        queues.images.clear();
        queues.touchscreen = None;
    }

    pub fn pending_tasks(&self) -> usize {
        self.queues.lock().tasks.len()
    }

    pub(crate) fn take_tasks(&self) -> Vec<QueuedTask> {
        std::mem::take(&mut self.queues.lock().tasks)
    }

    pub(crate) fn take_dirty(&self) -> BTreeSet<InputIdentifier> {
        std::mem::take(&mut self.queues.lock().dirty)
    }

    pub(crate) fn take_image_tasks(&self) -> BTreeMap<u8, ImageTask> {
        std::mem::take(&mut self.queues.lock().images)
    }

    pub(crate) fn take_touchscreen_task(&self) -> Option<TouchscreenTask> {
        self.queues.lock().touchscreen.take()
    }

    /// Feed one frame time into the FPS window.
    pub(crate) fn record_frame(&self, elapsed: Duration, target: u32) -> Option<(bool, f32)> {
        let fps = 1.0 / elapsed.as_secs_f32().max(f32::EPSILON);
        self.fps.lock().record(fps, target)
    }
}

fn run(controller: Weak<DeckController>, fps: u32) {
    let interval = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
    let mut last = Instant::now();
    loop {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        let player = controller.media_player();
        if !player.is_running() {
            break;
        }
        let started = Instant::now();
        if !player.is_paused() {
            controller.render_tick();
        }
        controller.record_frame(last.elapsed(), fps);
        last = Instant::now();
        drop(controller);

        let spent = started.elapsed();
        if let Some(rest) = interval.checked_sub(spent) {
            std::thread::sleep(rest);
        }
    }
    log::debug!("Render loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(value: u8) -> NativeImage {
        NativeImage {
            width: 1,
            height: 1,
            data: vec![value; 4],
        }
    }

    #[test]
    fn image_tasks_are_last_write_wins_per_key() {
        let player = MediaPlayer::new();
        player.add_image_task(3, 1, native(1));
        player.add_image_task(3, 1, native(2));
        player.add_image_task(4, 1, native(3));
        let tasks = player.take_image_tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[&3].image, native(2));
        assert!(player.take_image_tasks().is_empty());

        player.add_touchscreen_task(1, 0, 0, native(1));
        player.add_touchscreen_task(1, 200, 0, native(2));
        let touch = player.take_touchscreen_task().unwrap();
        assert_eq!(touch.x, 200);
        assert!(player.take_touchscreen_task().is_none());
    }

    #[test]
    fn cancel_pending_drops_queued_work() {
        let player = MediaPlayer::new();
        player.add_task(1, "noop", |_| Ok(()));
        player.add_image_task(0, 1, native(0));
        player.mark_dirty(InputIdentifier::Dial(0));
        player.cancel_pending();
        assert_eq!(player.pending_tasks(), 0);
        assert!(player.take_image_tasks().is_empty());
        assert_eq!(player.take_dirty().len(), 1);
    }

    #[test]
    fn low_fps_toggles_on_median() {
        let mut monitor = FpsMonitor::new();
        for _ in 0..59 {
            assert_eq!(monitor.record(30.0, 30), None);
        }
        assert_eq!(monitor.record(30.0, 30), None);
        let mut flipped = None;
        for _ in 0..60 {
            if let Some(change) = monitor.record(10.0, 30) {
                flipped = Some(change);
            }
        }
        assert_eq!(flipped.map(|(low, _)| low), Some(true));
        for _ in 0..60 {
            monitor.record(30.0, 30);
        }
        assert!(!monitor.low);
    }

    #[test]
    fn waiting_without_a_loop_returns_immediately() {
        let player = MediaPlayer::new();
        let started = Instant::now();
        player.wait_for_next_tick(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));
        player.finish_tick();
        assert_eq!(player.current_tick(), 1);
    }
}
