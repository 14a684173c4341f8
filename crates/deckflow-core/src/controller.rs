//! One controller per connected deck.
//!
//! The controller owns the device handle, the active page, the inputs and the background, and
//! runs the render loop, the tick loop, a timer thread, a worker pool and the event reader.
//! Only the render loop writes pixels, with `clear` as the one synchronous exception.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use image::RgbaImage;
use parking_lot::{Mutex, RwLock};

use crate::background::{Background, TileGrid};
use crate::context::DeckContext;
use crate::device::{Deck, DeckEvent, DeviceError, NativeImage};
use crate::identifier::{DEFAULT_TOUCHSCREEN, InputIdentifier, InputKind};
use crate::inputs::{ControllerInput, InputSet, dial, touchscreen};
use crate::media_player::MediaPlayer;
use crate::page::Page;
use crate::render;
use crate::render::fonts::FontResolver;
use crate::scheduler::Scheduler;
use crate::screensaver::ScreenSaver;
use crate::store::{AppSettings, DeckSettings};
use crate::tick::TickThread;
use crate::ui::{UiEvent, UiSender};
use crate::workers::WorkerPool;

/// Upper bound on how long `load_page` waits for an in-flight frame.
const PAGE_SWAP_WAIT: Duration = Duration::from_millis(500);
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct DeckController {
    deck: Arc<dyn Deck>,
    serial: String,
    context: DeckContext,
    deck_settings: RwLock<DeckSettings>,
    active_page: ArcSwapOption<Page>,
    page_generation: AtomicU64,
    inputs: ArcSwap<InputSet>,
    background: Background,
    brightness: AtomicU8,
    rotation: AtomicU16,
    allow_interaction: AtomicBool,
    media_player: MediaPlayer,
    tick: TickThread,
    screensaver: ScreenSaver,
    scheduler: Scheduler,
    workers: WorkerPool,
    fonts: FontResolver,
    device_failed: AtomicBool,
    closed: AtomicBool,
    reader_running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DeckController {
    /// Build a controller and start its render, tick and event loops.
    pub fn new(deck: Arc<dyn Deck>, context: DeckContext, deck_settings: DeckSettings) -> Arc<Self> {
        let controller = Self::headless(deck, context, deck_settings);
        controller.start();
        controller
    }

    /// Build a controller without starting its loops. Rendering then happens only through
    /// explicit `render_tick` calls.
    pub fn headless(deck: Arc<dyn Deck>, context: DeckContext, deck_settings: DeckSettings) -> Arc<Self> {
        let serial = deck.serial_number().to_owned();
        let settings = context.settings.clone();
        let (rows, columns) = deck.key_layout();
        let (tile_width, tile_height) = deck.key_image_size();
        let grid = TileGrid {
            rows,
            columns,
            tile_width,
            tile_height,
        };
        log::info!(
            "Opening {} ({serial}): {rows}x{columns} keys, {} dials, touchscreen {:?}",
            deck.product_name(),
            deck.dial_count(),
            deck.touchscreen_size()
        );

        let controller = Arc::new(Self {
            inputs: ArcSwap::from_pointee(InputSet::for_deck(deck.as_ref(), &settings.default_font_family)),
            background: Background::new(grid),
            brightness: AtomicU8::new(deck_settings.brightness.min(100)),
            rotation: AtomicU16::new(deck_settings.normalized_rotation()),
            allow_interaction: AtomicBool::new(true),
            media_player: MediaPlayer::new(),
            tick: TickThread::new(),
            screensaver: ScreenSaver::default(),
            scheduler: Scheduler::new(&serial),
            workers: WorkerPool::new(&serial, settings.worker_threads),
            fonts: FontResolver::new(&settings.font_dirs, &settings.default_font_family),
            device_failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reader_running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            active_page: ArcSwapOption::empty(),
            page_generation: AtomicU64::new(0),
            deck_settings: RwLock::new(deck_settings),
            serial,
            context,
            deck,
        });
        controller.apply_background(None);
        controller.set_brightness(controller.brightness());
        let screensaver = controller.deck_settings.read().screensaver.clone();
        controller.screensaver.configure(&controller, screensaver);
        controller
    }

    fn start(self: &Arc<Self>) {
        let settings = self.settings();
        self.media_player
            .start(Arc::downgrade(self), &self.serial, settings.render_fps);
        self.tick.start(
            Arc::downgrade(self),
            &self.serial,
            Duration::from_millis(settings.tick_interval_ms.max(1)),
        );
        self.start_reader();
    }

    fn start_reader(self: &Arc<Self>) {
        self.reader_running.store(true, Ordering::SeqCst);
        let running = self.reader_running.clone();
        let deck = self.deck.clone();
        let weak: Weak<Self> = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-events", self.serial))
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match deck.read_events(READ_TIMEOUT) {
                        Ok(events) => {
                            let Some(controller) = weak.upgrade() else {
                                break;
                            };
                            for event in events {
                                controller.handle_device_event(event);
                            }
                        }
                        Err(DeviceError::Closed) => break,
                        Err(error) => {
                            log::warn!("Reading events from {} failed: {error}", deck.serial_number());
                            std::thread::sleep(READ_TIMEOUT);
                        }
                    }
                }
                log::debug!("Event reader for {} exited", deck.serial_number());
            });
        match spawned {
            Ok(handle) => *self.reader.lock() = Some(handle),
            Err(error) => log::error!("Failed to spawn event reader: {error}"),
        }
    }

    pub fn deck(&self) -> &dyn Deck {
        self.deck.as_ref()
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn context(&self) -> &DeckContext {
        &self.context
    }

    pub fn settings(&self) -> &AppSettings {
        &self.context.settings
    }

    pub fn deck_settings(&self) -> DeckSettings {
        self.deck_settings.read().clone()
    }

    pub fn ui(&self) -> &UiSender {
        &self.context.ui
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn fonts(&self) -> &FontResolver {
        &self.fonts
    }

    pub fn background(&self) -> &Background {
        &self.background
    }

    pub fn screensaver(&self) -> &ScreenSaver {
        &self.screensaver
    }

    pub fn media_player(&self) -> &MediaPlayer {
        &self.media_player
    }

    pub fn active_page(&self) -> Option<Arc<Page>> {
        self.active_page.load_full()
    }

    pub fn page_generation(&self) -> u64 {
        self.page_generation.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Arc<InputSet> {
        self.inputs.load_full()
    }

    /// Replace the live input set and return the previous one.
    pub fn swap_inputs(&self, inputs: Arc<InputSet>) -> Arc<InputSet> {
        self.inputs.swap(inputs)
    }

    pub fn get_input(&self, identifier: &InputIdentifier) -> Option<Arc<ControllerInput>> {
        self.inputs.load().get(identifier)
    }

    pub fn brightness(&self) -> u8 {
        self.brightness.load(Ordering::SeqCst)
    }

    pub fn rotation(&self) -> u16 {
        self.rotation.load(Ordering::SeqCst)
    }

    pub fn set_rotation(&self, degrees: u16) {
        let rotation = match degrees % 360 {
            r @ (0 | 90 | 180 | 270) => r,
            _ => 0,
        };
        self.rotation.store(rotation, Ordering::SeqCst);
        self.deck_settings.write().rotation = rotation;
        self.mark_all_dirty();
    }

    pub fn allow_interaction(&self) -> bool {
        self.allow_interaction.load(Ordering::SeqCst)
    }

    pub fn set_allow_interaction(&self, allow: bool) {
        self.allow_interaction.store(allow, Ordering::SeqCst);
    }

    pub fn is_device_failed(&self) -> bool {
        self.device_failed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Size of the image an input renders at.
    pub fn input_image_size(&self, identifier: &InputIdentifier) -> (u32, u32) {
        match identifier {
            InputIdentifier::Key { .. } => self.deck.key_image_size(),
            InputIdentifier::Dial(index) => dial::segment(self.deck(), *index)
                .map(|(_, width, height)| (width, height))
                .unwrap_or((1, 1)),
            InputIdentifier::Touchscreen(_) => self.deck.touchscreen_size().unwrap_or((1, 1)),
        }
    }

    /// Directories relative media paths are resolved against, most specific first.
    pub fn media_base_dirs(&self) -> Vec<PathBuf> {
        let paths = &self.context.paths;
        let mut dirs = Vec::new();
        if let Some(dir) = self
            .active_page()
            .and_then(|page| page.path().and_then(|p| p.parent()).map(|p| p.to_path_buf()))
        {
            dirs.push(dir);
        }
        dirs.push(paths.pages_dir());
        dirs.push(paths.data_dir.clone());
        dirs
    }

    pub fn videos_dir(&self) -> Option<PathBuf> {
        self.settings()
            .video_disk_cache
            .then(|| self.context.paths.video_cache_dir())
    }

    pub fn mark_dirty(&self, identifier: &InputIdentifier) {
        self.media_player.mark_dirty(identifier.clone());
    }

    pub fn mark_all_dirty(&self) {
        for identifier in self.inputs.load().identifiers() {
            self.media_player.mark_dirty(identifier.clone());
        }
    }

    fn mark_keys_dirty(&self) {
        for identifier in self.inputs.load().identifiers() {
            if identifier.kind() == InputKind::Key {
                self.media_player.mark_dirty(identifier.clone());
            }
        }
    }

    /// Clamp to 0..=100 and write it to the device.
    pub fn set_brightness(&self, value: u8) {
        let value = value.min(100);
        match self.deck.set_brightness(value) {
            Ok(()) => {}
            Err(DeviceError::Closed) => {}
            Err(error) => log::warn!("Failed to set brightness on {}: {error}", self.serial),
        }
        self.brightness.store(value, Ordering::SeqCst);
    }

    /// Replace the deck settings and apply them.
    pub fn update_deck_settings(self: &Arc<Self>, settings: DeckSettings) {
        self.rotation
            .store(settings.normalized_rotation(), Ordering::SeqCst);
        *self.deck_settings.write() = settings;
        let page = self.active_page();
        self.apply_background(page.as_deref());
        self.apply_brightness(page.as_deref());
        self.apply_screensaver(page.as_deref());
        self.mark_all_dirty();
    }

    /// Load the deck background, honouring a page override.
    pub fn apply_background(&self, page: Option<&Page>) {
        let settings = page
            .and_then(Page::background_override)
            .unwrap_or_else(|| self.deck_settings.read().background.clone());
        self.background.load(
            &settings,
            &self.media_base_dirs(),
            self.videos_dir().as_deref(),
        );
        self.mark_keys_dirty();
    }

    fn apply_brightness(&self, page: Option<&Page>) {
        let brightness = page
            .and_then(Page::brightness_override)
            .unwrap_or_else(|| self.deck_settings.read().brightness);
        self.set_brightness(brightness);
    }

    fn apply_screensaver(self: &Arc<Self>, page: Option<&Page>) {
        let settings = page
            .and_then(Page::screensaver_override)
            .unwrap_or_else(|| self.deck_settings.read().screensaver.clone());
        self.screensaver.configure(self, settings);
    }

    /// Make `page` the active page. The work is queued on the render loop; this returns
    /// immediately. `None` clears the deck instead.
    pub fn load_page(self: &Arc<Self>, page: Option<Arc<Page>>) {
        let generation = self.page_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.media_player.cancel_pending();

        let Some(page) = page else {
            log::info!("Unloading page on {} (generation {generation})", self.serial);
            self.active_page.store(None);
            self.media_player.wait_for_next_tick(PAGE_SWAP_WAIT);
            let fresh = InputSet::for_deck(self.deck(), &self.settings().default_font_family);
            self.swap_inputs(Arc::new(fresh)).close();
            self.clear();
            return;
        };

        log::info!(
            "Loading page {} on {} (generation {generation})",
            page.name(),
            self.serial
        );
        page.set_ready_to_clear(false);
        self.active_page.store(Some(page.clone()));
        self.media_player.wait_for_next_tick(PAGE_SWAP_WAIT);
        page.load_action_objects(self.context.actions.as_ref());

        let task_page = page.clone();
        self.media_player
            .add_task(generation, "background", move |controller| {
                controller.apply_background(Some(task_page.as_ref()));
                Ok(())
            });
        let task_page = page.clone();
        self.media_player
            .add_task(generation, "brightness", move |controller| {
                controller.apply_brightness(Some(task_page.as_ref()));
                Ok(())
            });
        let task_page = page.clone();
        self.media_player
            .add_task(generation, "screensaver", move |controller| {
                controller.apply_screensaver(Some(task_page.as_ref()));
                Ok(())
            });
        for input in self.inputs().iter() {
            let input = input.clone();
            let task_page = page.clone();
            let label = format!("load {}", input.identifier());
            self.media_player.add_task(generation, label, move |controller| {
                input.load_from_page(controller, &task_page);
                Ok(())
            });
        }
        self.media_player.add_task(generation, "refresh", move |controller| {
            controller.mark_all_dirty();
            for input in controller.inputs().iter() {
                input.on_ready(controller);
            }
            page.set_ready_to_clear(true);
            Ok(())
        });
    }

    /// Re-apply the active page to one input after its config changed.
    pub fn reload_input(self: &Arc<Self>, identifier: &InputIdentifier) {
        let (Some(page), Some(input)) = (self.active_page(), self.get_input(identifier)) else {
            return;
        };
        let generation = self.page_generation();
        self.media_player
            .add_task(generation, format!("reload {identifier}"), move |controller| {
                input.load_from_page(controller, &page);
                input.update(controller);
                input.on_update(controller);
                Ok(())
            });
    }

    /// Store new settings for one action on the active page. When its state is showing, the
    /// input's actions get `on_update`.
    pub fn set_action_settings(
        self: &Arc<Self>,
        identifier: &InputIdentifier,
        state: u16,
        index: usize,
        settings: serde_json::Value,
    ) {
        let Some(page) = self.active_page() else {
            return;
        };
        page.set_settings_for_action(identifier, state, index, settings);
        if let Some(input) = self.get_input(identifier)
            && input.active_state() == state
        {
            input.on_update(self);
        }
    }

    /// Write a transparent frame to every key and the touchscreen, synchronously.
    pub fn clear(&self) {
        let (width, height) = self.deck.key_image_size();
        for key in 0..self.deck.key_count() {
            let blank = RgbaImage::new(width, height);
            match self.deck.convert_key_image(blank) {
                Ok(native) => {
                    self.set_key_image(key, &native);
                }
                Err(error) => self.handle_write_error(error),
            }
        }
        if let Some((width, height)) = self.deck.touchscreen_size() {
            match self.deck.convert_touchscreen_image(RgbaImage::new(width, height)) {
                Ok(native) => {
                    self.set_touchscreen_image(0, 0, &native);
                }
                Err(error) => self.handle_write_error(error),
            }
        }
    }

    /// Route a raw device event to its input.
    pub fn handle_device_event(self: &Arc<Self>, event: DeckEvent) {
        let identifier = match event {
            DeckEvent::KeyDown(key) | DeckEvent::KeyUp(key) => {
                InputIdentifier::key_from_index(key, self.deck.key_layout().1)
            }
            DeckEvent::DialDown(dial) | DeckEvent::DialUp(dial) | DeckEvent::DialTurn(dial, _) => {
                InputIdentifier::Dial(dial)
            }
            DeckEvent::TouchShort { .. } | DeckEvent::TouchLong { .. } | DeckEvent::TouchDrag { .. } => {
                InputIdentifier::Touchscreen(DEFAULT_TOUCHSCREEN.to_owned())
            }
        };
        self.event_callback(&identifier, event);
    }

    pub fn event_callback(self: &Arc<Self>, identifier: &InputIdentifier, event: DeckEvent) {
        if !self.allow_interaction() {
            log::debug!("Ignoring {event:?} on {identifier}: interaction disabled");
            return;
        }
        if self.screensaver.on_key_change(self) {
            return;
        }
        match self.get_input(identifier) {
            Some(input) => input.event_callback(self, event),
            None => log::debug!("No input {identifier} on {}", self.serial),
        }
    }

    pub(crate) fn record_frame(&self, elapsed: Duration, target: u32) {
        if !self.settings().low_fps_warning {
            return;
        }
        if let Some((low, fps)) = self.media_player.record_frame(elapsed, target) {
            if low {
                log::warn!("Render loop on {} is slow: {fps:.1} fps", self.serial);
            } else {
                log::info!("Render loop on {} recovered: {fps:.1} fps", self.serial);
            }
            self.ui().emit(UiEvent::LowFps {
                serial: self.serial.clone(),
                low,
                fps,
            });
        }
    }

    /// One render-loop iteration: advance videos, run current tasks, compose dirty inputs
    /// and flush pending writes.
    pub fn render_tick(self: &Arc<Self>) {
        if self.is_device_failed() {
            return;
        }
        let tick = self.media_player.current_tick();
        let rate = self.settings().render_fps.max(1);

        if self.background.advance(tick, rate) {
            self.mark_keys_dirty();
        }
        for input in self.inputs().iter() {
            if input.get_active_state().advance_video(tick, rate) {
                self.mark_dirty(input.identifier());
            }
        }

        let generation = self.page_generation();
        for queued in self.media_player.take_tasks() {
            if queued.generation != generation {
                log::debug!("Dropping stale task '{}'", queued.label);
                continue;
            }
            let task = queued.task;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task(self)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => log::warn!("Render task '{}' failed: {error:#}", queued.label),
                Err(_) => log::error!("Render task '{}' panicked", queued.label),
            }
        }

        self.compose_dirty(generation);
        self.flush_writes(generation);
        self.media_player.finish_tick();
    }

    fn compose_dirty(&self, generation: u64) {
        let dirty = self.media_player.take_dirty();
        if dirty.is_empty() {
            return;
        }
        let inputs = self.inputs();
        let (_, columns) = self.deck.key_layout();
        let mut dials = BTreeSet::new();
        let mut whole_strip = false;

        for identifier in &dirty {
            match identifier {
                InputIdentifier::Key { .. } => {
                    let (Some(input), Some(index)) =
                        (inputs.get(identifier), identifier.key_index(columns))
                    else {
                        continue;
                    };
                    let image = render::rotate(self.compose_input(&input), self.rotation());
                    match self.deck.convert_key_image(image) {
                        Ok(native) => self.media_player.add_image_task(index, generation, native),
                        Err(error) => self.handle_write_error(error),
                    }
                }
                InputIdentifier::Dial(dial) => {
                    dials.insert(*dial);
                }
                InputIdentifier::Touchscreen(_) => whole_strip = true,
            }
        }

        if dials.is_empty() && !whole_strip {
            return;
        }
        let Some(strip) = inputs.get(&InputIdentifier::Touchscreen(DEFAULT_TOUCHSCREEN.to_owned()))
        else {
            return;
        };
        let rendered = match (whole_strip, dials.len()) {
            (false, 1) => dials.first().and_then(|dial| {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    touchscreen::render_segment(&strip, self, *dial)
                }))
                .unwrap_or_else(|_| {
                    log::error!("Composing dial {dial} on {} panicked", self.serial);
                    None
                })
            }),
            _ => Some((0, self.compose_input(&strip))),
        };
        if let Some((x, image)) = rendered {
            match self.deck.convert_touchscreen_image(image) {
                Ok(native) => self.media_player.add_touchscreen_task(generation, x, 0, native),
                Err(error) => self.handle_write_error(error),
            }
        }
    }

    /// Compose one input. A panic while composing yields a blank image carrying the warning dot.
    fn compose_input(&self, input: &ControllerInput) -> RgbaImage {
        let composed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            input.get_current_image(self)
        }));
        match composed {
            Ok(image) => image,
            Err(_) => {
                log::error!("Composing {} on {} panicked", input.identifier(), self.serial);
                let (width, height) = self.input_image_size(input.identifier());
                let mut image = RgbaImage::new(width, height);
                render::draw_warning_dot(&mut image);
                image
            }
        }
    }

    fn flush_writes(&self, generation: u64) {
        for (key, task) in self.media_player.take_image_tasks() {
            if task.generation != generation {
                log::debug!("Dropping stale image for key {key}");
                continue;
            }
            self.set_key_image(key, &task.image);
        }
        if let Some(task) = self.media_player.take_touchscreen_task() {
            if task.generation != generation {
                log::debug!("Dropping stale touchscreen image");
                return;
            }
            self.set_touchscreen_image(task.x, task.y, &task.image);
        }
    }

    /// Write a native image to a key. Returns whether the write went through.
    pub fn set_key_image(&self, key: u8, image: &NativeImage) -> bool {
        if self.is_device_failed() {
            return false;
        }
        match self.deck.write_key_image(key, image) {
            Ok(()) => {
                self.context.failures.record_success(&self.serial);
                true
            }
            Err(error) => {
                self.handle_write_error(error);
                false
            }
        }
    }

    pub fn set_touchscreen_image(&self, x: u32, y: u32, image: &NativeImage) -> bool {
        if self.is_device_failed() {
            return false;
        }
        match self.deck.write_touchscreen_image(x, y, image) {
            Ok(()) => {
                self.context.failures.record_success(&self.serial);
                true
            }
            Err(error) => {
                self.handle_write_error(error);
                false
            }
        }
    }

    fn handle_write_error(&self, error: DeviceError) {
        if matches!(error, DeviceError::Closed) {
            log::debug!("Skipping write to closed deck {}", self.serial);
            return;
        }
        if !error.is_transport() {
            log::warn!("Write to {} rejected: {error}", self.serial);
            return;
        }
        let count = self.context.failures.record_failure(&self.serial);
        log::warn!(
            "Write to {} failed ({count} consecutive): {error}",
            self.serial
        );
        if count < self.settings().max_consecutive_failures {
            return;
        }
        if self.settings().resume_mode {
            log::warn!("Resume mode is on; keeping {} open", self.serial);
            return;
        }
        self.fail_device();
    }

    /// Give up on the device: close it, stop the loops and ask the owner to reconnect.
    fn fail_device(&self) {
        if self.device_failed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!(
            "Deck {} failed {} times in a row; removing it",
            self.serial,
            self.settings().max_consecutive_failures
        );
        self.deck.close();
        self.media_player.stop();
        self.tick.stop();
        self.reader_running.store(false, Ordering::SeqCst);
        self.ui().emit(UiEvent::DeckRemoved {
            serial: self.serial.clone(),
        });
        self.context.lifecycle.remove_and_reconnect(&self.serial);
    }

    /// Stop every loop, release inputs and close the device. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Closing deck {}", self.serial);
        self.screensaver.cancel_timer();
        self.media_player.stop();
        self.tick.stop();
        self.reader_running.store(false, Ordering::SeqCst);
        if self.deck.is_open() && !self.is_device_failed() {
            self.clear();
        }
        self.deck.close();
        if let Some(handle) = self.reader.lock().take()
            && handle.thread().id() != std::thread::current().id()
        {
            let _ = handle.join();
        }
        self.inputs().close();
        self.background.clear();
        self.scheduler.shutdown();
        self.workers.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use crate::context::DeckLifecycle;
    use crate::device::{FakeDeck, FakeDeckLayout};
    use crate::inputs::LabelPosition;
    use crate::render::fonts::FontStyle;
    use crate::shared::Paths;

    #[derive(Default)]
    struct CountingLifecycle {
        removals: AtomicUsize,
    }

    impl DeckLifecycle for CountingLifecycle {
        fn remove_and_reconnect(&self, _serial: &str) {
            self.removals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn context(root: &std::path::Path) -> DeckContext {
        let settings = AppSettings {
            font_dirs: vec![root.join("no-fonts")],
            ..AppSettings::default()
        };
        DeckContext::new(settings, Paths::rooted(root))
    }

    fn controller(root: &std::path::Path, deck: Arc<FakeDeck>) -> Arc<DeckController> {
        DeckController::headless(deck, context(root), DeckSettings::default())
    }

    fn key0() -> InputIdentifier {
        InputIdentifier::Key { x: 0, y: 0 }
    }

    fn labelled_page() -> Arc<Page> {
        Arc::new(Page::from_json(
            "main",
            json!({ "keys": { "0,0": { "states": { "0": {
                "background": { "color": [10, 20, 30, 255] },
                "labels": { "bottom": { "text": "Hi" } }
            } } } } }),
        ))
    }

    #[test]
    fn renders_background_color_and_bottom_label() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("E2E", FakeDeckLayout::default()));
        let controller = controller(dir.path(), deck.clone());
        controller.load_page(Some(labelled_page()));
        controller.render_tick();

        let input = controller.get_input(&key0()).unwrap();
        let image = input.get_current_image(&controller);
        assert_eq!(image.dimensions(), controller.deck().key_image_size());
        let (width, height) = image.dimensions();

        for y in 0..height / 2 {
            for x in 0..width {
                assert_eq!(image.get_pixel(x, y).0, [10, 20, 30, 255], "pixel {x},{y}");
            }
        }
        let labelled = (height / 2..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .any(|(x, y)| image.get_pixel(x, y).0 != [10, 20, 30, 255]);
        assert!(labelled);

        assert_eq!(deck.key_image(0).unwrap(), image);
        assert!(controller.active_page().unwrap().is_ready_to_clear());
    }

    #[test]
    fn huge_label_font_size_still_renders() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("BIG", FakeDeckLayout::default()));
        let controller = controller(dir.path(), deck.clone());
        let page = Arc::new(Page::from_json(
            "big",
            json!({ "keys": { "0,0": { "states": { "0": {
                "labels": { "center": { "text": "a\nb", "font-size": 1e10 } }
            } } } } }),
        ));
        controller.load_page(Some(page));
        controller.render_tick();
        controller.render_tick();

        assert!(deck.key_image(0).is_some());
        assert!(controller.active_page().unwrap().is_ready_to_clear());
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("C", FakeDeckLayout::plus()));
        let controller = controller(dir.path(), deck.clone());
        controller.load_page(Some(labelled_page()));
        controller.render_tick();

        controller.clear();
        let once: Vec<_> = (0..8).map(|k| deck.key_native(k)).collect();
        let strip_once = deck.touchscreen_writes().last().cloned();
        controller.clear();
        let twice: Vec<_> = (0..8).map(|k| deck.key_native(k)).collect();
        assert_eq!(once, twice);
        assert_eq!(deck.touchscreen_writes().last().cloned(), strip_once);
        assert!(deck.key_image(0).unwrap().pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn clear_works_without_a_page() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("N", FakeDeckLayout::default()));
        let controller = controller(dir.path(), deck.clone());
        controller.clear();
        assert_eq!(deck.write_attempts(), 15);
    }

    #[test]
    fn tasks_from_a_replaced_page_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("S", FakeDeckLayout::default()));
        let controller = controller(dir.path(), deck.clone());
        controller.load_page(Some(labelled_page()));
        let stale = controller.page_generation();

        controller.load_page(Some(Arc::new(Page::from_json("other", json!({})))));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        controller.media_player().add_task(stale, "stale-task", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let red = NativeImage {
            width: 72,
            height: 72,
            data: [255, 0, 0, 255].repeat(72 * 72),
        };
        controller.media_player().add_image_task(0, stale, red.clone());
        controller.render_tick();

        assert!(!ran.load(Ordering::SeqCst));
        assert_ne!(deck.key_native(0), Some(red));
        assert_eq!(controller.active_page().unwrap().name(), "other");
    }

    #[test]
    fn repeated_write_failures_remove_the_deck_once() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("F", FakeDeckLayout::default()));
        let lifecycle = Arc::new(CountingLifecycle::default());
        let context = context(dir.path()).with_lifecycle(lifecycle.clone());
        let mut events = context.ui.subscribe();
        let controller = DeckController::headless(deck.clone(), context, DeckSettings::default());

        deck.set_fail_writes(true);
        controller.load_page(Some(labelled_page()));
        controller.render_tick();
        controller.render_tick();
        controller.clear();

        assert_eq!(lifecycle.removals.load(Ordering::SeqCst), 1);
        assert_eq!(deck.write_attempts(), 5);
        assert!(controller.is_device_failed());
        assert!(!deck.is_open());
        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            removed |= matches!(event, UiEvent::DeckRemoved { .. });
        }
        assert!(removed);
    }

    #[test]
    fn resume_mode_keeps_a_failing_deck() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("R", FakeDeckLayout::default()));
        let lifecycle = Arc::new(CountingLifecycle::default());
        let settings = AppSettings {
            resume_mode: true,
            ..AppSettings::default()
        };
        let context = DeckContext::new(settings, Paths::rooted(dir.path())).with_lifecycle(lifecycle.clone());
        let controller = DeckController::headless(deck.clone(), context, DeckSettings::default());

        deck.set_fail_writes(true);
        controller.clear();
        assert_eq!(deck.write_attempts(), 15);
        assert_eq!(lifecycle.removals.load(Ordering::SeqCst), 0);
        assert!(!controller.is_device_failed());
    }

    #[test]
    fn page_labels_round_trip_through_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("L", FakeDeckLayout::default()));
        let controller = controller(dir.path(), deck);
        let page = Arc::new(Page::from_json(
            "labels",
            json!({ "keys": { "0,0": { "states": { "0": { "labels": { "top": {
                "text": "Top",
                "font-family": "DejaVu Sans",
                "font-size": 18.0,
                "font-weight": 700,
                "style": "italic",
                "color": [1, 2, 3, 255],
                "outline_width": 1,
                "outline_color": [4, 5, 6, 255]
            } } } } } } }),
        ));
        controller.load_page(Some(page));
        controller.render_tick();

        let state = controller.get_input(&key0()).unwrap().get_active_state();
        let labels = state.label_manager().lock();
        let top = labels.get_composed_label(LabelPosition::Top);
        assert_eq!(top.text, "Top");
        assert_eq!(top.font_family, "DejaVu Sans");
        assert_eq!(top.font_size, 18.0);
        assert_eq!(top.font_weight, 700);
        assert_eq!(top.style, FontStyle::Italic);
        assert_eq!(top.color, [1, 2, 3, 255]);
        assert_eq!(top.outline_width, 1);
        assert_eq!(top.outline_color, [4, 5, 6, 255]);

        let center = labels.get_composed_label(LabelPosition::Center);
        assert_eq!(center.color, [255, 255, 255, 255]);
        assert_eq!(center.text, "");
    }

    #[test]
    fn waking_the_screensaver_consumes_the_event() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("Z", FakeDeckLayout::default()));
        let controller = controller(dir.path(), deck.clone());
        let original = controller.get_input(&key0()).unwrap();

        controller.screensaver().show(&controller);
        assert!(controller.screensaver().is_showing());
        assert!(!Arc::ptr_eq(&original, &controller.get_input(&key0()).unwrap()));
        assert_eq!(deck.brightness(), Some(30));

        controller.handle_device_event(DeckEvent::KeyDown(0));
        assert!(!controller.screensaver().is_showing());
        assert_eq!(deck.brightness(), Some(75));
        let restored = controller.get_input(&key0()).unwrap();
        assert!(Arc::ptr_eq(&original, &restored));
        assert!(!restored.is_pressed());

        controller.handle_device_event(DeckEvent::KeyDown(0));
        assert!(restored.is_pressed());
        controller.handle_device_event(DeckEvent::KeyUp(0));
        assert!(!restored.is_pressed());
    }

    #[test]
    fn disabled_interaction_drops_events() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("I", FakeDeckLayout::default()));
        let controller = controller(dir.path(), deck);
        controller.set_allow_interaction(false);
        controller.handle_device_event(DeckEvent::KeyDown(0));
        assert!(!controller.get_input(&key0()).unwrap().is_pressed());
    }

    #[test]
    fn page_overrides_replace_deck_settings() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("O", FakeDeckLayout::default()));
        let controller = controller(dir.path(), deck.clone());
        let page = Arc::new(Page::from_json(
            "bright",
            json!({ "brightness": { "value": 20, "overwrite": true } }),
        ));
        controller.load_page(Some(page));
        assert_eq!(controller.brightness(), 75);
        controller.render_tick();
        assert_eq!(controller.brightness(), 20);
        assert_eq!(deck.brightness(), Some(20));
    }

    #[test]
    fn rotation_is_applied_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("T", FakeDeckLayout::default()));
        let settings = DeckSettings {
            rotation: 180,
            ..DeckSettings::default()
        };
        let controller = DeckController::headless(deck.clone(), context(dir.path()), settings);
        controller.load_page(Some(labelled_page()));
        controller.render_tick();

        let written = deck.key_image(0).unwrap();
        let composed = controller.get_input(&key0()).unwrap().get_current_image(&controller);
        assert_eq!(written, image::imageops::rotate180(&composed));
    }

    struct TickCounter(Arc<AtomicUsize>);

    impl crate::actions::Action for TickCounter {
        fn id(&self) -> &str {
            "test.counter"
        }

        fn on_tick(&self, _ctx: &crate::actions::ActionContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CounterFactory(Arc<AtomicUsize>);

    impl crate::context::ActionFactory for CounterFactory {
        fn create(
            &self,
            _id: &str,
            _settings: &serde_json::Value,
            _identifier: &InputIdentifier,
            _state: u16,
        ) -> Option<Arc<dyn crate::actions::Action>> {
            Some(Arc::new(TickCounter(self.0.clone())))
        }
    }

    struct UpdateCounter(Arc<AtomicUsize>);

    impl crate::actions::Action for UpdateCounter {
        fn id(&self) -> &str {
            "test.updates"
        }

        fn on_update(&self, _ctx: &crate::actions::ActionContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct UpdateFactory(Arc<AtomicUsize>);

    impl crate::context::ActionFactory for UpdateFactory {
        fn create(
            &self,
            _id: &str,
            _settings: &serde_json::Value,
            _identifier: &InputIdentifier,
            _state: u16,
        ) -> Option<Arc<dyn crate::actions::Action>> {
            Some(Arc::new(UpdateCounter(self.0.clone())))
        }
    }

    #[test]
    fn settings_changes_and_reloads_reach_on_update() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("U", FakeDeckLayout::default()));
        let updates = Arc::new(AtomicUsize::new(0));
        let context = context(dir.path()).with_actions(Arc::new(UpdateFactory(updates.clone())));
        let controller = DeckController::headless(deck, context, DeckSettings::default());
        let page = Arc::new(Page::from_json(
            "updating",
            json!({ "keys": { "0,0": { "states": { "0": {
                "actions": [ { "id": "test.updates", "settings": { "n": 1 } } ]
            } } } } }),
        ));
        controller.load_page(Some(page.clone()));
        controller.render_tick();
        assert!(controller.workers().wait_idle(Duration::from_secs(5)));
        assert_eq!(updates.load(Ordering::SeqCst), 0);

        controller.set_action_settings(&key0(), 0, 0, json!({ "n": 2 }));
        assert!(controller.workers().wait_idle(Duration::from_secs(5)));
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(page.get_settings_for_action(&key0(), 0, 0), json!({ "n": 2 }));

        controller.set_action_settings(&key0(), 1, 0, json!({ "n": 3 }));
        assert!(controller.workers().wait_idle(Duration::from_secs(5)));
        assert_eq!(updates.load(Ordering::SeqCst), 1);

        controller.reload_input(&key0());
        controller.render_tick();
        assert!(controller.workers().wait_idle(Duration::from_secs(5)));
        assert_eq!(updates.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tick_waits_for_the_page_to_finish_loading() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("K", FakeDeckLayout::default()));
        let ticks = Arc::new(AtomicUsize::new(0));
        let context = context(dir.path()).with_actions(Arc::new(CounterFactory(ticks.clone())));
        let controller = DeckController::headless(deck, context, DeckSettings::default());
        let page = Arc::new(Page::from_json(
            "ticking",
            json!({ "keys": { "0,0": { "states": { "0": {
                "actions": [ { "id": "test.counter" } ]
            } } } } }),
        ));

        controller.load_page(Some(page.clone()));
        assert!(!page.is_ready_to_clear());
        crate::tick::tick_once(&controller);
        assert!(controller.workers().wait_idle(Duration::from_secs(5)));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        controller.render_tick();
        assert!(page.is_ready_to_clear());
        crate::tick::tick_once(&controller);
        assert!(controller.workers().wait_idle(Duration::from_secs(5)));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unloading_the_page_clears_the_deck() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("U", FakeDeckLayout::default()));
        let controller = controller(dir.path(), deck.clone());
        controller.load_page(Some(labelled_page()));
        controller.render_tick();
        controller.load_page(None);
        assert!(controller.active_page().is_none());
        assert!(deck.key_image(0).unwrap().pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let deck = Arc::new(FakeDeck::new("X", FakeDeckLayout::default()));
        let controller = controller(dir.path(), deck.clone());
        controller.close();
        controller.close();
        assert!(controller.is_closed());
        assert!(!deck.is_open());
    }
}
