use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use image::RgbaImage;
use parking_lot::{Condvar, Mutex};

use super::{Deck, DeckEvent, DeviceError, NativeImage};

#[derive(Debug, Clone)]
pub struct FakeDeckLayout {
    pub rows: u8,
    pub columns: u8,
    pub dials: u8,
    pub key_size: (u32, u32),
    pub touchscreen: Option<(u32, u32)>,
}

impl Default for FakeDeckLayout {
    /// Geometry of a 15-key Mk2.
    fn default() -> Self {
        Self {
            rows: 3,
            columns: 5,
            dials: 0,
            key_size: (72, 72),
            touchscreen: None,
        }
    }
}

impl FakeDeckLayout {
    /// Geometry of a Stream Deck+: 2×4 keys, four dials and an 800×100 strip.
    pub fn plus() -> Self {
        Self {
            rows: 2,
            columns: 4,
            dials: 4,
            key_size: (120, 120),
            touchscreen: Some((800, 100)),
        }
    }
}

#[derive(Default)]
struct Recorded {
    keys: HashMap<u8, NativeImage>,
    touchscreen: Vec<(u32, u32, NativeImage)>,
    brightness: Option<u8>,
}

/// An in-memory deck. Native images are raw RGBA8; every write is recorded.
pub struct FakeDeck {
    serial: String,
    layout: FakeDeckLayout,
    recorded: Mutex<Recorded>,
    events: Mutex<VecDeque<DeckEvent>>,
    events_ready: Condvar,
    fail_writes: AtomicBool,
    fail_next: AtomicUsize,
    write_attempts: AtomicUsize,
    open: AtomicBool,
}

impl FakeDeck {
    pub fn new(serial: &str, layout: FakeDeckLayout) -> Self {
        Self {
            serial: serial.to_owned(),
            layout,
            recorded: Mutex::new(Recorded::default()),
            events: Mutex::new(VecDeque::new()),
            events_ready: Condvar::new(),
            fail_writes: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            write_attempts: AtomicUsize::new(0),
            open: AtomicBool::new(true),
        }
    }

    /// Make every following pixel write fail with a transport error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make only the next `count` pixel writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of pixel writes attempted, failed ones included.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn key_image(&self, key: u8) -> Option<RgbaImage> {
        let recorded = self.recorded.lock();
        let native = recorded.keys.get(&key)?;
        RgbaImage::from_raw(native.width, native.height, native.data.clone())
    }

    pub fn key_native(&self, key: u8) -> Option<NativeImage> {
        self.recorded.lock().keys.get(&key).cloned()
    }

    pub fn touchscreen_writes(&self) -> Vec<(u32, u32, NativeImage)> {
        self.recorded.lock().touchscreen.clone()
    }

    pub fn brightness(&self) -> Option<u8> {
        self.recorded.lock().brightness
    }

    /// Queue an event for the next `read_events` call.
    pub fn push_event(&self, event: DeckEvent) {
        self.events.lock().push_back(event);
        self.events_ready.notify_all();
    }

    fn begin_write(&self) -> Result<(), DeviceError> {
        if !self.is_open() {
            return Err(DeviceError::Closed);
        }
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let failing_once = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing_once || self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeviceError::Io("simulated write failure".to_owned()));
        }
        Ok(())
    }
}

fn to_native(image: RgbaImage) -> NativeImage {
    NativeImage {
        width: image.width(),
        height: image.height(),
        data: image.into_raw(),
    }
}

impl Deck for FakeDeck {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn product_name(&self) -> String {
        "Fake Deck".to_owned()
    }

    fn key_layout(&self) -> (u8, u8) {
        (self.layout.rows, self.layout.columns)
    }

    fn dial_count(&self) -> u8 {
        self.layout.dials
    }

    fn key_image_size(&self) -> (u32, u32) {
        self.layout.key_size
    }

    fn touchscreen_size(&self) -> Option<(u32, u32)> {
        self.layout.touchscreen
    }

    fn convert_key_image(&self, image: RgbaImage) -> Result<NativeImage, DeviceError> {
        Ok(to_native(image))
    }

    fn convert_touchscreen_image(&self, image: RgbaImage) -> Result<NativeImage, DeviceError> {
        if self.layout.touchscreen.is_none() {
            return Err(DeviceError::NoTouchscreen);
        }
        Ok(to_native(image))
    }

    fn write_key_image(&self, key: u8, image: &NativeImage) -> Result<(), DeviceError> {
        if key >= self.key_count() {
            return Err(DeviceError::InvalidKey(key));
        }
        self.begin_write()?;
        self.recorded.lock().keys.insert(key, image.clone());
        Ok(())
    }

    fn write_touchscreen_image(
        &self,
        x: u32,
        y: u32,
        image: &NativeImage,
    ) -> Result<(), DeviceError> {
        if self.layout.touchscreen.is_none() {
            return Err(DeviceError::NoTouchscreen);
        }
        self.begin_write()?;
        self.recorded.lock().touchscreen.push((x, y, image.clone()));
        Ok(())
    }

    fn set_brightness(&self, percent: u8) -> Result<(), DeviceError> {
        if !self.is_open() {
            return Err(DeviceError::Closed);
        }
        self.recorded.lock().brightness = Some(percent.min(100));
        Ok(())
    }

    fn read_events(&self, timeout: Duration) -> Result<Vec<DeckEvent>, DeviceError> {
        if !self.is_open() {
            return Err(DeviceError::Closed);
        }
        let mut events = self.events.lock();
        if events.is_empty() {
            self.events_ready.wait_for(&mut events, timeout);
        }
        Ok(events.drain(..).collect())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.events_ready.notify_all();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
