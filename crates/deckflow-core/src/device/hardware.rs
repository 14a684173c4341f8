use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use elgato_streamdeck::{
    StreamDeck, StreamDeckInput,
    images::{ImageRect, convert_image_with_format},
    info::Kind,
};
use image::{DynamicImage, RgbaImage};
use parking_lot::Mutex;

use super::{Deck, DeckEvent, DeviceError, NativeImage};

/// Polling slice for input reads. The device mutex is released between slices so the render
/// loop's writes are never held up for long.
const READ_SLICE: Duration = Duration::from_millis(2);
const IDLE_SLEEP: Duration = Duration::from_millis(5);

#[derive(Default)]
struct InputMemory {
    buttons: Vec<bool>,
    encoders: Vec<bool>,
}

/// A physical Elgato deck.
pub struct HardwareDeck {
    device: Mutex<StreamDeck>,
    kind: Kind,
    serial: String,
    product: String,
    memory: Mutex<InputMemory>,
    open: AtomicBool,
}

/// Enumerate connected decks and open every one that can be opened.
pub fn list_hardware_decks() -> Result<Vec<HardwareDeck>, anyhow::Error> {
    let hid = elgato_streamdeck::new_hidapi()
        .map_err(|error| anyhow::anyhow!("failed to initialise hidapi: {error}"))?;

    let mut decks = Vec::new();
    for (kind, serial) in elgato_streamdeck::list_devices(&hid) {
        match StreamDeck::connect(&hid, kind, &serial) {
            Ok(device) => decks.push(HardwareDeck::new(device, serial)),
            Err(error) => log::warn!("Failed to connect to deck {serial}: {error}"),
        }
    }
    Ok(decks)
}

impl HardwareDeck {
    pub fn new(device: StreamDeck, serial: String) -> Self {
        let kind = device.kind();
        let product = device.product().unwrap_or_else(|_| format!("{kind:?}"));
        let _ = device.reset();
        Self {
            device: Mutex::new(device),
            kind,
            serial,
            product,
            memory: Mutex::new(InputMemory::default()),
            open: AtomicBool::new(true),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    fn check_open(&self) -> Result<(), DeviceError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DeviceError::Closed)
        }
    }

    /// Turn one HID report into edge events.
    fn translate(&self, input: StreamDeckInput) -> Vec<DeckEvent> {
        let mut memory = self.memory.lock();
        let mut events = Vec::new();
        match input {
            StreamDeckInput::ButtonStateChange(states) => {
                memory.buttons.resize(states.len(), false);
                for (index, (old, new)) in memory.buttons.iter_mut().zip(&states).enumerate() {
                    if *old != *new {
                        let key = index as u8;
                        events.push(if *new {
                            DeckEvent::KeyDown(key)
                        } else {
                            DeckEvent::KeyUp(key)
                        });
                        *old = *new;
                    }
                }
            }
            StreamDeckInput::EncoderStateChange(states) => {
                memory.encoders.resize(states.len(), false);
                for (index, (old, new)) in memory.encoders.iter_mut().zip(&states).enumerate() {
                    if *old != *new {
                        let dial = index as u8;
                        events.push(if *new {
                            DeckEvent::DialDown(dial)
                        } else {
                            DeckEvent::DialUp(dial)
                        });
                        *old = *new;
                    }
                }
            }
            StreamDeckInput::EncoderTwist(ticks) => {
                for (index, ticks) in ticks.into_iter().enumerate() {
                    if ticks != 0 {
                        events.push(DeckEvent::DialTurn(index as u8, ticks));
                    }
                }
            }
            StreamDeckInput::TouchScreenPress(x, y) => events.push(DeckEvent::TouchShort { x, y }),
            StreamDeckInput::TouchScreenLongPress(x, y) => {
                events.push(DeckEvent::TouchLong { x, y })
            }
            StreamDeckInput::TouchScreenSwipe(start, end) => {
                events.push(DeckEvent::TouchDrag { start, end })
            }
            _ => {}
        }
        events
    }
}

impl Deck for HardwareDeck {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn product_name(&self) -> String {
        self.product.clone()
    }

    fn key_layout(&self) -> (u8, u8) {
        (self.kind.row_count(), self.kind.column_count())
    }

    fn dial_count(&self) -> u8 {
        self.kind.encoder_count()
    }

    fn key_image_size(&self) -> (u32, u32) {
        let (w, h) = self.kind.key_image_format().size;
        (w as u32, h as u32)
    }

    fn touchscreen_size(&self) -> Option<(u32, u32)> {
        (self.kind == Kind::Plus).then_some((800, 100))
    }

    fn convert_key_image(&self, image: RgbaImage) -> Result<NativeImage, DeviceError> {
        let (width, height) = (image.width(), image.height());
        let data = convert_image_with_format(
            self.kind.key_image_format(),
            DynamicImage::ImageRgba8(image),
        )?;
        Ok(NativeImage {
            width,
            height,
            data,
        })
    }

    fn convert_touchscreen_image(&self, image: RgbaImage) -> Result<NativeImage, DeviceError> {
        if self.touchscreen_size().is_none() {
            return Err(DeviceError::NoTouchscreen);
        }
        let rect = ImageRect::from_image(DynamicImage::ImageRgba8(image))?;
        Ok(NativeImage {
            width: u32::from(rect.w),
            height: u32::from(rect.h),
            data: rect.data,
        })
    }

    fn write_key_image(&self, key: u8, image: &NativeImage) -> Result<(), DeviceError> {
        self.check_open()?;
        if key >= self.key_count() {
            return Err(DeviceError::InvalidKey(key));
        }
        self.device.lock().write_image(key, &image.data)?;
        Ok(())
    }

    fn write_touchscreen_image(
        &self,
        x: u32,
        y: u32,
        image: &NativeImage,
    ) -> Result<(), DeviceError> {
        self.check_open()?;
        if self.touchscreen_size().is_none() {
            return Err(DeviceError::NoTouchscreen);
        }
        let rect = ImageRect {
            w: image.width as u16,
            h: image.height as u16,
            data: image.data.clone(),
        };
        self.device.lock().write_lcd(x as u16, y as u16, &rect)?;
        Ok(())
    }

    fn set_brightness(&self, percent: u8) -> Result<(), DeviceError> {
        self.check_open()?;
        self.device.lock().set_brightness(percent.clamp(0, 100))?;
        Ok(())
    }

    fn read_events(&self, timeout: Duration) -> Result<Vec<DeckEvent>, DeviceError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_open()?;
            let input = self.device.lock().read_input(Some(READ_SLICE))?;
            let events = self.translate(input);
            if !events.is_empty() || Instant::now() >= deadline {
                return Ok(events);
            }
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let device = self.device.lock();
            let _ = device.clear_all_button_images();
            let _ = device.flush();
            log::info!("Closed deck {}", self.serial);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
