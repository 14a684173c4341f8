//! The device boundary: a deck that accepts native pixel buffers and reports input events.

mod fake;
mod hardware;

pub use fake::{FakeDeck, FakeDeckLayout};
pub use hardware::{HardwareDeck, list_hardware_decks};

use std::time::Duration;

use image::RgbaImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("transport error: {0}")]
    Transport(#[from] elgato_streamdeck::StreamDeckError),
    #[error("image conversion failed: {0}")]
    Image(#[from] image::ImageError),
    /// Simulated or otherwise non-library transport failure.
    #[error("transport error: {0}")]
    Io(String),
    #[error("device is closed")]
    Closed,
    #[error("key {0} does not exist on this device")]
    InvalidKey(u8),
    #[error("device has no touchscreen")]
    NoTouchscreen,
}

impl DeviceError {
    /// Whether this failure counts toward the consecutive-failure limit.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DeviceError::Transport(_) | DeviceError::Image(_) | DeviceError::Io(_)
        )
    }
}

/// An image already converted into the device's wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// A raw event reported by the device, before it is routed to an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeckEvent {
    KeyDown(u8),
    KeyUp(u8),
    DialDown(u8),
    DialUp(u8),
    DialTurn(u8, i8),
    TouchShort { x: u16, y: u16 },
    TouchLong { x: u16, y: u16 },
    TouchDrag { start: (u16, u16), end: (u16, u16) },
}

pub trait Deck: Send + Sync {
    fn serial_number(&self) -> &str;
    fn product_name(&self) -> String;
    /// `(rows, columns)` of the key grid.
    fn key_layout(&self) -> (u8, u8);
    fn dial_count(&self) -> u8;
    fn key_image_size(&self) -> (u32, u32);
    fn touchscreen_size(&self) -> Option<(u32, u32)>;

    fn key_count(&self) -> u8 {
        let (rows, columns) = self.key_layout();
        rows * columns
    }

    fn convert_key_image(&self, image: RgbaImage) -> Result<NativeImage, DeviceError>;
    fn convert_touchscreen_image(&self, image: RgbaImage) -> Result<NativeImage, DeviceError>;

    fn write_key_image(&self, key: u8, image: &NativeImage) -> Result<(), DeviceError>;
    /// Write `image` at `(x, y)` on the touchscreen.
    fn write_touchscreen_image(&self, x: u32, y: u32, image: &NativeImage)
    -> Result<(), DeviceError>;
    fn set_brightness(&self, percent: u8) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for input and return what arrived.
    fn read_events(&self, timeout: Duration) -> Result<Vec<DeckEvent>, DeviceError>;

    fn close(&self);
    fn is_open(&self) -> bool;
}
