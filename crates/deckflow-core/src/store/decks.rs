use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use super::Store;

#[serde_inline_default]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSettings {
    #[serde(default)]
    pub path: Option<String>,
    #[serde_inline_default(true)]
    pub r#loop: bool,
    #[serde_inline_default(30)]
    pub fps: u32,
    #[serde_inline_default(true)]
    pub show: bool,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            path: None,
            r#loop: true,
            fps: 30,
            show: true,
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreensaverSettings {
    #[serde_inline_default(false)]
    pub enable: bool,
    #[serde_inline_default(5.0)]
    pub time_delay_minutes: f64,
    #[serde(default)]
    pub path: Option<String>,
    #[serde_inline_default(true)]
    pub r#loop: bool,
    #[serde_inline_default(30)]
    pub fps: u32,
    #[serde_inline_default(30)]
    pub brightness: u8,
}

impl Default for ScreensaverSettings {
    fn default() -> Self {
        Self {
            enable: false,
            time_delay_minutes: 5.0,
            path: None,
            r#loop: true,
            fps: 30,
            brightness: 30,
        }
    }
}

/// Per-device settings stored under `decks/<serial>.json`.
#[serde_inline_default]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeckSettings {
    #[serde_inline_default(75)]
    pub brightness: u8,
    #[serde_inline_default(0)]
    pub rotation: u16,
    #[serde(default)]
    pub background: BackgroundSettings,
    #[serde(default)]
    pub screensaver: ScreensaverSettings,
    /// Page file loaded when the deck connects.
    #[serde(default)]
    pub default_page: Option<String>,
}

impl Default for DeckSettings {
    fn default() -> Self {
        Self {
            brightness: 75,
            rotation: 0,
            background: BackgroundSettings::default(),
            screensaver: ScreensaverSettings::default(),
            default_page: None,
        }
    }
}

impl DeckSettings {
    /// Rotation snapped to a quarter turn.
    pub fn normalized_rotation(&self) -> u16 {
        match self.rotation % 360 {
            r @ (0 | 90 | 180 | 270) => r,
            _ => 0,
        }
    }
}

pub fn get_deck_settings(decks_dir: &Path, serial: &str) -> Result<Store<DeckSettings>, anyhow::Error> {
    // Serial numbers come from hardware; keep them from escaping the directory.
    let id: String = serial
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    Store::new(&id, decks_dir, DeckSettings::default())
}
