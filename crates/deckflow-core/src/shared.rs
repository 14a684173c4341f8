use std::path::PathBuf;

use directories::BaseDirs;

/// Application id used for the per-user directories.
pub const APP_ID: &str = "io.github.sulrwin.deckflow";

/// An RGBA colour as stored in page files (`[r, g, b, a]`).
pub type Color = [u8; 4];

pub const TRANSPARENT: Color = [0, 0, 0, 0];
pub const WHITE: Color = [255, 255, 255, 255];
pub const BLACK: Color = [0, 0, 0, 255];

#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Paths {
    /// All three directories rooted under `root`. Used by tests and portable installs.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
        }
    }

    pub fn decks_dir(&self) -> PathBuf {
        self.config_dir.join("decks")
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.data_dir.join("pages")
    }

    pub fn video_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("videos")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

pub fn discover_paths() -> anyhow::Result<Paths> {
    let base =
        BaseDirs::new().ok_or_else(|| anyhow::anyhow!("failed to determine base directories"))?;

    Ok(Paths {
        config_dir: base.config_dir().join(APP_ID),
        data_dir: base.data_dir().join(APP_ID),
        cache_dir: base.cache_dir().join(APP_ID),
    })
}

/// Parse `#RRGGBB` / `#RRGGBBAA` into a colour.
pub fn parse_hex_color(s: &str) -> Option<Color> {
    let hex = s.trim();
    let hex = hex.strip_prefix('#').unwrap_or(hex);
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    match hex.len() {
        6 => Some([channel(0)?, channel(2)?, channel(4)?, 0xff]),
        8 => Some([channel(0)?, channel(2)?, channel(4)?, channel(6)?]),
        _ => None,
    }
}

/// Read a colour from page JSON. Accepts `[r, g, b]`, `[r, g, b, a]` and hex strings.
pub fn color_from_json(value: &serde_json::Value) -> Option<Color> {
    match value {
        serde_json::Value::Array(items) if items.len() == 3 || items.len() == 4 => {
            let mut out = [0, 0, 0, 255];
            for (slot, item) in out.iter_mut().zip(items) {
                *slot = item.as_u64()?.min(255) as u8;
            }
            Some(out)
        }
        serde_json::Value::String(s) => parse_hex_color(s),
        _ => None,
    }
}
