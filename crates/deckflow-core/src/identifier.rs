//! Addresses of physical inputs on a deck.

use std::fmt;

use crate::device::Deck;
use crate::page::Page;

/// The touchscreen id used for the single strip on Stream Deck+ style devices.
pub const DEFAULT_TOUCHSCREEN: &str = "sd-plus";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InputKind {
    Key,
    Dial,
    Touchscreen,
}

impl InputKind {
    /// Top-level section of the page document holding this kind's inputs.
    pub fn page_section(self) -> &'static str {
        match self {
            InputKind::Key => "keys",
            InputKind::Dial => "dials",
            InputKind::Touchscreen => "touchscreens",
        }
    }

    /// Every input of this kind `deck` physically has.
    pub fn available_identifiers(self, deck: &dyn Deck) -> Vec<InputIdentifier> {
        match self {
            InputKind::Key => {
                let (_, columns) = deck.key_layout();
                (0..deck.key_count())
                    .map(|index| InputIdentifier::key_from_index(index, columns))
                    .collect()
            }
            InputKind::Dial => (0..deck.dial_count()).map(InputIdentifier::Dial).collect(),
            InputKind::Touchscreen => match deck.touchscreen_size() {
                Some(_) => vec![InputIdentifier::Touchscreen(DEFAULT_TOUCHSCREEN.to_owned())],
                None => Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InputIdentifier {
    Key { x: u8, y: u8 },
    Dial(u8),
    Touchscreen(String),
}

impl InputIdentifier {
    pub fn key_from_index(index: u8, columns: u8) -> Self {
        let columns = columns.max(1);
        InputIdentifier::Key {
            x: index % columns,
            y: index / columns,
        }
    }

    pub fn kind(&self) -> InputKind {
        match self {
            InputIdentifier::Key { .. } => InputKind::Key,
            InputIdentifier::Dial(_) => InputKind::Dial,
            InputIdentifier::Touchscreen(_) => InputKind::Touchscreen,
        }
    }

    /// Row-major key index, `None` for dials and touchscreens.
    pub fn key_index(&self, columns: u8) -> Option<u8> {
        match self {
            InputIdentifier::Key { x, y } => Some(y * columns + x),
            _ => None,
        }
    }

    /// Key of this input inside its page section (`"x,y"`, `"<index>"` or the touchscreen id).
    pub fn page_key(&self) -> String {
        match self {
            InputIdentifier::Key { x, y } => format!("{x},{y}"),
            InputIdentifier::Dial(index) => index.to_string(),
            InputIdentifier::Touchscreen(id) => id.clone(),
        }
    }

    pub fn from_page_key(kind: InputKind, key: &str) -> Option<Self> {
        match kind {
            InputKind::Key => {
                let (x, y) = key.split_once(',')?;
                Some(InputIdentifier::Key {
                    x: x.trim().parse().ok()?,
                    y: y.trim().parse().ok()?,
                })
            }
            InputKind::Dial => key.trim().parse().ok().map(InputIdentifier::Dial),
            InputKind::Touchscreen => Some(InputIdentifier::Touchscreen(key.to_owned())),
        }
    }

    /// Snapshot of this input's config block on `page`, `Null` when the page has none.
    pub fn get_config(&self, page: &Page) -> serde_json::Value {
        page.input_config(self)
    }
}

impl fmt::Display for InputIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().page_section(), self.page_key())
    }
}
