//! Merging of page-configured and action-provided presentation values.
//!
//! For every field the page value wins, then the action value, then the default.

use serde_json::{Map, Value, json};

use crate::render::fonts::FontStyle;
use crate::render::label::{ComposedLabel, LabelPosition};
use crate::render::layout::{FillMode, Layout};
use crate::shared::{BLACK, Color, TRANSPARENT, WHITE, color_from_json};

pub const DEFAULT_FONT_SIZE: f32 = 15.0;
pub const DEFAULT_FONT_WEIGHT: u16 = 400;
pub const DEFAULT_OUTLINE_WIDTH: u32 = 2;
pub const MAX_FONT_SIZE: f32 = 256.0;

/// Font sizes outside `1..=MAX_FONT_SIZE` are clamped; non-finite sizes are dropped.
fn sanitize_font_size(size: f32) -> Option<f32> {
    size.is_finite().then(|| size.clamp(1.0, MAX_FONT_SIZE))
}

/// One label slot as configured; unset fields fall through to the next source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelConfig {
    pub text: Option<String>,
    pub font_family: Option<String>,
    pub font_size: Option<f32>,
    pub font_weight: Option<u16>,
    pub style: Option<FontStyle>,
    pub color: Option<Color>,
    pub outline_width: Option<u32>,
    pub outline_color: Option<Color>,
}

impl LabelConfig {
    pub fn from_json(value: &Value) -> Self {
        let str_field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);
        Self {
            text: str_field("text"),
            font_family: str_field("font-family").filter(|f| !f.trim().is_empty()),
            font_size: value
                .get("font-size")
                .and_then(Value::as_f64)
                .and_then(|s| sanitize_font_size(s as f32)),
            font_weight: value
                .get("font-weight")
                .and_then(Value::as_u64)
                .map(|w| w.clamp(1, 1000) as u16),
            style: value.get("style").and_then(Value::as_str).map(FontStyle::parse),
            color: value.get("color").and_then(color_from_json),
            outline_width: value
                .get("outline_width")
                .and_then(Value::as_u64)
                .map(|w| w.min(16) as u32),
            outline_color: value.get("outline_color").and_then(color_from_json),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        if let Some(text) = &self.text {
            map.insert("text".into(), json!(text));
        }
        if let Some(family) = &self.font_family {
            map.insert("font-family".into(), json!(family));
        }
        if let Some(size) = self.font_size {
            map.insert("font-size".into(), json!(size));
        }
        if let Some(weight) = self.font_weight {
            map.insert("font-weight".into(), json!(weight));
        }
        if let Some(style) = self.style {
            map.insert("style".into(), json!(style));
        }
        if let Some(color) = self.color {
            map.insert("color".into(), json!(color));
        }
        if let Some(width) = self.outline_width {
            map.insert("outline_width".into(), json!(width));
        }
        if let Some(color) = self.outline_color {
            map.insert("outline_color".into(), json!(color));
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone)]
pub struct LabelManager {
    page: [LabelConfig; 3],
    action: [LabelConfig; 3],
    default_family: String,
}

impl LabelManager {
    pub fn new(default_family: &str) -> Self {
        Self {
            page: Default::default(),
            action: Default::default(),
            default_family: default_family.to_owned(),
        }
    }

    /// Read the `"labels"` block of a state config.
    pub fn load_page_labels(&mut self, labels: &Value) {
        for position in LabelPosition::ALL {
            self.page[position.index()] = labels
                .get(position.as_str())
                .map(LabelConfig::from_json)
                .unwrap_or_default();
        }
    }

    pub fn page_labels_json(&self) -> Value {
        let mut map = Map::new();
        for position in LabelPosition::ALL {
            let config = &self.page[position.index()];
            if *config != LabelConfig::default() {
                map.insert(position.as_str().into(), config.to_json());
            }
        }
        Value::Object(map)
    }

    pub fn page_label(&self, position: LabelPosition) -> &LabelConfig {
        &self.page[position.index()]
    }

    pub fn set_page_label(&mut self, position: LabelPosition, config: LabelConfig) {
        self.page[position.index()] = config;
    }

    pub fn set_action_label(&mut self, position: LabelPosition, config: LabelConfig) {
        self.action[position.index()] = config;
    }

    pub fn set_action_text(&mut self, position: LabelPosition, text: Option<String>) {
        self.action[position.index()].text = text;
    }

    pub fn clear_action_labels(&mut self) {
        self.action = Default::default();
    }

    pub fn get_composed_label(&self, position: LabelPosition) -> ComposedLabel {
        let page = &self.page[position.index()];
        let action = &self.action[position.index()];
        ComposedLabel {
            text: page
                .text
                .clone()
                .or_else(|| action.text.clone())
                .unwrap_or_default(),
            font_family: page
                .font_family
                .clone()
                .or_else(|| action.font_family.clone())
                .unwrap_or_else(|| self.default_family.clone()),
            font_size: page
                .font_size
                .or(action.font_size)
                .and_then(sanitize_font_size)
                .unwrap_or(DEFAULT_FONT_SIZE),
            font_weight: page
                .font_weight
                .or(action.font_weight)
                .unwrap_or(DEFAULT_FONT_WEIGHT),
            style: page.style.or(action.style).unwrap_or_default(),
            color: page.color.or(action.color).unwrap_or(WHITE),
            outline_width: page
                .outline_width
                .or(action.outline_width)
                .unwrap_or(DEFAULT_OUTLINE_WIDTH),
            outline_color: page.outline_color.or(action.outline_color).unwrap_or(BLACK),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayoutConfig {
    pub size: Option<f32>,
    pub valign: Option<f32>,
    pub halign: Option<f32>,
    pub fill_mode: Option<FillMode>,
}

impl LayoutConfig {
    /// Layout fields live beside `"path"` in the `"media"` block.
    pub fn from_json(media: &Value) -> Self {
        let float = |key: &str| media.get(key).and_then(Value::as_f64).map(|v| v as f32);
        Self {
            size: float("size"),
            valign: float("valign"),
            halign: float("halign"),
            fill_mode: media
                .get("fill-mode")
                .and_then(Value::as_str)
                .and_then(FillMode::parse),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayoutManager {
    page: LayoutConfig,
    action: LayoutConfig,
}

impl LayoutManager {
    pub fn set_page_layout(&mut self, config: LayoutConfig) {
        self.page = config;
    }

    pub fn set_action_layout(&mut self, config: LayoutConfig) {
        self.action = config;
    }

    pub fn get_composed_layout(&self) -> Layout {
        let defaults = Layout::default();
        Layout {
            size: self.page.size.or(self.action.size).unwrap_or(defaults.size),
            valign: self.page.valign.or(self.action.valign).unwrap_or(defaults.valign),
            halign: self.page.halign.or(self.action.halign).unwrap_or(defaults.halign),
            fill_mode: self
                .page
                .fill_mode
                .or(self.action.fill_mode)
                .unwrap_or(defaults.fill_mode),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackgroundColorManager {
    page: Option<Color>,
    action: Option<Color>,
}

impl BackgroundColorManager {
    /// Read the `"background"` block of a state config.
    pub fn load_page_background(&mut self, background: &Value) {
        self.page = background.get("color").and_then(color_from_json);
    }

    pub fn set_page_color(&mut self, color: Option<Color>) {
        self.page = color;
    }

    pub fn set_action_color(&mut self, color: Option<Color>) {
        self.action = color;
    }

    pub fn get_composed_color(&self) -> Color {
        self.page.or(self.action).unwrap_or(TRANSPARENT)
    }
}
