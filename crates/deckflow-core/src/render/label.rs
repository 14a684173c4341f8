use ab_glyph::{Font as _, PxScale, ScaleFont as _};
use font8x8::UnicodeFonts;
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use super::blend_pixel;
use super::fonts::{FontResolver, FontStyle, LoadedFont};
use crate::inputs::managers::{DEFAULT_FONT_SIZE, MAX_FONT_SIZE};
use crate::shared::Color;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelPosition {
    Top,
    Center,
    Bottom,
}

impl LabelPosition {
    pub const ALL: [LabelPosition; 3] = [
        LabelPosition::Top,
        LabelPosition::Center,
        LabelPosition::Bottom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LabelPosition::Top => "top",
            LabelPosition::Center => "center",
            LabelPosition::Bottom => "bottom",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A label with every attribute resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedLabel {
    pub text: String,
    pub font_family: String,
    pub font_size: f32,
    pub font_weight: u16,
    pub style: FontStyle,
    pub color: Color,
    pub outline_width: u32,
    pub outline_color: Color,
}

/// Draw `label` onto `img` at `position`. Uses the resolved font when one exists and the
/// built-in 8x8 bitmap font otherwise.
pub fn draw_label(
    img: &mut RgbaImage,
    label: &ComposedLabel,
    position: LabelPosition,
    fonts: &FontResolver,
) {
    if label.text.trim().is_empty() || img.width() == 0 || img.height() == 0 {
        return;
    }
    match fonts.resolve(&label.font_family, label.font_weight, label.style) {
        Some(font) => draw_with_font(img, label, position, &font),
        None => draw_with_bitmap(img, label, position),
    }
}

fn clamped_size(size: f32) -> f32 {
    if size.is_finite() {
        size.clamp(1.0, MAX_FONT_SIZE)
    } else {
        DEFAULT_FONT_SIZE
    }
}

fn block_top(position: LabelPosition, canvas_h: u32, block_h: u32, pad: u32) -> i64 {
    match position {
        LabelPosition::Top => pad as i64,
        LabelPosition::Center => (canvas_h as i64 - block_h as i64) / 2,
        LabelPosition::Bottom => canvas_h as i64 - block_h as i64 - pad as i64,
    }
}

/// Offsets covering a disc of `radius`, excluding the center.
fn outline_offsets(radius: u32) -> Vec<(i32, i32)> {
    let r = radius as i32;
    let mut offsets = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            if (dx, dy) != (0, 0) && dx * dx + dy * dy <= r * r {
                offsets.push((dx, dy));
            }
        }
    }
    offsets
}

fn draw_with_font(img: &mut RgbaImage, label: &ComposedLabel, position: LabelPosition, font: &LoadedFont) {
    let scale = PxScale::from(clamped_size(label.font_size));
    let line_h = font.font.as_scaled(scale).height().ceil().max(1.0) as u32;
    let lines: Vec<String> = label.text.lines().map(|l| font.map_text(l)).collect();
    let block_h = line_h.saturating_mul(lines.len() as u32);
    let top = block_top(position, img.height(), block_h, label.outline_width + 1);
    let offsets = outline_offsets(label.outline_width);

    for (i, line) in lines.iter().enumerate() {
        let (line_w, _) = imageproc::drawing::text_size(scale, &font.font, line);
        let x = ((img.width() as i64 - line_w as i64) / 2) as i32;
        let y = (top + i as i64 * line_h as i64).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        if label.outline_color[3] > 0 {
            for (dx, dy) in &offsets {
                imageproc::drawing::draw_text_mut(
                    img,
                    Rgba(label.outline_color),
                    x + dx,
                    y + dy,
                    scale,
                    &font.font,
                    line,
                );
            }
        }
        imageproc::drawing::draw_text_mut(img, Rgba(label.color), x, y, scale, &font.font, line);
    }
}

fn draw_text_8x8(img: &mut RgbaImage, x: i64, y: i64, text: &str, scale: u32, color: Rgba<u8>) {
    let scale = scale.max(1) as i64;
    let mut cursor_x = x;
    for ch in text.chars() {
        let glyph = font8x8::BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..8i64 {
                // LSB-first: bit 0 is the leftmost column.
                if (bits >> col) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + col * scale;
                let py = y + row as i64 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        let (tx, ty) = (px + dx, py + dy);
                        if tx >= 0 && ty >= 0 && tx < img.width() as i64 && ty < img.height() as i64 {
                            blend_pixel(img.get_pixel_mut(tx as u32, ty as u32), color);
                        }
                    }
                }
            }
        }
        cursor_x += 9 * scale;
    }
}

fn draw_with_bitmap(img: &mut RgbaImage, label: &ComposedLabel, position: LabelPosition) {
    let scale = ((clamped_size(label.font_size) / 8.0).round() as u32).max(1);
    let line_h = 9 * scale;
    let lines: Vec<&str> = label.text.lines().collect();
    let block_h = line_h.saturating_mul(lines.len() as u32);
    let top = block_top(position, img.height(), block_h, label.outline_width + 1);
    let offsets = outline_offsets(label.outline_width);

    for (i, line) in lines.iter().enumerate() {
        let line_w = line.chars().count() as i64 * 9 * scale as i64;
        let x = (img.width() as i64 - line_w) / 2;
        let y = top + i as i64 * line_h as i64;
        if label.outline_color[3] > 0 {
            for (dx, dy) in &offsets {
                draw_text_8x8(
                    img,
                    x + *dx as i64,
                    y + *dy as i64,
                    line,
                    scale,
                    Rgba(label.outline_color),
                );
            }
        }
        draw_text_8x8(img, x, y, line, scale, Rgba(label.color));
    }
}
