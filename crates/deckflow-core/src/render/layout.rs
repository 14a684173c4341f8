//! Placing media inside an input according to its layout.

use image::RgbaImage;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    Stretch,
    #[default]
    Cover,
    Contain,
}

impl FillMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stretch" => Some(FillMode::Stretch),
            "cover" => Some(FillMode::Cover),
            "contain" => Some(FillMode::Contain),
            _ => None,
        }
    }
}

/// Resolved layout of an input's media.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
    /// Fraction of the input the media box covers.
    pub size: f32,
    /// -1.0 is top, 1.0 is bottom.
    pub valign: f32,
    /// -1.0 is left, 1.0 is right.
    pub halign: f32,
    pub fill_mode: FillMode,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            size: 1.0,
            valign: 0.0,
            halign: 0.0,
            fill_mode: FillMode::Cover,
        }
    }
}

impl Layout {
    /// Dimensions of the media box for an input of `(width, height)`.
    pub fn content_box(&self, (width, height): (u32, u32)) -> (u32, u32) {
        let size = self.size.clamp(0.01, 4.0);
        (
            ((width as f32 * size).round() as u32).max(1),
            ((height as f32 * size).round() as u32).max(1),
        )
    }

    /// Offset of an item of `item` size inside `canvas`, per the alignment.
    pub fn offset(&self, canvas: (u32, u32), item: (u32, u32)) -> (i64, i64) {
        let free_x = canvas.0 as f32 - item.0 as f32;
        let free_y = canvas.1 as f32 - item.1 as f32;
        let x = free_x / 2.0 * (1.0 + self.halign.clamp(-1.0, 1.0));
        let y = free_y / 2.0 * (1.0 + self.valign.clamp(-1.0, 1.0));
        (x.round() as i64, y.round() as i64)
    }

    /// Fit `image` into the media box and composite it onto `canvas`.
    pub fn place(&self, canvas: &mut RgbaImage, image: &RgbaImage) {
        let target = self.content_box(canvas.dimensions());
        if image.dimensions() == target {
            let (x, y) = self.offset(canvas.dimensions(), target);
            super::overlay_at(canvas, image, x, y);
            return;
        }
        let fitted = fit(image, target, self.fill_mode);
        let (x, y) = self.offset(canvas.dimensions(), fitted.dimensions());
        super::overlay_at(canvas, &fitted, x, y);
    }
}

/// Resize `image` for a box of `(width, height)`. `Contain` may return something smaller
/// than the box; the other modes return exactly the box size.
pub fn fit(image: &RgbaImage, (width, height): (u32, u32), mode: FillMode) -> RgbaImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return RgbaImage::new(width.max(1), height.max(1));
    }
    match mode {
        FillMode::Stretch => imageops::resize(image, width, height, FilterType::Triangle),
        FillMode::Contain => super::resize_contain(image, width, height),
        FillMode::Cover => {
            let ratio = (width as f32 / w as f32).max(height as f32 / h as f32);
            let nw = ((w as f32 * ratio).ceil() as u32).max(width);
            let nh = ((h as f32 * ratio).ceil() as u32).max(height);
            let scaled = imageops::resize(image, nw, nh, FilterType::Triangle);
            let x = (nw - width) / 2;
            let y = (nh - height) / 2;
            imageops::crop_imm(&scaled, x, y, width, height).to_image()
        }
    }
}
