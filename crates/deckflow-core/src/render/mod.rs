//! Pixel helpers shared by every input renderer.

pub mod fonts;
pub mod label;
pub mod layout;

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use crate::shared::Color;

/// Fraction of the input an overlay image covers.
pub const OVERLAY_SCALE: f32 = 0.75;
const WARNING_DOT_COLOR: Color = [255, 64, 0, 255];

pub(crate) fn blend_pixel(dst: &mut Rgba<u8>, src: Rgba<u8>) {
    let sa = src[3] as f32 / 255.0;
    if sa <= 0.0 {
        return;
    }
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    if out_a <= 0.0 {
        *dst = Rgba([0, 0, 0, 0]);
        return;
    }
    let blend = |sc: u8, dc: u8| -> u8 {
        let sc = sc as f32 / 255.0;
        let dc = dc as f32 / 255.0;
        let out_c = (sc * sa + dc * da * (1.0 - sa)) / out_a;
        (out_c * 255.0).round().clamp(0.0, 255.0) as u8
    };
    dst[0] = blend(src[0], dst[0]);
    dst[1] = blend(src[1], dst[1]);
    dst[2] = blend(src[2], dst[2]);
    dst[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
}

pub fn solid(width: u32, height: u32, color: Color) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba(color))
}

/// Paint `color` over every pixel of `image`.
pub fn blend_color(image: &mut RgbaImage, color: Color) {
    if color[3] == 0 {
        return;
    }
    let src = Rgba(color);
    for pixel in image.pixels_mut() {
        blend_pixel(pixel, src);
    }
}

/// Alpha-composite `top` onto `base` with its top-left corner at `(x, y)`; may be negative.
pub fn overlay_at(base: &mut RgbaImage, top: &RgbaImage, x: i64, y: i64) {
    for (tx, ty, src) in top.enumerate_pixels() {
        let bx = x + tx as i64;
        let by = y + ty as i64;
        if bx < 0 || by < 0 || bx >= base.width() as i64 || by >= base.height() as i64 {
            continue;
        }
        if src[3] != 0 {
            blend_pixel(base.get_pixel_mut(bx as u32, by as u32), *src);
        }
    }
}

pub fn overlay_centered(base: &mut RgbaImage, top: &RgbaImage) {
    let x = (base.width() as i64 - top.width() as i64) / 2;
    let y = (base.height() as i64 - top.height() as i64) / 2;
    overlay_at(base, top, x, y);
}

/// Resize `image` to fit within `(max_w, max_h)` keeping its aspect ratio.
pub fn resize_contain(image: &RgbaImage, max_w: u32, max_h: u32) -> RgbaImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || max_w == 0 || max_h == 0 {
        return RgbaImage::new(max_w.max(1), max_h.max(1));
    }
    let ratio = (max_w as f32 / w as f32).min(max_h as f32 / h as f32);
    let nw = ((w as f32 * ratio).round() as u32).clamp(1, max_w);
    let nh = ((h as f32 * ratio).round() as u32).clamp(1, max_h);
    imageops::resize(image, nw, nh, FilterType::Triangle)
}

/// Scale `image` by `factor` and center it on a transparent canvas of the original size.
pub fn shrink_centered(image: &RgbaImage, factor: f32) -> RgbaImage {
    let (w, h) = image.dimensions();
    let factor = factor.clamp(0.05, 1.0);
    let nw = ((w as f32 * factor).round() as u32).max(1);
    let nh = ((h as f32 * factor).round() as u32).max(1);
    let small = imageops::resize(image, nw, nh, FilterType::Triangle);
    let mut canvas = RgbaImage::new(w, h);
    overlay_centered(&mut canvas, &small);
    canvas
}

/// Replace the whole image with `overlay` scaled to [`OVERLAY_SCALE`] and centered on `base`.
pub fn apply_overlay(base: &mut RgbaImage, overlay: &RgbaImage) {
    let max_w = ((base.width() as f32) * OVERLAY_SCALE).round() as u32;
    let max_h = ((base.height() as f32) * OVERLAY_SCALE).round() as u32;
    let scaled = resize_contain(overlay, max_w, max_h);
    overlay_centered(base, &scaled);
}

/// Small filled circle in the top-right corner marking an unavailable action.
pub fn draw_warning_dot(image: &mut RgbaImage) {
    let (w, h) = image.dimensions();
    let radius = (w.min(h) / 10).max(2) as i64;
    let cx = w as i64 - radius - 2;
    let cy = radius + 2;
    for y in (cy - radius)..=(cy + radius) {
        for x in (cx - radius)..=(cx + radius) {
            let (dx, dy) = (x - cx, y - cy);
            if dx * dx + dy * dy <= radius * radius
                && x >= 0
                && y >= 0
                && (x as u32) < w
                && (y as u32) < h
            {
                image.put_pixel(x as u32, y as u32, Rgba(WARNING_DOT_COLOR));
            }
        }
    }
}

/// Rotate clockwise by a multiple of 90 degrees.
pub fn rotate(image: RgbaImage, degrees: u16) -> RgbaImage {
    match degrees % 360 {
        90 => imageops::rotate90(&image),
        180 => imageops::rotate180(&image),
        270 => imageops::rotate270(&image),
        _ => image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_color_respects_alpha() {
        let mut img = solid(2, 2, [0, 0, 0, 255]);
        blend_color(&mut img, [255, 255, 255, 0]);
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0, 255]);
        blend_color(&mut img, [200, 100, 50, 255]);
        assert_eq!(img.get_pixel(1, 1).0, [200, 100, 50, 255]);
    }

    #[test]
    fn shrink_keeps_size_and_clears_border() {
        let img = solid(100, 100, [255, 0, 0, 255]);
        let shrunk = shrink_centered(&img, 0.7);
        assert_eq!(shrunk.dimensions(), (100, 100));
        assert_eq!(shrunk.get_pixel(0, 0).0[3], 0);
        assert_eq!(shrunk.get_pixel(50, 50).0, [255, 0, 0, 255]);
    }

    #[test]
    fn overlay_covers_three_quarters() {
        let mut base = solid(100, 100, [0, 0, 0, 255]);
        apply_overlay(&mut base, &solid(10, 10, [0, 255, 0, 255]));
        assert_eq!(base.get_pixel(50, 50).0, [0, 255, 0, 255]);
        assert_eq!(base.get_pixel(13, 50).0, [0, 255, 0, 255]);
        assert_eq!(base.get_pixel(5, 50).0, [0, 0, 0, 255]);
    }

    #[test]
    fn warning_dot_sits_top_right() {
        let mut img = RgbaImage::new(72, 72);
        draw_warning_dot(&mut img);
        assert_eq!(img.get_pixel(63, 9).0, WARNING_DOT_COLOR);
        assert_eq!(img.get_pixel(5, 60).0[3], 0);
    }

    #[test]
    fn rotate_quarter_turn_swaps_dimensions() {
        let img = RgbaImage::new(4, 2);
        assert_eq!(rotate(img.clone(), 90).dimensions(), (2, 4));
        assert_eq!(rotate(img, 360).dimensions(), (4, 2));
    }
}
