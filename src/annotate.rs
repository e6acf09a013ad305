use std::path::Path;

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_antialiased_line_segment_mut;
use imageproc::pixelops::interpolate;

use crate::detector::TemplateMatch;

/// Outline color: pink (BGR 203, 192, 255).
pub const OUTLINE_COLOR: Rgb<u8> = Rgb([255, 192, 203]);

/// Outline width in pixels.
pub const OUTLINE_THICKNESS: i32 = 2;

/// The area kept in an annotated result: the matched needle plus the same height again below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkedRegion {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl MarkedRegion {
    /// Anchor the region at the match location. Height is twice the needle's height
    /// to take in whatever sits directly below the needle. Not clipped to the haystack.
    pub fn from_match(m: &TemplateMatch, needle_w: u32, needle_h: u32) -> Self {
        MarkedRegion {
            left: m.x,
            top: m.y,
            width: needle_w,
            height: needle_h.saturating_mul(2),
        }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        self.left.saturating_add(self.width)
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        self.top.saturating_add(self.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.left && x < self.right() && y >= self.top && y < self.bottom()
    }
}

/// Zero every pixel outside `region`. Parts of the region beyond the image are ignored.
pub fn mask_outside(image: &mut RgbImage, region: &MarkedRegion) {
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        if !region.contains(x, y) {
            *pixel = Rgb([0, 0, 0]);
        }
    }
}

/// Draw an anti-aliased outline with corners at (left, top) and (right, bottom).
/// The stroke straddles that path: one pixel on it and one just outside it, so half
/// the outline lands on the blacked-out area. Off-image segments are clipped.
pub fn draw_outline(image: &mut RgbImage, region: &MarkedRegion, color: Rgb<u8>) {
    let clamp = |v: u32| i32::try_from(v).unwrap_or(i32::MAX).min(i32::MAX - OUTLINE_THICKNESS);
    let (left, top) = (clamp(region.left), clamp(region.top));
    let (right, bottom) = (clamp(region.right()), clamp(region.bottom()));

    for outset in 0..OUTLINE_THICKNESS {
        let (l, t) = (left - outset, top - outset);
        let (r, b) = (right + outset, bottom + outset);

        let corners = [(l, t), (r, t), (r, b), (l, b)];
        for i in 0..corners.len() {
            let start = corners[i];
            let end = corners[(i + 1) % corners.len()];
            draw_antialiased_line_segment_mut(image, start, end, color, interpolate);
        }
    }
}

/// Copy of `haystack` with everything outside `region` blacked out and the region outlined.
pub fn annotate(haystack: &RgbImage, region: &MarkedRegion) -> RgbImage {
    let mut result = haystack.clone();
    mask_outside(&mut result, region);
    draw_outline(&mut result, region, OUTLINE_COLOR);
    result
}

/// `{needle stem}_{haystack file name}`, e.g. `logo.png` + `page1.jpg` -> `logo_page1.jpg`.
pub fn result_file_name(needle: &Path, haystack: &Path) -> String {
    let stem = needle
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    let name = haystack
        .file_name()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    format!("{stem}_{name}")
}
