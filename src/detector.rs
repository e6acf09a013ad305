use std::path::Path;

use image::{GrayImage, ImageError, ImageReader, Luma, RgbImage};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::template_matching::{Extremes, find_extremes};
use thiserror::Error;

/// Peak correlation at or above which a needle counts as found in a haystack.
pub const MATCH_THRESHOLD: f32 = 0.8;

/// Best placement of a needle inside a haystack (top-left corner, pixel coordinates).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateMatch {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

impl TemplateMatch {
    pub fn is_match(&self, threshold: f32) -> bool {
        self.score >= threshold
    }
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("needle {needle_w}x{needle_h} does not fit in haystack {haystack_w}x{haystack_h}")]
    NeedleTooLarge {
        needle_w: u32,
        needle_h: u32,
        haystack_w: u32,
        haystack_h: u32,
    },

    #[error("cannot match an empty image")]
    EmptyImage,
}

/// Decode an image file and normalize it to 3 channels.
/// The format is sniffed from the file contents, so a misnamed or extensionless file
/// still loads. An alpha channel is dropped as-is (no compositing), grayscale is expanded.
pub fn load_image(path: &Path) -> Result<RgbImage, ImageError> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(image.to_rgb8())
}

/// Split an RGB image into 3 separate grayscale images (one per channel).
fn split_channels(rgb: &RgbImage) -> [GrayImage; 3] {
    let (w, h) = rgb.dimensions();
    let mut r = GrayImage::new(w, h);
    let mut g = GrayImage::new(w, h);
    let mut b = GrayImage::new(w, h);
    for (x, y, pixel) in rgb.enumerate_pixels() {
        r.put_pixel(x, y, Luma([pixel[0]]));
        g.put_pixel(x, y, Luma([pixel[1]]));
        b.put_pixel(x, y, Luma([pixel[2]]));
    }
    [r, g, b]
}

/// Needle pixels with the per-channel mean removed, plus the resulting norm.
struct PreparedNeedle {
    width: u32,
    height: u32,
    zero_mean: [Vec<f64>; 3],
    norm_sq: f64,
}

impl PreparedNeedle {
    fn new(needle: &RgbImage) -> Self {
        let (width, height) = needle.dimensions();
        let n = f64::from(width) * f64::from(height);

        let zero_mean = split_channels(needle).map(|channel| {
            let mean = channel.pixels().map(|p| f64::from(p[0])).sum::<f64>() / n;
            channel.pixels().map(|p| f64::from(p[0]) - mean).collect::<Vec<_>>()
        });
        let norm_sq = zero_mean.iter().flatten().map(|v| v * v).sum();

        PreparedNeedle {
            width,
            height,
            zero_mean,
            norm_sq,
        }
    }
}

/// Summed-area tables for one haystack channel.
struct ChannelIntegrals {
    sum: Image<Luma<u64>>,
    sum_sq: Image<Luma<u64>>,
}

impl ChannelIntegrals {
    fn new(channel: &GrayImage) -> Self {
        ChannelIntegrals {
            sum: integral_image::<_, u64>(channel),
            sum_sq: integral_squared_image::<_, u64>(channel),
        }
    }
}

/// Sum over the `w`x`h` window at (x, y). Integral images carry a leading zero row and column.
fn window_sum(integral: &Image<Luma<u64>>, x: u32, y: u32, w: u32, h: u32) -> u64 {
    let at = |x: u32, y: u32| integral.get_pixel(x, y)[0];
    at(x + w, y + h) + at(x, y) - at(x + w, y) - at(x, y + h)
}

/// Map the raw correlation onto [-1, 1], treating near-flat windows as uncorrelated.
fn normalize_score(num: f64, window_var: f64, window_sq: f64, needle_norm: f64) -> f32 {
    let denom = if window_var <= 0.5_f64.min(10.0 * f64::from(f32::EPSILON) * window_sq) {
        0.0
    } else {
        window_var.sqrt() * needle_norm
    };

    if num.abs() < denom {
        (num / denom) as f32
    } else if num.abs() < denom * 1.125 {
        num.signum() as f32
    } else {
        0.0
    }
}

/// Zero-mean normalized cross-correlation of `needle` at every placement inside `haystack`.
///
/// Scores are summed across the three color channels, each channel centered on its own
/// mean. The returned surface is `(W - w + 1) x (H - h + 1)`; entry (x, y) scores the
/// needle with its top-left corner at (x, y). A flat needle scores 1.0 everywhere and a
/// flat haystack window scores 0.0.
///
/// Runs on one thread and costs about `W * H * w * h * 3` multiply-adds, so a large
/// needle against a full-HD haystack can take minutes.
pub fn match_template_ccoeff_normed(
    haystack: &RgbImage,
    needle: &RgbImage,
) -> Result<Image<Luma<f32>>, MatchError> {
    let (haystack_w, haystack_h) = haystack.dimensions();
    let (needle_w, needle_h) = needle.dimensions();

    if needle_w == 0 || needle_h == 0 || haystack_w == 0 || haystack_h == 0 {
        return Err(MatchError::EmptyImage);
    }
    if needle_w > haystack_w || needle_h > haystack_h {
        return Err(MatchError::NeedleTooLarge {
            needle_w,
            needle_h,
            haystack_w,
            haystack_h,
        });
    }

    let out_w = haystack_w - needle_w + 1;
    let out_h = haystack_h - needle_h + 1;
    let prepared = PreparedNeedle::new(needle);

    if prepared.norm_sq < f64::EPSILON {
        return Ok(Image::from_pixel(out_w, out_h, Luma([1.0])));
    }

    let channels = split_channels(haystack);
    let integrals = channels.each_ref().map(ChannelIntegrals::new);
    let n = f64::from(needle_w) * f64::from(needle_h);
    let needle_norm = prepared.norm_sq.sqrt();

    let mut scores = Image::new(out_w, out_h);
    for y in 0..out_h {
        for x in 0..out_w {
            let mut num = 0.0_f64;
            let mut window_var = 0.0_f64;
            let mut window_sq = 0.0_f64;

            for ((channel, integral), template) in
                channels.iter().zip(&integrals).zip(&prepared.zero_mean)
            {
                let sum = window_sum(&integral.sum, x, y, needle_w, needle_h) as f64;
                let sum_sq = window_sum(&integral.sum_sq, x, y, needle_w, needle_h) as f64;
                window_var += sum_sq - sum * sum / n;
                window_sq += sum_sq;

                // The needle is zero-mean, so correlating against raw window pixels
                // equals correlating against the centered window.
                let raw = channel.as_raw();
                for j in 0..prepared.height {
                    let row = ((y + j) * haystack_w + x) as usize;
                    let t_row = (j * prepared.width) as usize;
                    let window = &raw[row..row + prepared.width as usize];
                    let t = &template[t_row..t_row + prepared.width as usize];
                    num += window
                        .iter()
                        .zip(t)
                        .map(|(&p, &tv)| f64::from(p) * tv)
                        .sum::<f64>();
                }
            }

            let score = normalize_score(num, window_var.max(0.0), window_sq, needle_norm);
            scores.put_pixel(x, y, Luma([score]));
        }
    }

    Ok(scores)
}

/// Locate the highest-scoring placement of `needle` in `haystack`.
/// Ties resolve to the first maximum in row-major order.
pub fn find_best_match(haystack: &RgbImage, needle: &RgbImage) -> Result<TemplateMatch, MatchError> {
    tracing::debug!(
        "matching {}x{} needle against {}x{} haystack",
        needle.width(),
        needle.height(),
        haystack.width(),
        haystack.height()
    );

    let scores = match_template_ccoeff_normed(haystack, needle)?;
    let Extremes {
        max_value,
        max_value_location,
        ..
    } = find_extremes(&scores);

    Ok(TemplateMatch {
        x: max_value_location.0,
        y: max_value_location.1,
        score: max_value,
    })
}
