//! Raster preprocessing shared by the region detectors and the number reader.

use image::{GrayImage, Luma, RgbImage, imageops::FilterType};
use imageproc::{contrast::otsu_level, filter::box_filter, gradients::sobel_gradients};

/// Pixel value used for "ink" (foreground) in binary masks.
pub const INK: u8 = 255;

/// Contrast-limited adaptive histogram equalization.
///
/// The image is split into a `grid` x `grid` mesh of tiles. Each tile gets
/// its own clipped-histogram lookup table, and pixels are mapped by bilinear
/// interpolation between the four nearest tile tables.
pub fn clahe(image: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }
    let tile_w = width.div_ceil(grid.clamp(1, width));
    let tile_h = height.div_ceil(grid.clamp(1, height));
    let tiles_x = width.div_ceil(tile_w);
    let tiles_y = height.div_ceil(tile_h);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            luts.push(tile_lut(image, x0, y0, x1, y1, clip_limit));
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];
    let locate = |pos: u32, tile: u32, tiles: u32| {
        let f = ((pos as f32 + 0.5) / tile as f32 - 0.5).max(0.0);
        let t0 = (f.floor() as u32).min(tiles - 1);
        let t1 = (t0 + 1).min(tiles - 1);
        let a = (f - t0 as f32).clamp(0.0, 1.0);
        (t0, t1, a)
    };

    GrayImage::from_fn(width, height, |x, y| {
        let v = image.get_pixel(x, y)[0] as usize;
        let (tx0, tx1, ax) = locate(x, tile_w, tiles_x);
        let (ty0, ty1, ay) = locate(y, tile_h, tiles_y);
        let top = lut_at(tx0, ty0)[v] as f32 * (1.0 - ax) + lut_at(tx1, ty0)[v] as f32 * ax;
        let bottom =
            lut_at(tx0, ty1)[v] as f32 * (1.0 - ax) + lut_at(tx1, ty1)[v] as f32 * ax;
        Luma([(top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8])
    })
}

/// Build the equalization table for one tile.
fn tile_lut(
    image: &GrayImage,
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
    clip_limit: f32,
) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[image.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let area = (x1 - x0) * (y1 - y0);
    let mut lut = [0u8; 256];
    if area == 0 {
        for (i, v) in lut.iter_mut().enumerate() {
            *v = i as u8;
        }
        return lut;
    }

    let clip = ((clip_limit * area as f32 / 256.0) as u32).max(1);
    let mut excess = 0;
    for count in hist.iter_mut() {
        if *count > clip {
            excess += *count - clip;
            *count = clip;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, count) in hist.iter_mut().enumerate() {
        *count += share + u32::from(i < remainder);
    }

    let mut cdf = 0u64;
    for (i, count) in hist.iter().enumerate() {
        cdf += u64::from(*count);
        lut[i] = ((cdf * 255) / u64::from(area)).min(255) as u8;
    }
    lut
}

/// Otsu binarization. With `ink_is_dark`, pixels at or below the level become
/// [`INK`] and everything else 0; otherwise the reverse.
pub fn otsu_mask(image: &GrayImage, ink_is_dark: bool) -> GrayImage {
    let level = otsu_level(image);
    threshold_mask(image, level, ink_is_dark)
}

/// Fixed-level binarization, using the same convention as [`otsu_mask`].
pub fn threshold_mask(image: &GrayImage, level: u8, ink_is_dark: bool) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y)[0];
        let ink = if ink_is_dark { v <= level } else { v > level };
        Luma([if ink { INK } else { 0 }])
    })
}

/// Mean-based adaptive threshold: a pixel is ink when it is darker than its
/// `radius` neighbourhood mean by more than `offset`. Unlike
/// [`imageproc::contrast::adaptive_threshold`], the offset keeps scanner
/// noise on blank paper out of the mask.
pub fn adaptive_mask(image: &GrayImage, radius: u32, offset: f32) -> GrayImage {
    let mean = box_filter(image, radius, radius);
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let v = f32::from(image.get_pixel(x, y)[0]);
        let m = f32::from(mean.get_pixel(x, y)[0]);
        Luma([if v < m - offset { INK } else { 0 }])
    })
}

/// Sobel gradient magnitude, scaled into `u8`.
pub fn gradient_magnitude(image: &GrayImage) -> GrayImage {
    let gradients = sobel_gradients(image);
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([(gradients.get_pixel(x, y)[0] / 4).min(255) as u8])
    })
}

/// HSV saturation channel, scaled to `0..=255`.
pub fn saturation(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let s = if max == 0 {
            0
        } else {
            (u32::from(max - min) * 255 / u32::from(max)) as u8
        };
        Luma([s])
    })
}

/// Downscale so that the longest side is at most `max_side`. Returns the
/// scaled image and the factor mapping scaled coordinates back to the input.
pub fn downscale_rgb(image: &RgbImage, max_side: u32) -> (RgbImage, f64) {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if longest <= max_side || longest == 0 {
        return (image.clone(), 1.0);
    }
    let factor = f64::from(longest) / f64::from(max_side);
    let new_w = ((f64::from(width) / factor).round() as u32).max(1);
    let new_h = ((f64::from(height) / factor).round() as u32).max(1);
    let scaled = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let back = f64::from(width) / f64::from(new_w);
    (scaled, back)
}

/// Fraction of [`INK`] pixels in a mask.
pub fn ink_fraction(mask: &GrayImage) -> f64 {
    let total = u64::from(mask.width()) * u64::from(mask.height());
    if total == 0 {
        return 0.0;
    }
    let ink = mask.pixels().filter(|p| p[0] == INK).count() as f64;
    ink / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_tone(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| {
            Luma([if x < width / 2 { 40 } else { 220 }])
        })
    }

    #[test]
    fn clahe_preserves_size_and_order() {
        let img = two_tone(64, 48);
        let out = clahe(&img, 2.0, 8);
        assert_eq!(out.dimensions(), img.dimensions());
        assert!(out.get_pixel(2, 10)[0] < out.get_pixel(60, 10)[0]);
    }

    #[test]
    fn clahe_handles_tiny_images() {
        let img = GrayImage::from_pixel(3, 2, Luma([128]));
        let out = clahe(&img, 2.0, 8);
        assert_eq!(out.dimensions(), (3, 2));
    }

    #[test]
    fn otsu_marks_dark_half_as_ink() {
        let mask = otsu_mask(&two_tone(20, 10), true);
        assert_eq!(mask.get_pixel(0, 0)[0], INK);
        assert_eq!(mask.get_pixel(19, 0)[0], 0);
        assert!((ink_fraction(&mask) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn gradient_peaks_on_the_edge() {
        let grad = gradient_magnitude(&two_tone(20, 10));
        assert!(grad.get_pixel(10, 5)[0] > 100);
        assert_eq!(grad.get_pixel(2, 5)[0], 0);
    }

    #[test]
    fn adaptive_mask_ignores_faint_noise() {
        // Paper with a one-level ripple, and one dark stroke.
        let img = GrayImage::from_fn(40, 40, |x, y| {
            if (18..22).contains(&x) {
                Luma([30])
            } else {
                Luma([200 + ((x + y) % 2) as u8])
            }
        });
        let mask = adaptive_mask(&img, 5, 10.0);
        assert_eq!(mask.get_pixel(20, 20)[0], INK);
        assert_eq!(mask.get_pixel(5, 5)[0], 0);
        assert_eq!(mask.get_pixel(35, 30)[0], 0);
    }

    #[test]
    fn saturation_of_gray_is_zero() {
        let img = RgbImage::from_pixel(4, 4, image::Rgb([90, 90, 90]));
        assert!(saturation(&img).pixels().all(|p| p[0] == 0));
        let red = RgbImage::from_pixel(4, 4, image::Rgb([200, 0, 0]));
        assert!(saturation(&red).pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn downscale_reports_back_factor() {
        let img = RgbImage::new(2000, 1000);
        let (small, back) = downscale_rgb(&img, 500);
        assert_eq!(small.dimensions(), (500, 250));
        assert!((back - 4.0).abs() < 1e-9);
    }
}
