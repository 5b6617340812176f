use image::RgbaImage;
use rayon::prelude::*;

/// Upper bound on the number of pixels inspected by [`is_effectively_grayscale`].
pub const GRAYSCALE_SAMPLE_TARGET: usize = 1000;
/// Maximum per-channel spread for a sample to count as gray.
pub const GRAYSCALE_CHANNEL_TOLERANCE: u8 = 2;
/// Share of gray samples required to classify the whole image as gray.
pub const GRAYSCALE_MIN_FRACTION: f64 = 0.95;

/// Cheap strided scan deciding whether an image is grayscale (R≈G≈B) or
/// single-channel sensor output (G and B near zero).
pub fn is_effectively_grayscale(image: &RgbaImage) -> bool {
    let pixel_count = image.as_raw().len() / 4;
    if pixel_count == 0 {
        return false;
    }

    let step = (pixel_count / GRAYSCALE_SAMPLE_TARGET).max(1);
    let gray = image
        .as_raw()
        .chunks_exact(4)
        .step_by(step)
        .filter(|pixel| is_gray_sample(pixel[0], pixel[1], pixel[2]))
        .count();
    let samples = pixel_count.div_ceil(step);

    gray as f64 >= GRAYSCALE_MIN_FRACTION * samples as f64
}

fn is_gray_sample(red: u8, green: u8, blue: u8) -> bool {
    let same_channels = red.abs_diff(green) <= GRAYSCALE_CHANNEL_TOLERANCE
        && green.abs_diff(blue) <= GRAYSCALE_CHANNEL_TOLERANCE;
    let single_channel =
        green <= GRAYSCALE_CHANNEL_TOLERANCE && blue <= GRAYSCALE_CHANNEL_TOLERANCE;
    same_channels || single_channel
}

/// Copy the red channel into green and blue when the image is effectively gray.
/// Returns whether the image was rewritten.
pub fn normalize_grayscale(image: &mut RgbaImage) -> bool {
    if !is_effectively_grayscale(image) {
        return false;
    }
    image.par_chunks_exact_mut(4).for_each(|pixel| {
        pixel[1] = pixel[0];
        pixel[2] = pixel[0];
    });
    true
}
