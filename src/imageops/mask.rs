use std::borrow::Cow;

use image::{imageops, imageops::FilterType, ImageBuffer, Luma, Rgba, RgbaImage};
use imageproc::map::map_colors;

use crate::errors::{Result, SegmentError};

/// Overlay colour for foreground pixels (#32CD32, opaque).
pub const MASK_HIGHLIGHT: Rgba<u8> = Rgba([0x32, 0xcd, 0x32, 0xff]);

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Decision rule turning a decoder score into a binary label. Zero is background.
#[inline]
pub fn is_foreground(score: f32) -> bool {
    score > 0.0
}

/// Rasterize a `width`×`height` score buffer: foreground pixels get
/// [`MASK_HIGHLIGHT`], everything else is fully transparent.
pub fn mask_to_raster(buffer: &[f32], width: u32, height: u32) -> Result<RgbaImage> {
    let expected = width as usize * height as usize;
    if buffer.len() != expected {
        return Err(SegmentError::validation(
            "mask",
            format!(
                "has {} values, expected {width}x{height} = {expected}",
                buffer.len()
            ),
        ));
    }

    let scores: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(width, height, buffer.to_vec())
            .ok_or_else(|| SegmentError::validation("mask", "buffer does not fit dimensions"))?;

    Ok(map_colors(&scores, |Luma([score])| {
        if is_foreground(score) {
            MASK_HIGHLIGHT
        } else {
            TRANSPARENT
        }
    }))
}

/// Keep `image` only where `mask` is non-transparent ("source-in").
///
/// The mask is stretched to the image size first. The result alpha is the product
/// of both alphas; pixels that end up with zero alpha are cleared.
pub fn composite_mask_over_image(image: &RgbaImage, mask: &RgbaImage) -> RgbaImage {
    let (width, height) = image.dimensions();
    let mask = if mask.dimensions() == (width, height) {
        Cow::Borrowed(mask)
    } else {
        Cow::Owned(imageops::resize(mask, width, height, FilterType::Triangle))
    };

    let mut composite = RgbaImage::new(width, height);
    for ((out, source), stencil) in composite
        .pixels_mut()
        .zip(image.pixels())
        .zip(mask.pixels())
    {
        let Rgba([red, green, blue, alpha]) = *source;
        let alpha = (u16::from(alpha) * u16::from(stencil[3]) + 127) / 255;
        if alpha > 0 {
            *out = Rgba([red, green, blue, alpha as u8]);
        }
    }
    composite
}
