use image::{DynamicImage, Rgb, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SegmentError};

/// Plain tensor value that can cross the worker channel: row-major `data` with
/// its `dims`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorData {
    pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let tensor = Self { dims, data };
        tensor.validate()?;
        Ok(tensor)
    }

    /// Check that `data` holds exactly as many values as `dims` describe.
    ///
    /// Tensors arrive over the channel with public fields, so this runs again
    /// before any conversion to an array.
    pub fn validate(&self) -> Result<()> {
        let expected: usize = self.dims.iter().product();
        if expected != self.data.len() {
            return Err(SegmentError::validation(
                "tensor",
                format!(
                    "dims {:?} describe {expected} values but {} were given",
                    self.dims,
                    self.data.len()
                ),
            ));
        }
        Ok(())
    }

    pub fn zeros(dims: Vec<usize>) -> Self {
        let len = dims.iter().product();
        Self {
            dims,
            data: vec![0.0; len],
        }
    }

    pub fn from_array<D: Dimension>(array: ArrayView<'_, f32, D>) -> Self {
        Self {
            dims: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        self.validate()?;
        Ok(ArrayD::from_shape_vec(IxDyn(&self.dims), self.data.clone())?)
    }

    pub fn into_array(self) -> Result<ArrayD<f32>> {
        self.validate()?;
        Ok(ArrayD::from_shape_vec(IxDyn(&self.dims), self.data)?)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Interleaved pixels → planar `[1, 3, H, W]` in `0.0..=1.0`. Alpha is dropped;
/// the image must already be at model resolution.
pub fn to_model_tensor(image: &DynamicImage) -> Array4<f32> {
    match image {
        DynamicImage::ImageRgb8(rgb) => planar_rgb(rgb),
        other => planar_rgb(&other.to_rgb8()),
    }
}

fn planar_rgb(rgb: &RgbImage) -> Array4<f32> {
    rgb.as_ndarray3()
        .mapv(|v| f32::from(v) / 255.0)
        .insert_axis(Axis(0))
}

/// Inverse of [`to_model_tensor`]; values are rounded and clamped to bytes.
pub fn tensor_to_image(tensor: ArrayView4<f32>) -> Result<RgbImage> {
    let (batch, channels, height, width) = tensor.dim();
    if batch != 1 || channels != 3 {
        return Err(SegmentError::validation(
            "image tensor",
            format!("expected [1, 3, H, W], got {:?}", tensor.shape()),
        ));
    }

    let to_byte = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            to_byte(tensor[[0, 0, y, x]]),
            to_byte(tensor[[0, 1, y, x]]),
            to_byte(tensor[[0, 2, y, x]]),
        ])
    }))
}

/// `[1, K, W, H]` dims of a decoder mask tensor.
pub fn mask_dims(tensor: &TensorData) -> Result<[usize; 4]> {
    <[usize; 4]>::try_from(tensor.dims.as_slice()).map_err(|_| {
        SegmentError::validation(
            "mask tensor",
            format!("expected 4 dimensions, got {:?}", tensor.dims),
        )
    })
}

/// The `index`-th `W×H` plane of a `[1, K, W, H]` mask tensor.
pub fn slice_mask_channel(tensor: &TensorData, index: usize) -> Result<&[f32]> {
    let [_, count, width, height] = mask_dims(tensor)?;
    if index >= count {
        return Err(SegmentError::validation(
            "mask index",
            format!("{index} is out of range for {count} candidates"),
        ));
    }

    let stride = width * height;
    let start = stride * index;
    tensor.data.get(start..start + stride).ok_or_else(|| {
        SegmentError::validation(
            "mask tensor",
            format!("holds {} values, dims are {:?}", tensor.len(), tensor.dims),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn test_planar_channel_order() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 51]));
        image.put_pixel(1, 0, Rgb([0, 102, 255]));
        let tensor = to_model_tensor(&DynamicImage::ImageRgb8(image));

        assert_eq!(tensor.shape(), &[1, 3, 1, 2]);
        let flat: Vec<f32> = tensor.iter().copied().collect();
        assert_eq!(flat, vec![1.0, 0.0, 0.0, 0.4, 0.2, 1.0]);
    }

    #[test]
    fn test_alpha_is_dropped() {
        let image = RgbaImage::from_pixel(3, 3, Rgba([255, 255, 255, 0]));
        let tensor = to_model_tensor(&DynamicImage::ImageRgba8(image));
        assert_eq!(tensor.shape(), &[1, 3, 3, 3]);
        assert!(tensor.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_solid_colour_round_trip() {
        let colour = Rgb([12, 200, 77]);
        let image = RgbImage::from_pixel(16, 16, colour);
        let tensor = to_model_tensor(&DynamicImage::ImageRgb8(image));
        let restored = tensor_to_image(tensor.view()).unwrap();

        for pixel in restored.pixels() {
            for (a, b) in pixel.0.iter().zip(colour.0.iter()) {
                assert!(a.abs_diff(*b) <= 1);
            }
        }
    }

    #[test]
    fn test_slice_mask_channel() {
        let data: Vec<f32> = (0..48).map(|v| v as f32).collect();
        let tensor = TensorData::new(vec![1, 3, 4, 4], data).unwrap();

        let slice = slice_mask_channel(&tensor, 1).unwrap();
        let expected: Vec<f32> = (16..32).map(|v| v as f32).collect();
        assert_eq!(slice, expected.as_slice());
    }

    #[test]
    fn test_slice_mask_channel_out_of_range() {
        let tensor = TensorData::zeros(vec![1, 3, 4, 4]);
        assert!(matches!(
            slice_mask_channel(&tensor, 3),
            Err(SegmentError::Validation { .. })
        ));
    }

    #[test]
    fn test_tensor_data_validates_length() {
        assert!(TensorData::new(vec![1, 2, 2], vec![0.0; 3]).is_err());
        let tensor = TensorData::new(vec![1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let array = tensor.to_array().unwrap();
        assert_eq!(array[[0, 1, 0]], 3.0);
        assert_eq!(TensorData::from_array(array.view()), tensor);
    }

    #[test]
    fn test_malformed_tensor_is_input_error() {
        let tensor = TensorData {
            dims: vec![1, 3, 8, 8],
            data: vec![0.0; 5],
        };
        let err = tensor.to_array().unwrap_err();
        assert_eq!(err.kind(), crate::errors::FailureKind::Input);
        assert!(matches!(
            tensor.into_array(),
            Err(SegmentError::Validation { .. })
        ));
    }
}
