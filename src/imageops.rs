pub mod convert_color;
pub mod mask;
pub mod padding;

pub use convert_color::{is_effectively_grayscale, normalize_grayscale};
pub use mask::{composite_mask_over_image, mask_to_raster, MASK_HIGHLIGHT};
pub use padding::{compute_pad_box, display_to_model, pad_to_square, PadBox, PaddedImage, Size};
