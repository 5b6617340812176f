use image::{imageops, imageops::FilterType, GenericImageView, RgbaImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(side: u32) -> Self {
        Self::new(side, side)
    }

    pub const fn is_square(&self) -> bool {
        self.width == self.height
    }

    pub const fn largest(&self) -> u32 {
        if self.width > self.height {
            self.width
        } else {
            self.height
        }
    }
}

/// Placement of source content inside a square target.
///
/// `x`/`y` are always whole numbers (floor-divided padding); `w`/`h` keep the
/// exact scaled extent, which may be fractional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PadBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl PadBox {
    /// Integer pixel rectangle `[x, y, w, h]` clamped to a `side`×`side` canvas.
    pub fn pixel_rect(&self, side: u32) -> [u32; 4] {
        let x = (self.x as u32).min(side);
        let y = (self.y as u32).min(side);
        let w = (self.w.round() as u32).min(side - x).max(1);
        let h = (self.h.round() as u32).min(side - y).max(1);
        [x, y, w, h]
    }
}

/// Aspect-preserving placement of `source` inside `target`.
///
/// The pad offset is `floor((target - scaled) / 2)`, so an odd remainder puts the
/// extra pixel on the trailing side.
pub fn compute_pad_box(source: Size, target: Size) -> PadBox {
    let (source_w, source_h) = (f64::from(source.width), f64::from(source.height));
    let (target_w, target_h) = (f64::from(target.width), f64::from(target.height));

    if source.is_square() {
        return PadBox {
            x: 0.0,
            y: 0.0,
            w: target_w,
            h: target_h,
        };
    }

    if source.height > source.width {
        let scaled_w = source_w / source_h * target_w;
        let pad_left = ((target_w - scaled_w) / 2.0).floor();
        return PadBox {
            x: pad_left,
            y: 0.0,
            w: scaled_w,
            h: target_h,
        };
    }

    let scaled_h = source_h / source_w * target_h;
    let pad_top = ((target_h - scaled_h) / 2.0).floor();
    PadBox {
        x: 0.0,
        y: pad_top,
        w: target_w,
        h: scaled_h,
    }
}

/// Linear rescale of a display-space position into `0..model_side`.
pub fn display_to_model(x: f32, y: f32, display: Size, model_side: u32) -> (f32, f32) {
    let side = model_side as f32;
    (
        x / display.width as f32 * side,
        y / display.height as f32 * side,
    )
}

/// Source image drawn into a transparent square canvas whose side is the source's
/// longest dimension.
#[derive(Debug, Clone)]
pub struct PaddedImage {
    canvas: RgbaImage,
    source: Size,
    pad_box: PadBox,
}

pub fn pad_to_square(image: &RgbaImage) -> PaddedImage {
    let (width, height) = image.dimensions();
    let source = Size::new(width, height);
    let side = source.largest();
    let pad_box = compute_pad_box(source, Size::square(side));
    let [x, y, w, h] = pad_box.pixel_rect(side);

    let mut canvas = RgbaImage::new(side, side);
    if (w, h) == (width, height) {
        imageops::replace(&mut canvas, image, i64::from(x), i64::from(y));
    } else {
        let content = imageops::resize(image, w, h, FilterType::Lanczos3);
        imageops::replace(&mut canvas, &content, i64::from(x), i64::from(y));
    }

    PaddedImage {
        canvas,
        source,
        pad_box,
    }
}

impl PaddedImage {
    pub const fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }

    pub const fn source_size(&self) -> Size {
        self.source
    }

    pub const fn pad_box(&self) -> PadBox {
        self.pad_box
    }

    pub fn side(&self) -> u32 {
        self.canvas.width()
    }

    /// Resample the padded canvas to the model's `side`×`side` input.
    pub fn resize_to_model(&self, side: u32) -> RgbaImage {
        if self.side() == side {
            return self.canvas.clone();
        }
        imageops::resize(&self.canvas, side, side, FilterType::Lanczos3)
    }

    /// Map a source pixel coordinate into model space.
    pub fn source_to_model(&self, x: f32, y: f32, model_side: u32) -> (f32, f32) {
        let scale_x = self.pad_box.w / f64::from(self.source.width);
        let scale_y = self.pad_box.h / f64::from(self.source.height);
        let padded_x = self.pad_box.x + f64::from(x) * scale_x;
        let padded_y = self.pad_box.y + f64::from(y) * scale_y;
        let to_model = f64::from(model_side) / f64::from(self.side());
        ((padded_x * to_model) as f32, (padded_y * to_model) as f32)
    }

    /// Take a raster aligned with the square canvas (at any resolution), cut the
    /// padding away and return it at the source resolution.
    pub fn restore_source_extent(&self, raster: &RgbaImage) -> RgbaImage {
        let side = self.side();
        let [x, y, w, h] = self.pad_box.pixel_rect(side);

        let cropped = if raster.dimensions() == (side, side) {
            raster.view(x, y, w, h).to_image()
        } else {
            let scaled = imageops::resize(raster, side, side, FilterType::Triangle);
            scaled.view(x, y, w, h).to_image()
        };

        if (w, h) == (self.source.width, self.source.height) {
            cropped
        } else {
            imageops::resize(
                &cropped,
                self.source.width,
                self.source.height,
                FilterType::Triangle,
            )
        }
    }
}
