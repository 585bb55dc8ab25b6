use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbaImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use serde::{Deserialize, Serialize};

/// Median below which a crop is treated as light text on a dark background.
pub const DARK_BACKGROUND_MEDIAN: u8 = 120;

/// `imageops::contrast` percentage that doubles the distance from mid-grey.
const CONTRAST_DOUBLE: f32 = 41.42;

/// Absolute pixel rectangle `[x1, x2) x [y1, y2)` on a device frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Region {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Grows the rectangle by `dx` on the left and right, `dy` on top and bottom.
    pub fn padded(&self, dx: i32, dy: i32) -> Self {
        Self::new(self.x1 - dx, self.y1 - dy, self.x2 + dx, self.y2 + dy)
    }
}

/// Crops `region` out of `img`, clamped to the image bounds.
///
/// A region that lies entirely outside the image yields an empty image.
pub fn crop_region(img: &RgbaImage, region: &Region) -> RgbaImage {
    let (w, h) = img.dimensions();

    let x0 = region.x1.clamp(0, w as i32) as u32;
    let y0 = region.y1.clamp(0, h as i32) as u32;
    let x1 = region.x2.clamp(0, w as i32) as u32;
    let y1 = region.y2.clamp(0, h as i32) as u32;

    imageops::crop_imm(img, x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0)).to_image()
}

pub fn to_gray(img: &RgbaImage) -> GrayImage {
    imageops::grayscale(img)
}

/// Lanczos upscale by an integer factor.
pub fn upscale(img: &GrayImage, factor: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || factor <= 1 {
        return img.clone();
    }
    imageops::resize(img, w * factor, h * factor, FilterType::Lanczos3)
}

/// Doubles contrast and applies an unsharp mask to crisp up digit edges.
pub fn enhance(img: &GrayImage) -> GrayImage {
    let contrasted = imageops::contrast(img, CONTRAST_DOUBLE);
    imageops::unsharpen(&contrasted, 3.0, 3)
}

pub fn median_brightness(img: &GrayImage) -> u8 {
    let total = img.width() as u64 * img.height() as u64;
    if total == 0 {
        return 0;
    }

    let mut histogram = [0u64; 256];
    for pixel in img.pixels() {
        histogram[pixel[0] as usize] += 1;
    }

    let middle = total.div_ceil(2);
    let mut seen = 0;
    for (value, count) in histogram.iter().enumerate() {
        seen += count;
        if seen >= middle {
            return value as u8;
        }
    }
    255
}

/// Inverts the crop when its background is dark, so text ends up dark on light.
pub fn normalize_polarity(mut img: GrayImage) -> GrayImage {
    if median_brightness(&img) < DARK_BACKGROUND_MEDIAN {
        imageops::invert(&mut img);
    }
    img
}

/// Pixels below `threshold` become black, everything else white.
pub fn binarize(img: &GrayImage, threshold: u8) -> GrayImage {
    let (width, height) = img.dimensions();
    let mut output = GrayImage::new(width, height);

    for (x, y, pixel) in img.enumerate_pixels() {
        let value = if pixel[0] < threshold { 0u8 } else { 255u8 };
        output.put_pixel(x, y, Luma([value]));
    }

    output
}

/// Pixels strictly above `threshold` become white, everything else black.
pub fn binarize_above(img: &GrayImage, threshold: u8) -> GrayImage {
    let (width, height) = img.dimensions();
    let mut output = GrayImage::new(width, height);

    for (x, y, pixel) in img.enumerate_pixels() {
        let value = if pixel[0] > threshold { 255u8 } else { 0u8 };
        output.put_pixel(x, y, Luma([value]));
    }

    output
}

/// Square max filter of odd `size` (3 = 3x3). Thins dark strokes on a light background.
pub fn max_filter(img: &GrayImage, size: u8) -> GrayImage {
    let radius = size / 2;
    if radius == 0 {
        return img.clone();
    }
    dilate(img, Norm::LInf, radius)
}

/// Full numeric-field pipeline up to (but not including) binarization.
pub fn prepare_numeric(crop: &RgbaImage, scale: u32) -> GrayImage {
    let gray = to_gray(crop);
    let scaled = upscale(&gray, scale);
    normalize_polarity(enhance(&scaled))
}
