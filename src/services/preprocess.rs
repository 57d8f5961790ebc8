use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageReader, Luma};
use std::io::Cursor;
use std::path::Path;

/// Percentage of darkest and lightest pixels clipped by auto-levelling.
const AUTOCONTRAST_CUTOFF_PERCENT: u64 = 2;
const CONTRAST_FACTOR: f32 = 2.0;
const BRIGHTNESS_FACTOR: f32 = 1.2;
const SHARPNESS_FACTOR: f32 = 2.0;

/// 3x3 smoothing kernel used as the blur reference for sharpening.
const SMOOTH_KERNEL: [u32; 9] = [1, 1, 1, 1, 5, 1, 1, 1, 1];
const SMOOTH_SCALE: u32 = 13;

/// Read and decode a scan from disk.
pub fn load_scan(path: &Path) -> Result<DynamicImage, PreprocessError> {
    let bytes = std::fs::read(path).map_err(|source| PreprocessError::Read {
        path: path.display().to_string(),
        source,
    })?;
    decode_scan(&bytes)
}

/// Decode an in-memory scan, sniffing the format from its contents.
pub fn decode_scan(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PreprocessError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| PreprocessError::Decode(e.to_string()))
}

/// Prepare a decoded scan for text recognition.
///
/// Steps, in order:
/// 1. single-channel grayscale
/// 2. auto-level, clipping the darkest and lightest 2% of pixels
/// 3. contrast x2.0
/// 4. brightness x1.2
/// 5. sharpness x2.0
/// 6. isotropic Lanczos upscale so the shorter side reaches `min_dimension`
///
/// The output size is checked against `max_pixels` before any work is done,
/// so a degenerate scan (e.g. 1x40000) is rejected instead of allocating.
pub fn preprocess(
    image: &DynamicImage,
    min_dimension: u32,
    max_pixels: u64,
) -> Result<GrayImage, PreprocessError> {
    let (width, height) =
        upscaled_dimensions(image.width(), image.height(), min_dimension, max_pixels)?;

    let gray = image.to_luma8();
    let gray = autocontrast(&gray, AUTOCONTRAST_CUTOFF_PERCENT);
    let gray = enhance_contrast(&gray, CONTRAST_FACTOR);
    let gray = enhance_brightness(&gray, BRIGHTNESS_FACTOR);
    let gray = enhance_sharpness(&gray, SHARPNESS_FACTOR);

    if (width, height) == gray.dimensions() {
        Ok(gray)
    } else {
        Ok(imageops::resize(&gray, width, height, FilterType::Lanczos3))
    }
}

/// Stretch the histogram so that, after discarding `cutoff_percent` of the
/// pixels at each end, the remaining range spans 0..=255.
pub fn autocontrast(image: &GrayImage, cutoff_percent: u64) -> GrayImage {
    let mut histogram = [0u64; 256];
    for Luma([v]) in image.pixels() {
        histogram[*v as usize] += 1;
    }

    let total: u64 = histogram.iter().sum();
    let cut = total * cutoff_percent / 100;

    let mut remaining = cut;
    for count in histogram.iter_mut() {
        if remaining == 0 {
            break;
        }
        let taken = remaining.min(*count);
        *count -= taken;
        remaining -= taken;
    }

    let mut remaining = cut;
    for count in histogram.iter_mut().rev() {
        if remaining == 0 {
            break;
        }
        let taken = remaining.min(*count);
        *count -= taken;
        remaining -= taken;
    }

    let lo = histogram.iter().position(|&c| c > 0);
    let hi = histogram.iter().rposition(|&c| c > 0);

    let lut: [u8; 256] = match (lo, hi) {
        (Some(lo), Some(hi)) if hi > lo => {
            let scale = 255.0 / (hi - lo) as f32;
            let offset = -(lo as f32) * scale;
            std::array::from_fn(|i| clamp_u8(i as f32 * scale + offset))
        }
        _ => std::array::from_fn(|i| i as u8),
    };

    map_pixels(image, |v| lut[v as usize])
}

/// Blend away from (factor > 1) or towards (factor < 1) the mean gray level.
pub fn enhance_contrast(image: &GrayImage, factor: f32) -> GrayImage {
    let count = (image.width() as u64 * image.height() as u64).max(1);
    let sum: u64 = image.pixels().map(|Luma([v])| *v as u64).sum();
    let mean = (sum as f32 / count as f32 + 0.5).floor();

    map_pixels(image, |v| clamp_u8(mean + factor * (v as f32 - mean)))
}

/// Blend against a black image, i.e. scale every pixel by `factor`.
pub fn enhance_brightness(image: &GrayImage, factor: f32) -> GrayImage {
    map_pixels(image, |v| clamp_u8(v as f32 * factor))
}

/// Blend against a smoothed copy; factors above 1 sharpen.
pub fn enhance_sharpness(image: &GrayImage, factor: f32) -> GrayImage {
    let smoothed = smooth(image);
    let mut out = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let original = image.get_pixel(x, y)[0] as f32;
        let blurred = smoothed.get_pixel(x, y)[0] as f32;
        *pixel = Luma([clamp_u8(blurred + factor * (original - blurred))]);
    }
    out
}

/// Size after upscaling so the shorter side equals `min_dimension`,
/// preserving aspect ratio. Images already large enough keep their size.
/// Fails when the result would exceed `max_pixels`.
pub fn upscaled_dimensions(
    width: u32,
    height: u32,
    min_dimension: u32,
    max_pixels: u64,
) -> Result<(u32, u32), PreprocessError> {
    let too_large = || PreprocessError::TooLarge {
        width,
        height,
        max_pixels,
    };

    let shorter = width.min(height);
    let (new_width, new_height) = if shorter == 0 || shorter >= min_dimension {
        (width, height)
    } else {
        let ratio = min_dimension as f64 / shorter as f64;
        let scale = |side: u32| {
            let scaled = side as f64 * ratio;
            if scaled >= u32::MAX as f64 {
                Err(too_large())
            } else {
                Ok((scaled as u32).max(min_dimension))
            }
        };
        // Pin the shorter side so float truncation cannot leave it one pixel short.
        if width <= height {
            (min_dimension, scale(height)?)
        } else {
            (scale(width)?, min_dimension)
        }
    };

    match (new_width as u64).checked_mul(new_height as u64) {
        Some(pixels) if pixels <= max_pixels => Ok((new_width, new_height)),
        _ => Err(too_large()),
    }
}

/// 3x3 smoothing filter; border pixels are copied unchanged.
fn smooth(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut out = image.clone();
    if width < 3 || height < 3 {
        return out;
    }

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut acc = 0u32;
            for (i, weight) in SMOOTH_KERNEL.iter().enumerate() {
                let dx = (i % 3) as u32;
                let dy = (i / 3) as u32;
                acc += weight * image.get_pixel(x + dx - 1, y + dy - 1)[0] as u32;
            }
            let value = (acc + SMOOTH_SCALE / 2) / SMOOTH_SCALE;
            out.put_pixel(x, y, Luma([value.min(255) as u8]));
        }
    }
    out
}

fn map_pixels(image: &GrayImage, f: impl Fn(u8) -> u8) -> GrayImage {
    let mut out = image.clone();
    for Luma([v]) in out.pixels_mut() {
        *v = f(*v);
    }
    out
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Failed to read scan {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode scan image: {0}")]
    Decode(String),

    #[error("Scan of {width}x{height} would exceed {max_pixels} pixels once upscaled")]
    TooLarge {
        width: u32,
        height: u32,
        max_pixels: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    fn gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([(60 + x % 100) as u8]))
    }

    #[test]
    fn test_autocontrast_stretches_range() {
        let img = gradient(100, 10);
        let out = autocontrast(&img, 2);
        let min = out.pixels().map(|p| p[0]).min().unwrap();
        let max = out.pixels().map(|p| p[0]).max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn test_autocontrast_flat_image_unchanged() {
        let img = GrayImage::from_pixel(10, 10, Luma([128]));
        assert_eq!(autocontrast(&img, 2), img);
    }

    #[test]
    fn test_contrast_pushes_away_from_mean() {
        let mut img = GrayImage::from_pixel(2, 1, Luma([100]));
        img.put_pixel(1, 0, Luma([140]));
        let out = enhance_contrast(&img, 2.0);
        assert_eq!(out.get_pixel(0, 0)[0], 80);
        assert_eq!(out.get_pixel(1, 0)[0], 160);
    }

    #[test]
    fn test_brightness_scales_and_saturates() {
        let mut img = GrayImage::from_pixel(2, 1, Luma([100]));
        img.put_pixel(1, 0, Luma([250]));
        let out = enhance_brightness(&img, 1.2);
        assert_eq!(out.get_pixel(0, 0)[0], 120);
        assert_eq!(out.get_pixel(1, 0)[0], 255);
    }

    #[test]
    fn test_sharpness_keeps_flat_regions() {
        let img = GrayImage::from_pixel(8, 8, Luma([90]));
        assert_eq!(enhance_sharpness(&img, 2.0), img);
    }

    const MAX_PIXELS: u64 = 50_000_000;

    #[test]
    fn test_upscale_preserves_aspect_ratio() {
        assert_eq!(upscaled_dimensions(200, 100, 1500, MAX_PIXELS).unwrap(), (3000, 1500));
        assert_eq!(upscaled_dimensions(50, 150, 300, MAX_PIXELS).unwrap(), (300, 900));
    }

    #[test]
    fn test_large_image_not_resized() {
        assert_eq!(upscaled_dimensions(40, 60, 40, MAX_PIXELS).unwrap(), (40, 60));
    }

    #[test]
    fn test_sliver_scan_rejected_before_upscale() {
        assert!(matches!(
            upscaled_dimensions(1, 40_000, 1500, MAX_PIXELS),
            Err(PreprocessError::TooLarge { width: 1, height: 40_000, .. })
        ));
        // Scaled side past u32 range.
        assert!(matches!(
            upscaled_dimensions(1, u32::MAX / 2, 1500, u64::MAX),
            Err(PreprocessError::TooLarge { .. })
        ));

        let sliver = DynamicImage::ImageLuma8(GrayImage::from_pixel(1, 40_000, Luma([128])));
        assert!(matches!(
            preprocess(&sliver, 1500, MAX_PIXELS),
            Err(PreprocessError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_oversized_source_rejected_without_upscale() {
        assert!(upscaled_dimensions(3000, 2000, 1500, 1_000_000).is_err());
    }

    #[test]
    fn test_preprocess_outputs_grayscale_at_min_dimension() {
        let rgb = RgbImage::from_fn(30, 20, |x, y| image::Rgb([(x * 8) as u8, (y * 12) as u8, 90]));
        let out = preprocess(&DynamicImage::ImageRgb8(rgb), 40, MAX_PIXELS).unwrap();
        assert_eq!(out.dimensions(), (60, 40));
    }

    #[test]
    fn test_decode_png_bytes() {
        let mut bytes = Vec::new();
        gradient(16, 16)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        let decoded = decode_scan(&bytes).unwrap();
        assert_eq!(decoded.width(), 16);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decode_scan(b"definitely not an image"),
            Err(PreprocessError::Decode(_))
        ));
    }
}
