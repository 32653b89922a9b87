//! Image probing and optimization.
//!
//! Optimization is a pure function of the input bytes and the settings: decode,
//! shrink to fit the configured box (never enlarge), and re-encode in the
//! source format.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use serde_json::{Map, Value};
use std::io::Cursor;
use tracing::debug;

use imghost_common::{Error, OptimizeSettings, Result};

/// Basic facts about an image, read without a full decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// Upper-case format name (`JPEG`, `PNG`, `GIF`, `WEBP`).
    pub format: String,
}

/// Output of [`ImageOptimizer::optimize`].
#[derive(Debug, Clone)]
pub struct Optimized {
    /// Re-encoded image bytes.
    pub data: Vec<u8>,
    /// Dimensions, format and color information.
    pub metadata: Map<String, Value>,
}

/// Inspects and optimizes uploaded images.
pub trait ImageOptimizer: Send + Sync {
    /// Read dimensions and format.
    ///
    /// # Errors
    /// - `InvalidInput` if the bytes are not a supported image
    fn inspect(&self, data: &[u8]) -> Result<ImageInfo>;

    /// Shrink and re-encode an image.
    ///
    /// # Errors
    /// - `InvalidInput` if the bytes are not a supported image
    fn optimize(&self, data: &[u8], settings: &OptimizeSettings) -> Result<Optimized>;
}

/// [`ImageOptimizer`] backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterOptimizer;

fn invalid(err: image::ImageError) -> Error {
    Error::InvalidInput(format!("Unsupported or corrupt image: {}", err))
}

fn format_name(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "JPEG".to_string(),
        ImageFormat::Png => "PNG".to_string(),
        ImageFormat::Gif => "GIF".to_string(),
        ImageFormat::WebP => "WEBP".to_string(),
        other => format!("{:?}", other).to_uppercase(),
    }
}

/// Composite onto an opaque white background.
fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = u32::from(a);
        let blend = |c: u8| ((u32::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let rgb = if img.color().has_alpha() {
                flatten_onto_white(img)
            } else {
                img.to_rgb8()
            };
            DynamicImage::ImageRgb8(rgb)
                .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)))
                .map_err(invalid)?;
        }
        ImageFormat::Png => {
            img.write_with_encoder(PngEncoder::new_with_quality(
                &mut out,
                CompressionType::Best,
                PngFilter::Adaptive,
            ))
            .map_err(invalid)?;
        }
        other => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut out), other)
                .map_err(invalid)?;
        }
    }
    Ok(out)
}

impl ImageOptimizer for RasterOptimizer {
    fn inspect(&self, data: &[u8]) -> Result<ImageInfo> {
        let reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(Error::Io)?;
        let format = reader
            .format()
            .ok_or_else(|| Error::InvalidInput("Unrecognized image format".to_string()))?;
        let (width, height) = reader.into_dimensions().map_err(invalid)?;
        Ok(ImageInfo {
            width,
            height,
            format: format_name(format),
        })
    }

    fn optimize(&self, data: &[u8], settings: &OptimizeSettings) -> Result<Optimized> {
        let format = image::guess_format(data).map_err(invalid)?;
        let img = image::load_from_memory_with_format(data, format).map_err(invalid)?;
        let (original_width, original_height) = (img.width(), img.height());

        let img = if original_width > settings.max_width || original_height > settings.max_height {
            img.resize(settings.max_width, settings.max_height, FilterType::Lanczos3)
        } else {
            img
        };

        let encoded = encode(&img, format, settings.quality)?;
        debug!(
            format = %format_name(format),
            from = data.len(),
            to = encoded.len(),
            "Image optimized"
        );

        let mut metadata = Map::new();
        metadata.insert("original_width".into(), original_width.into());
        metadata.insert("original_height".into(), original_height.into());
        metadata.insert("optimized_width".into(), img.width().into());
        metadata.insert("optimized_height".into(), img.height().into());
        metadata.insert("format".into(), format_name(format).into());
        metadata.insert("color".into(), format!("{:?}", img.color()).into());

        Ok(Optimized {
            data: encoded,
            metadata,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    /// A JPEG full of noise, saved at maximum quality.
    pub(crate) fn noisy_jpeg(width: u32, height: u32) -> Vec<u8> {
        let mut seed: u32 = 0x1234_5678;
        let img = RgbImage::from_fn(width, height, |_, _| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let v = seed.to_be_bytes();
            Rgb([v[0], v[1], v[2]])
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_with_encoder(JpegEncoder::new_with_quality(&mut out, 100))
            .unwrap();
        out
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([10, 200, 30, 128]));
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_inspect() {
        let info = RasterOptimizer.inspect(&noisy_jpeg(100, 60)).unwrap();
        assert_eq!(
            info,
            ImageInfo {
                width: 100,
                height: 60,
                format: "JPEG".to_string()
            }
        );
        assert!(RasterOptimizer.inspect(b"plain text").is_err());
    }

    #[test]
    fn test_jpeg_shrinks() {
        let original = noisy_jpeg(100, 100);
        let result = RasterOptimizer
            .optimize(&original, &OptimizeSettings::default())
            .unwrap();

        assert!(result.data.len() <= original.len());
        assert_eq!(result.metadata["format"], "JPEG");
        assert_eq!(result.metadata["optimized_width"], 100);
        assert_eq!(result.metadata["color"], "Rgb8");
        assert_eq!(RasterOptimizer.inspect(&result.data).unwrap().format, "JPEG");
    }

    #[test]
    fn test_resizes_to_fit_preserving_aspect() {
        let settings = OptimizeSettings {
            quality: 85,
            max_width: 50,
            max_height: 50,
        };
        let result = RasterOptimizer.optimize(&png(200, 100), &settings).unwrap();

        assert_eq!(result.metadata["original_width"], 200);
        assert_eq!(result.metadata["optimized_width"], 50);
        assert_eq!(result.metadata["optimized_height"], 25);
        assert_eq!(result.metadata["format"], "PNG");
        let info = RasterOptimizer.inspect(&result.data).unwrap();
        assert_eq!((info.width, info.height), (50, 25));
    }

    #[test]
    fn test_never_upscales() {
        let result = RasterOptimizer
            .optimize(&png(40, 30), &OptimizeSettings::default())
            .unwrap();
        assert_eq!(result.metadata["optimized_width"], 40);
        assert_eq!(result.metadata["optimized_height"], 30);
        // PNG keeps its alpha channel
        assert_eq!(result.metadata["color"], "Rgba8");
    }

    #[test]
    fn test_flatten_onto_white() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 0])));
        assert_eq!(flatten_onto_white(&img).get_pixel(0, 0), &Rgb([255, 255, 255]));

        let opaque = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([9, 8, 7, 255])));
        assert_eq!(flatten_onto_white(&opaque).get_pixel(0, 0), &Rgb([9, 8, 7]));
    }
}
