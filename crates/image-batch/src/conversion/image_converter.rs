//! Converter backed by the `image` crate

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageFormat, ImageReader};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::converter::{output_path_for, ConversionError, Converter};
use crate::config::ConversionConfig;
use crate::types::{ConversionOptions, OutputFormat, ResizeFit};

/// Decodes, resizes and re-encodes images on the blocking thread pool
#[derive(Debug, Clone)]
pub struct ImageConverter {
    /// Largest decoded width * height accepted
    max_pixels: u64,
    default_quality: u8,
}

impl ImageConverter {
    pub fn new(max_pixels: u64, default_quality: u8) -> Self {
        Self {
            max_pixels,
            default_quality,
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(config.max_pixels, config.default_quality)
    }

    fn convert_blocking(
        &self,
        source: &Path,
        options: &ConversionOptions,
        output: &Path,
    ) -> Result<(), ConversionError> {
        // Check dimensions from the header before allocating pixel buffers
        let (width, height) = open_reader(source)?
            .into_dimensions()
            .map_err(map_image_error)?;
        let pixels = width as u64 * height as u64;
        if pixels > self.max_pixels {
            return Err(ConversionError::ResourceExceeded(format!(
                "{}x{} ({} pixels) exceeds limit of {} pixels",
                width, height, pixels, self.max_pixels
            )));
        }

        let img = open_reader(source)?.decode().map_err(map_image_error)?;
        let img = resize(img, options);
        let img = prepare_for_format(img, options.format);

        let file = File::create(output)?;
        let mut writer = BufWriter::new(file);

        match options.format {
            OutputFormat::Jpeg => {
                let quality = options.effective_quality(self.default_quality);
                let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
                img.write_with_encoder(encoder).map_err(map_image_error)?;
            }
            other => {
                img.write_to(&mut writer, image_format(other))
                    .map_err(map_image_error)?;
            }
        }

        writer.flush()?;
        Ok(())
    }
}

impl Default for ImageConverter {
    fn default() -> Self {
        Self::from_config(&ConversionConfig::default())
    }
}

#[async_trait]
impl Converter for ImageConverter {
    async fn convert(
        &self,
        source: &Path,
        options: &ConversionOptions,
        output_dir: &Path,
    ) -> Result<PathBuf, ConversionError> {
        let output = output_path_for(source, options, output_dir);
        let this = self.clone();
        let source = source.to_path_buf();
        let options = options.clone();
        let target = output.clone();

        let result = tokio::task::spawn_blocking(move || {
            this.convert_blocking(&source, &options, &target)
        })
        .await
        .map_err(|e| ConversionError::IoFailure(format!("conversion task aborted: {}", e)))?;

        match result {
            Ok(()) => Ok(output),
            Err(e) => {
                // Never leave a partial output behind
                let _ = tokio::fs::remove_file(&output).await;
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        "image"
    }
}

fn open_reader(source: &Path) -> Result<ImageReader<std::io::BufReader<File>>, ConversionError> {
    let reader = ImageReader::open(source)?.with_guessed_format()?;
    if reader.format().is_none() {
        return Err(ConversionError::UnsupportedFormat(format!(
            "cannot determine image format of {}",
            source
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("input")
        )));
    }
    Ok(reader)
}

fn resize(img: DynamicImage, options: &ConversionOptions) -> DynamicImage {
    let (orig_w, orig_h) = (img.width().max(1), img.height().max(1));

    match (options.width, options.height) {
        (None, None) => img,
        (Some(w), Some(h)) => match options.fit {
            ResizeFit::Inside => img.resize(w, h, FilterType::Lanczos3),
            ResizeFit::Fill => img.resize_exact(w, h, FilterType::Lanczos3),
        },
        (Some(w), None) => {
            let h = ((w as f64 * orig_h as f64 / orig_w as f64).round() as u32).max(1);
            img.resize_exact(w, h, FilterType::Lanczos3)
        }
        (None, Some(h)) => {
            let w = ((h as f64 * orig_w as f64 / orig_h as f64).round() as u32).max(1);
            img.resize_exact(w, h, FilterType::Lanczos3)
        }
    }
}

/// Normalise the pixel layout to one every target encoder accepts
fn prepare_for_format(img: DynamicImage, format: OutputFormat) -> DynamicImage {
    match format {
        OutputFormat::Jpeg => {
            if !img.color().has_alpha() {
                return DynamicImage::ImageRgb8(img.to_rgb8());
            }
            // Flatten alpha over white; JPEG has no transparency
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            let mut background =
                image::RgbaImage::from_pixel(w, h, image::Rgba([255, 255, 255, 255]));
            image::imageops::overlay(&mut background, &rgba, 0, 0);
            DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(background).to_rgb8())
        }
        _ => {
            if img.color().has_alpha() {
                DynamicImage::ImageRgba8(img.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(img.to_rgb8())
            }
        }
    }
}

fn image_format(format: OutputFormat) -> ImageFormat {
    match format {
        OutputFormat::Jpeg => ImageFormat::Jpeg,
        OutputFormat::Png => ImageFormat::Png,
        OutputFormat::Webp => ImageFormat::WebP,
        OutputFormat::Gif => ImageFormat::Gif,
        OutputFormat::Bmp => ImageFormat::Bmp,
        OutputFormat::Tiff => ImageFormat::Tiff,
    }
}

fn map_image_error(err: ImageError) -> ConversionError {
    match err {
        ImageError::Decoding(e) => ConversionError::CorruptInput(e.to_string()),
        ImageError::Parameter(e) => ConversionError::CorruptInput(e.to_string()),
        ImageError::Unsupported(e) => ConversionError::UnsupportedFormat(e.to_string()),
        ImageError::Limits(e) => ConversionError::ResourceExceeded(e.to_string()),
        ImageError::Encoding(e) => ConversionError::IoFailure(e.to_string()),
        ImageError::IoError(e) => match e.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData => {
                ConversionError::CorruptInput(e.to_string())
            }
            _ => ConversionError::IoFailure(e.to_string()),
        },
    }
}
