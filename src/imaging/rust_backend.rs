//! Pure Rust image processing backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, GIF, WebP) | `image` crate, format sniffed from the bytes |
//! | Resize | `DynamicImage::resize_exact` with `Lanczos3` |
//! | Crop (cover) | `DynamicImage::crop_imm` at the requested [`Position`](super::Position) |
//! | Pad (contain) | `imageops::overlay` onto a [`Background`] canvas |
//! | Encode → JPEG | `JpegEncoder::new_with_quality`, alpha flattened onto the background |
//! | Encode → WebP | `WebPEncoder::new_lossless` (quality is ignored) |
//! | Encode → AVIF | `AvifEncoder` (rav1e, speed 6) |

use super::backend::{BackendError, ImageBackend, ImageInfo};
use super::calculations::{ResizePlan, align, plan_resize};
use super::params::{Background, OutputFormat, Quality, ResizeParams};
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, ImageReader, Rgba, RgbaImage};
use std::io::Cursor;

/// AVIF encoder speed (0 slowest … 10 fastest).
const AVIF_SPEED: u8 = 6;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, BackendError> {
    Ok(ImageReader::new(Cursor::new(bytes)).with_guessed_format()?)
}

/// Decode an in-memory image, returning it with its sniffed format.
fn decode(bytes: &[u8]) -> Result<(DynamicImage, Option<ImageFormat>), BackendError> {
    let reader = reader(bytes)?;
    let format = reader.format();
    let img = reader
        .decode()
        .map_err(|e| BackendError::ProcessingFailed(format!("Failed to decode image: {e}")))?;
    Ok((img, format))
}

/// Apply a resize plan: scale, then crop or pad to the canvas.
fn render(img: DynamicImage, plan: &ResizePlan, params: &ResizeParams) -> DynamicImage {
    let source = (img.width(), img.height());
    if plan.is_identity(source) {
        return img;
    }

    let (scaled_w, scaled_h) = plan.scaled;
    let scaled = if plan.scaled == source {
        img
    } else {
        img.resize_exact(scaled_w, scaled_h, FilterType::Lanczos3)
    };

    let (canvas_w, canvas_h) = plan.canvas;
    if plan.canvas == plan.scaled {
        return scaled;
    }

    let (h_anchor, v_anchor) = params.options.position.anchors();
    if plan.pads() {
        let x = align(canvas_w, scaled_w, h_anchor);
        let y = align(canvas_h, scaled_h, v_anchor);
        let mut canvas =
            RgbaImage::from_pixel(canvas_w, canvas_h, Rgba(params.options.background.rgba()));
        imageops::overlay(&mut canvas, &scaled.to_rgba8(), x as i64, y as i64);
        DynamicImage::ImageRgba8(canvas)
    } else {
        let x = align(scaled_w, canvas_w, h_anchor);
        let y = align(scaled_h, canvas_h, v_anchor);
        scaled.crop_imm(x, y, canvas_w, canvas_h)
    }
}

/// Composite any alpha onto an opaque background (JPEG has no alpha channel).
fn flatten(img: DynamicImage, background: Background) -> DynamicImage {
    if !img.color().has_alpha() {
        return DynamicImage::ImageRgb8(img.to_rgb8());
    }
    let rgba = img.to_rgba8();
    let [r, g, b, _] = background.rgba();
    let mut canvas = RgbaImage::from_pixel(rgba.width(), rgba.height(), Rgba([r, g, b, 255]));
    imageops::overlay(&mut canvas, &rgba, 0, 0);
    DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8())
}

/// Reduce to 8 bits per channel; the encoders below reject 16-bit and float buffers.
fn to_8bit(img: DynamicImage) -> DynamicImage {
    if img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    }
}

/// Encode an image in the requested format.
fn encode(
    img: DynamicImage,
    format: OutputFormat,
    quality: Quality,
    background: Background,
) -> Result<Vec<u8>, BackendError> {
    let mut buf = Vec::new();
    let q = quality.value() as u8;
    let result = match format {
        OutputFormat::Jpeg => {
            flatten(img, background).write_with_encoder(JpegEncoder::new_with_quality(&mut buf, q))
        }
        OutputFormat::Png => to_8bit(img).write_with_encoder(PngEncoder::new(&mut buf)),
        OutputFormat::Webp => to_8bit(img).write_with_encoder(WebPEncoder::new_lossless(&mut buf)),
        OutputFormat::Avif => to_8bit(img)
            .write_with_encoder(AvifEncoder::new_with_speed_quality(&mut buf, AVIF_SPEED, q)),
        OutputFormat::Gif => {
            let mut cursor = Cursor::new(&mut buf);
            DynamicImage::ImageRgba8(img.to_rgba8()).write_to(&mut cursor, ImageFormat::Gif)
        }
    };
    result.map_err(|e| BackendError::ProcessingFailed(format!("{format} encode failed: {e}")))?;
    Ok(buf)
}

impl ImageBackend for RustBackend {
    fn identify(&self, bytes: &[u8]) -> Result<ImageInfo, BackendError> {
        let reader = reader(bytes)?;
        let format = reader.format();
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| BackendError::ProcessingFailed(format!("Failed to read dimensions: {e}")))?;
        Ok(ImageInfo {
            width,
            height,
            format: format.and_then(OutputFormat::from_image_format),
        })
    }

    fn resize(&self, bytes: &[u8], params: &ResizeParams) -> Result<Vec<u8>, BackendError> {
        params.validate()?;
        let (img, source_format) = decode(bytes)?;
        let format = params
            .options
            .format
            .or_else(|| source_format.and_then(OutputFormat::from_image_format))
            .unwrap_or(OutputFormat::Jpeg);

        let plan = plan_resize(
            (img.width(), img.height()),
            params.width,
            params.height,
            params.options.fit,
            params.options.without_enlargement,
        );
        plan.check_limits()?;
        let rendered = render(img, &plan, params);
        encode(
            rendered,
            format,
            params.options.quality,
            params.options.background,
        )
    }
}
