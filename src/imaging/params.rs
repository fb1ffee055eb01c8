//! Parameter types for image operations.
//!
//! These types describe *what* to produce, not *how*. They are the interface
//! between the [`service`](crate::service) layer (which decides which variant a
//! request wants) and the [`backend`](super::backend) (which does the pixel
//! work). They also feed the cache key, so every field that changes the output
//! bytes must live here and must serialize deterministically.
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100, default 80). Clamped on construction.
//! - [`Fit`]: How the source aspect ratio is reconciled with the target box.
//! - [`Position`]: Anchor used when a fit mode crops or pads.
//! - [`Background`]: Fill color for padded areas and alpha flattening.
//! - [`OutputFormat`]: Encoded output format.
//! - [`ResizeOptions`]: Everything except the target dimensions.
//! - [`ResizeParams`]: Target dimensions plus options for one resize.

use super::backend::BackendError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest width or height a resize may produce.
pub const MAX_DIMENSION: u32 = 8192;

/// Largest pixel count for any intermediate or output image (40 MP).
pub const MAX_PIXELS: u64 = 40_000_000;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct Quality(u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(80)
    }
}

impl From<u32> for Quality {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<Quality> for u32 {
    fn from(quality: Quality) -> Self {
        quality.0
    }
}

/// Error for the string-parsed enums below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseParamError {
    kind: &'static str,
    value: String,
}

impl fmt::Display for ParseParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseParamError {}

fn parse_error(kind: &'static str, value: &str) -> ParseParamError {
    ParseParamError {
        kind,
        value: value.to_string(),
    }
}

/// Policy for fitting the source into the requested box.
///
/// - `Cover`: scale to fill the box, crop the overflow at [`Position`].
/// - `Contain`: scale to fit inside the box, pad the rest with [`Background`].
/// - `Fill`: stretch to the exact box, ignoring aspect ratio.
/// - `Inside`: scale to fit inside the box; output may be smaller than the box.
/// - `Outside`: scale to cover the box; output may be larger than the box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    #[default]
    Cover,
    Contain,
    Fill,
    Inside,
    Outside,
}

impl FromStr for Fit {
    type Err = ParseParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cover" => Ok(Self::Cover),
            "contain" => Ok(Self::Contain),
            "fill" => Ok(Self::Fill),
            "inside" => Ok(Self::Inside),
            "outside" => Ok(Self::Outside),
            _ => Err(parse_error("fit mode", s)),
        }
    }
}

/// Anchor for crops and padding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    #[default]
    Center,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

/// Where along one axis the inner box sits inside the outer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Start,
    Middle,
    End,
}

impl Position {
    /// Horizontal and vertical anchors for this position.
    pub fn anchors(self) -> (Anchor, Anchor) {
        use Anchor::*;
        match self {
            Self::Center => (Middle, Middle),
            Self::Top => (Middle, Start),
            Self::Bottom => (Middle, End),
            Self::Left => (Start, Middle),
            Self::Right => (End, Middle),
            Self::TopLeft => (Start, Start),
            Self::TopRight => (End, Start),
            Self::BottomLeft => (Start, End),
            Self::BottomRight => (End, End),
        }
    }
}

impl FromStr for Position {
    type Err = ParseParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace([' ', '_'], "-");
        match normalized.as_str() {
            "center" | "centre" => Ok(Self::Center),
            "top" | "north" => Ok(Self::Top),
            "bottom" | "south" => Ok(Self::Bottom),
            "left" | "west" => Ok(Self::Left),
            "right" | "east" => Ok(Self::Right),
            "top-left" | "left-top" | "northwest" => Ok(Self::TopLeft),
            "top-right" | "right-top" | "northeast" => Ok(Self::TopRight),
            "bottom-left" | "left-bottom" | "southwest" => Ok(Self::BottomLeft),
            "bottom-right" | "right-bottom" | "southeast" => Ok(Self::BottomRight),
            _ => Err(parse_error("position", s)),
        }
    }
}

/// RGBA fill color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Background {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Background {
    pub const WHITE: Self = Self::opaque(255, 255, 255);

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub fn rgba(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Background {
    fn default() -> Self {
        Self::WHITE
    }
}

/// Encoded output format of a derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[serde(alias = "jpg")]
    Jpeg,
    Png,
    Webp,
    Gif,
    Avif,
}

impl OutputFormat {
    /// File extension used for cache files and stored originals.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Avif => "avif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Gif => "image/gif",
            Self::Avif => "image/avif",
        }
    }

    /// Map a file extension (without the dot, any case) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        ext.parse().ok()
    }

    pub fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::Png => Some(Self::Png),
            image::ImageFormat::WebP => Some(Self::Webp),
            image::ImageFormat::Gif => Some(Self::Gif),
            image::ImageFormat::Avif => Some(Self::Avif),
            _ => None,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ParseParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            "gif" => Ok(Self::Gif),
            "avif" => Ok(Self::Avif),
            _ => Err(parse_error("image format", s)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Avif => "avif",
        };
        f.write_str(name)
    }
}

/// Transform options other than the target size.
///
/// `format: None` means "same as the source, else JPEG"; the service resolves
/// it before deriving a cache key so equivalent requests share one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResizeOptions {
    pub format: Option<OutputFormat>,
    pub quality: Quality,
    pub fit: Fit,
    pub position: Position,
    pub background: Background,
    pub without_enlargement: bool,
}

/// Parameters for a single resize operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub options: ResizeOptions,
}

impl ResizeParams {
    pub fn new(width: Option<u32>, height: Option<u32>, options: ResizeOptions) -> Self {
        Self {
            width,
            height,
            options,
        }
    }

    /// Reject requests no backend should attempt.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.width.is_none() && self.height.is_none() {
            return Err(BackendError::ProcessingFailed(
                "resize needs a width or a height".into(),
            ));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            match value {
                Some(0) => {
                    return Err(BackendError::ProcessingFailed(format!(
                        "{name} must be positive"
                    )));
                }
                Some(v) if v > MAX_DIMENSION => {
                    return Err(BackendError::ProcessingFailed(format!(
                        "{name} {v} exceeds the {MAX_DIMENSION}px limit"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_clamps_to_valid_range() {
        assert_eq!(Quality::new(0).value(), 1);
        assert_eq!(Quality::new(50).value(), 50);
        assert_eq!(Quality::new(150).value(), 100);
    }

    #[test]
    fn quality_default_is_80() {
        assert_eq!(Quality::default().value(), 80);
    }

    #[test]
    fn quality_deserializes_clamped() {
        let q: Quality = serde_json::from_str("250").unwrap();
        assert_eq!(q.value(), 100);
    }

    #[test]
    fn fit_parses_case_insensitively() {
        assert_eq!("Cover".parse::<Fit>().unwrap(), Fit::Cover);
        assert_eq!("inside".parse::<Fit>().unwrap(), Fit::Inside);
        assert!("stretch".parse::<Fit>().is_err());
    }

    #[test]
    fn position_accepts_aliases() {
        assert_eq!("centre".parse::<Position>().unwrap(), Position::Center);
        assert_eq!("top_left".parse::<Position>().unwrap(), Position::TopLeft);
        assert_eq!(
            "right bottom".parse::<Position>().unwrap(),
            Position::BottomRight
        );
    }

    #[test]
    fn format_extension_and_mime() {
        let f: OutputFormat = "JPG".parse().unwrap();
        assert_eq!(f, OutputFormat::Jpeg);
        assert_eq!(f.extension(), "jpg");
        assert_eq!(f.mime_type(), "image/jpeg");
        assert_eq!(OutputFormat::from_extension("webp"), Some(OutputFormat::Webp));
        assert_eq!(OutputFormat::from_extension("tiff"), None);
    }

    #[test]
    fn format_serde_accepts_jpg_alias() {
        let f: OutputFormat = serde_json::from_str("\"jpg\"").unwrap();
        assert_eq!(f, OutputFormat::Jpeg);
        assert_eq!(serde_json::to_string(&f).unwrap(), "\"jpeg\"");
    }

    #[test]
    fn validate_requires_a_dimension() {
        let params = ResizeParams::new(None, None, ResizeOptions::default());
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_and_oversized() {
        let zero = ResizeParams::new(Some(0), Some(10), ResizeOptions::default());
        assert!(zero.validate().is_err());

        let huge = ResizeParams::new(Some(MAX_DIMENSION + 1), None, ResizeOptions::default());
        assert!(huge.validate().is_err());

        let ok = ResizeParams::new(Some(200), None, ResizeOptions::default());
        assert!(ok.validate().is_ok());
    }
}
