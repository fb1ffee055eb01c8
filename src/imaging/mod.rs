//! Image processing: pure Rust, no system libraries.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** | `image::ImageReader::with_guessed_format` + `into_dimensions` |
//! | **Resize** | Lanczos3 via `image::imageops`, crop or pad per [`Fit`] |
//! | **Encode** | JPEG, PNG, WebP (lossless), GIF, AVIF (rav1e) |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for resize geometry (unit testable)
//! - **Parameters**: Data structures describing a resize
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]

pub mod backend;
pub mod calculations;
mod params;
pub mod rust_backend;

pub use backend::{BackendError, ImageBackend, ImageInfo};
pub use params::{
    Anchor, Background, Fit, MAX_DIMENSION, MAX_PIXELS, OutputFormat, ParseParamError, Position, Quality,
    ResizeOptions, ResizeParams,
};
pub use rust_backend::RustBackend;
