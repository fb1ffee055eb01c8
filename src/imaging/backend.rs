//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the two operations the service needs:
//! identify a buffer, and resize it into an encoded derivative. Both work on
//! in-memory bytes so the caller owns all filesystem I/O.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend), pure Rust and statically
//! linked, no system libraries.

use super::params::{OutputFormat, ResizeParams};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// Result of an identify operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// `None` for decodable formats that cannot be written back out.
    pub format: Option<OutputFormat>,
}

/// Trait for image processing backends.
///
/// Implementations must be stateless per call: the service runs them on a
/// worker pool and may invoke `resize` for the same input concurrently.
pub trait ImageBackend: Send + Sync {
    /// Read format and dimensions from an encoded buffer.
    fn identify(&self, bytes: &[u8]) -> Result<ImageInfo, BackendError>;

    /// Decode `bytes`, apply `params`, and return the encoded result.
    fn resize(&self, bytes: &[u8], params: &ResizeParams) -> Result<Vec<u8>, BackendError>;
}
