//! Error taxonomy shared by the store, cache and service layers.
//!
//! The HTTP surface maps each variant to a status code; see
//! [`http::ApiError`](crate::http::ApiError).

use crate::imaging::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    /// Bad input: MIME type, size, filename or query parameters.
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    /// Undecodable input, invalid resize parameters, encoder failure or timeout.
    #[error("Image processing failed: {0}")]
    ImageProcessing(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BackendError> for ImageError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Io(e) => Self::Io(e),
            BackendError::ProcessingFailed(msg) => Self::ImageProcessing(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, ImageError>;
