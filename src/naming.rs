//! Filename rules for stored originals.
//!
//! Two concerns live here:
//!
//! - **Generation**: uploaded files are renamed to
//!   `{digest8}-{unix_millis}{.ext}`, where `digest8` is the first 8 hex chars
//!   of SHA-256 over (original name, timestamp, random salt). Time plus
//!   randomness makes collisions impractical without any coordination.
//! - **Safety**: every filename that arrives from a request is checked before
//!   it is joined onto a directory, so `..` or separators can never escape the
//!   store.

use crate::error::ImageError;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Extensions listed by the image index and accepted as originals.
pub const LISTABLE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "avif"];

/// Lowercased extension of `name`, without the dot.
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
}

/// Whether `name` has one of the [`LISTABLE_EXTENSIONS`].
pub fn is_listable_image(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| LISTABLE_EXTENSIONS.contains(&ext.as_str()))
}

/// Generate a unique stored filename for an upload.
///
/// `extension` overrides the original file's extension (used when upload
/// optimization re-encodes to a different format).
pub fn unique_filename(original: &str, extension: Option<&str>) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let salt = uuid::Uuid::new_v4();
    unique_filename_with(original, extension, millis, &salt.to_string())
}

/// Deterministic core of [`unique_filename`].
pub fn unique_filename_with(
    original: &str,
    extension: Option<&str>,
    millis: u128,
    salt: &str,
) -> String {
    let digest = Sha256::digest(format!("{original}-{millis}-{salt}").as_bytes());
    let hex = format!("{digest:x}");
    let short = &hex[..8];
    let ext = extension
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .or_else(|| extension_of(original));
    match ext {
        Some(ext) => format!("{short}-{millis}.{ext}"),
        None => format!("{short}-{millis}"),
    }
}

/// Reject filenames that could resolve outside their directory.
pub fn validate_filename(name: &str) -> Result<(), ImageError> {
    let bad = name.is_empty()
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.starts_with('.');
    if bad {
        return Err(ImageError::Validation("Invalid filename".into()));
    }
    Ok(())
}
