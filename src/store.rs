//! Durable storage for original images.
//!
//! Originals live flat under one directory (`public/images/` by default).
//! Every public method takes a bare filename and validates it with
//! [`naming::validate_filename`] before touching the filesystem.

use crate::error::{ImageError, Result};
use crate::naming;
use std::io;
use std::path::{Path, PathBuf};

/// URL prefix under which originals are published.
pub const PUBLIC_PREFIX: &str = "/public/images";

/// Write `bytes` to `path` so readers never observe a partial file.
///
/// The data goes to a hidden temp file in the same directory, then `rename`
/// replaces the target in one step.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let tmp = dir.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path for a validated filename. Does not check existence.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf> {
        naming::validate_filename(filename)?;
        Ok(self.dir.join(filename))
    }

    /// Public URL path, e.g. `/public/images/shoes.jpg`.
    pub fn public_path(filename: &str) -> String {
        format!("{PUBLIC_PREFIX}/{filename}")
    }

    /// Resolve and require the file to exist.
    pub async fn locate(&self, filename: &str) -> Result<PathBuf> {
        let path = self.resolve(filename)?;
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(ImageError::NotFound("Image not found".into()))
        }
    }

    pub async fn exists(&self, filename: &str) -> Result<bool> {
        let path = self.resolve(filename)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    pub async fn read(&self, filename: &str) -> Result<Vec<u8>> {
        let path = self.locate(filename).await?;
        Ok(tokio::fs::read(path).await?)
    }

    pub async fn write(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.resolve(filename)?;
        write_atomic(&path, bytes).await?;
        Ok(path)
    }

    pub async fn remove(&self, filename: &str) -> Result<()> {
        let path = self.locate(filename).await?;
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    /// Stored image filenames, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ImageError::NotFound("Images directory not found".into()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && !name.starts_with('.')
                && naming::is_listable_image(name)
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
