//! Image service: the orchestrator behind every image endpoint.
//!
//! Ties together the [`ImageStore`] (originals), the [`DerivativeCache`]
//! (resized variants) and an [`ImageBackend`] (pixel work).
//!
//! ```text
//! upload:  validate → [optimize on pool] → store.write
//! get:     validate → store.locate → no size? original
//!                                  → derive_key → cache.get → hit? cached file
//!                                                            → store.read → resize on pool → cache.put
//! delete:  validate → store.remove → cache.invalidate
//! ```
//!
//! Resizing is CPU-bound and runs on a dedicated rayon pool, bridged back to
//! the async side with a oneshot channel and bounded by a timeout. On timeout
//! the request fails; the pool job runs to completion and its result is
//! dropped. Each job first identifies the source from its header and plans
//! the resize, so a request whose geometry is out of bounds fails before any
//! pixels are decoded.
//!
//! A miss that is still rendering when its original is deleted can finish
//! after the sweep. `get` re-checks the original after writing and drops the
//! derivative it just stored if the original is gone.

use crate::cache::{CacheStats, DerivativeCache, derive_key};
use crate::config::{ServiceConfig, UploadConfig, effective_threads};
use crate::error::{ImageError, Result};
use crate::imaging::calculations::plan_resize;
use crate::imaging::{
    BackendError, Fit, ImageBackend, MAX_DIMENSION, OutputFormat, Quality, ResizeOptions, ResizeParams,
};
use crate::naming;
use crate::store::ImageStore;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// An uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Client-side filename; only its extension is kept.
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Per-request overrides of the `[upload]` config section.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    pub optimize: Option<bool>,
    pub max_width: Option<u32>,
    pub format: Option<OutputFormat>,
    pub quality: Option<Quality>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedImage {
    pub filename: String,
    pub original_filename: String,
    /// Public URL path, e.g. `/public/images/3f2a9c1d-1700000000000.jpg`.
    pub filepath: String,
    #[serde(rename = "mimetype")]
    pub mime_type: String,
    pub size: usize,
}

/// Where the bytes of an [`ImageResponse`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// No resize requested.
    Original,
    /// Served from the derivative cache.
    Cache,
    /// Rendered for this request and now cached.
    Rendered,
}

impl ImageSource {
    /// Value of the `X-Cache` response header.
    pub fn cache_status(self) -> &'static str {
        match self {
            Self::Original => "ORIGINAL",
            Self::Cache => "HIT",
            Self::Rendered => "MISS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub path: PathBuf,
    /// `None` when an original's extension is not a known format.
    pub format: Option<OutputFormat>,
    pub source: ImageSource,
    /// Derivative bytes, already in memory for [`ImageSource::Cache`] and
    /// [`ImageSource::Rendered`].
    pub bytes: Option<Vec<u8>>,
}

impl ImageResponse {
    pub fn mime_type(&self) -> &'static str {
        self.format
            .map(OutputFormat::mime_type)
            .unwrap_or("application/octet-stream")
    }

    /// Response body: the in-memory render if present, else the file on disk.
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        match self.bytes {
            Some(bytes) => Ok(bytes),
            None => Ok(tokio::fs::read(&self.path).await?),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeleteReport {
    pub filename: String,
    pub derivatives_removed: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ListedImage {
    pub filename: String,
    pub url: String,
}

/// Create `public/`, `public/images/` and `public/cache/` under `root`.
///
/// Idempotent. Each directory actually created is logged.
pub async fn ensure_directories(root: &Path) -> io::Result<()> {
    let public = root.join("public");
    for dir in [public.clone(), public.join("images"), public.join("cache")] {
        if !tokio::fs::try_exists(&dir).await? {
            tokio::fs::create_dir_all(&dir).await?;
            info!(dir = %dir.display(), "created directory");
        }
    }
    Ok(())
}

pub struct ImageService {
    root: PathBuf,
    store: ImageStore,
    cache: DerivativeCache,
    backend: Arc<dyn ImageBackend>,
    pool: Arc<rayon::ThreadPool>,
    upload: UploadConfig,
    timeout: Duration,
}

impl ImageService {
    /// Create the storage directories, load the cache index and start the
    /// resize pool.
    pub async fn open(config: &ServiceConfig, backend: Arc<dyn ImageBackend>) -> Result<Self> {
        let root = config.storage.root.clone();
        ensure_directories(&root).await?;

        let cache = DerivativeCache::open(config.cache_dir(), config.cache.max_bytes).await?;
        let threads = effective_threads(&config.processing);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("resize-{i}"))
            .build()
            .map_err(io::Error::other)?;
        info!(threads, root = %root.display(), "image service ready");

        Ok(Self {
            store: ImageStore::new(config.images_dir()),
            cache,
            backend,
            pool: Arc::new(pool),
            upload: config.upload.clone(),
            timeout: config.processing.timeout(),
            root,
        })
    }

    /// Override the per-resize timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn cache(&self) -> &DerivativeCache {
        &self.cache
    }

    /// Largest accepted upload, from `upload.max_bytes`.
    pub fn max_upload_bytes(&self) -> usize {
        self.upload.max_bytes
    }

    /// Validate, optionally optimize, and persist an upload under a fresh name.
    ///
    /// Optimization failures abort the upload; nothing is written.
    pub async fn upload(&self, file: UploadFile, options: &UploadOptions) -> Result<UploadedImage> {
        let UploadFile {
            name,
            mime_type,
            bytes,
        } = file;

        if !mime_type.starts_with("image/") {
            return Err(ImageError::Validation(
                "Please upload a valid image file".into(),
            ));
        }
        if bytes.is_empty() {
            return Err(ImageError::Validation("No image uploaded".into()));
        }
        if bytes.len() > self.upload.max_bytes {
            return Err(ImageError::Validation(format!(
                "Image size should not exceed {} bytes",
                self.upload.max_bytes
            )));
        }

        let optimize = options.optimize.unwrap_or(self.upload.optimize);
        let (bytes, format) = if optimize {
            let max_width = options.max_width.unwrap_or(self.upload.max_width);
            if max_width == 0 || max_width > MAX_DIMENSION {
                return Err(ImageError::Validation(format!(
                    "maxWidth must be between 1 and {MAX_DIMENSION}"
                )));
            }
            let format = options.format.unwrap_or(self.upload.format);
            let resize = ResizeOptions {
                format: Some(format),
                quality: options
                    .quality
                    .unwrap_or_else(|| Quality::new(self.upload.quality)),
                fit: Fit::Inside,
                without_enlargement: true,
                ..ResizeOptions::default()
            };
            let params = ResizeParams::new(Some(max_width), None, resize);
            (self.run_resize(bytes, params).await?, Some(format))
        } else {
            (bytes, None)
        };

        let extension = format
            .map(|f| f.extension().to_string())
            .or_else(|| naming::extension_of(&name))
            .or_else(|| format_from_mime(&mime_type).map(|f| f.extension().to_string()));
        let filename = naming::unique_filename(&name, extension.as_deref());

        ensure_directories(&self.root).await?;
        self.store.write(&filename, &bytes).await?;
        info!(filename = %filename, original = %name, size = bytes.len(), optimize, "image uploaded");

        Ok(UploadedImage {
            filepath: ImageStore::public_path(&filename),
            filename,
            original_filename: name,
            mime_type: format
                .map(|f| f.mime_type().to_string())
                .unwrap_or(mime_type),
            size: bytes.len(),
        })
    }

    /// Resolve an original or one of its derivatives.
    ///
    /// With neither `width` nor `height` the original is returned untouched.
    /// Otherwise the output format is resolved (requested, else the
    /// original's, else JPEG) before the cache key is derived, so a request
    /// that spells out the default format shares the cache entry.
    pub async fn get(
        &self,
        filename: &str,
        width: Option<u32>,
        height: Option<u32>,
        options: &ResizeOptions,
    ) -> Result<ImageResponse> {
        let path = self.store.locate(filename).await?;
        let original_format =
            naming::extension_of(filename).and_then(|ext| OutputFormat::from_extension(&ext));

        if width.is_none() && height.is_none() {
            return Ok(ImageResponse {
                path,
                format: original_format,
                source: ImageSource::Original,
                bytes: None,
            });
        }

        let format = options
            .format
            .or(original_format)
            .unwrap_or(OutputFormat::Jpeg);
        let options = ResizeOptions {
            format: Some(format),
            ..*options
        };
        let params = ResizeParams::new(width, height, options);
        params.validate()?;

        let key = derive_key(&ImageStore::public_path(filename), width, height, &options);
        let lookup = self.cache.get(&key, format).await?;
        if let Some(bytes) = lookup.bytes {
            debug!(filename, key = %key, "derivative cache hit");
            return Ok(ImageResponse {
                path: lookup.path,
                format: Some(format),
                source: ImageSource::Cache,
                bytes: Some(bytes),
            });
        }

        debug!(filename, key = %key, ?width, ?height, %format, "rendering derivative");
        let source = self.store.read(filename).await?;
        let rendered = self.run_resize(source, params).await?;
        let path = self.cache.put(&key, format, &rendered, filename).await?;

        if !self.store.exists(filename).await? {
            self.cache.invalidate(filename).await;
            return Err(ImageError::NotFound("Image not found".into()));
        }

        Ok(ImageResponse {
            path,
            format: Some(format),
            source: ImageSource::Rendered,
            bytes: Some(rendered),
        })
    }

    /// Delete an original and every derivative recorded for it.
    ///
    /// Derivative removal is best-effort; failures are logged by the cache.
    pub async fn delete(&self, filename: &str) -> Result<DeleteReport> {
        self.store.remove(filename).await?;
        let derivatives_removed = self.cache.invalidate(filename).await;
        info!(filename, derivatives_removed, "image deleted");
        Ok(DeleteReport {
            filename: filename.to_string(),
            derivatives_removed,
        })
    }

    /// Stored originals, sorted by filename.
    pub async fn list(&self) -> Result<Vec<ListedImage>> {
        let names = self.store.list().await?;
        Ok(names
            .into_iter()
            .map(|filename| ListedImage {
                url: ImageStore::public_path(&filename),
                filename,
            })
            .collect())
    }

    /// Store `bytes` under a caller-chosen filename, scaled down to at most
    /// `max_width`. The output format follows the filename's extension.
    pub async fn import(&self, filename: &str, bytes: Vec<u8>, max_width: u32) -> Result<PathBuf> {
        naming::validate_filename(filename)?;
        let format = naming::extension_of(filename)
            .and_then(|ext| OutputFormat::from_extension(&ext))
            .unwrap_or(OutputFormat::Jpeg);
        let options = ResizeOptions {
            format: Some(format),
            quality: Quality::new(self.upload.quality),
            fit: Fit::Inside,
            without_enlargement: true,
            ..ResizeOptions::default()
        };
        let optimized = self
            .run_resize(bytes, ResizeParams::new(Some(max_width), None, options))
            .await?;

        ensure_directories(&self.root).await?;
        let path = self.store.write(filename, &optimized).await?;
        info!(filename, size = optimized.len(), "image imported");
        Ok(path)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Run one resize on the worker pool, bounded by the configured timeout.
    async fn run_resize(&self, bytes: Vec<u8>, params: ResizeParams) -> Result<Vec<u8>> {
        let backend = Arc::clone(&self.backend);
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let result = checked_resize(backend.as_ref(), &bytes, &params);
            // Receiver is gone if the request already timed out.
            let _ = tx.send(result);
        });

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(ImageError::ImageProcessing(
                "resize worker exited without a result".into(),
            )),
            Err(_) => Err(ImageError::ImageProcessing(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

/// Identify `bytes`, check the planned geometry, then resize.
fn checked_resize(
    backend: &dyn ImageBackend,
    bytes: &[u8],
    params: &ResizeParams,
) -> std::result::Result<Vec<u8>, BackendError> {
    params.validate()?;
    let info = backend.identify(bytes)?;
    plan_resize(
        (info.width, info.height),
        params.width,
        params.height,
        params.options.fit,
        params.options.without_enlargement,
    )
    .check_limits()?;
    backend.resize(bytes, params)
}

fn format_from_mime(mime_type: &str) -> Option<OutputFormat> {
    mime_type
        .strip_prefix("image/")
        .and_then(OutputFormat::from_extension)
}
