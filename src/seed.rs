//! Demo product images.
//!
//! Downloads a fixed set of product photos into the image store so a fresh
//! deployment has something to show. Files that already exist are left
//! alone, and a failed download is logged and skipped rather than aborting
//! the batch.

use crate::error::ImageError;
use crate::service::ImageService;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Width the seeded images are scaled down to.
pub const SEED_MAX_WIDTH: u32 = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedImage {
    pub name: &'static str,
    pub url: &'static str,
}

pub const PRODUCT_IMAGES: &[SeedImage] = &[
    SeedImage {
        name: "smartphone.jpg",
        url: "https://images.unsplash.com/photo-1598327105666-5b89351aff97?w=500&q=80",
    },
    SeedImage {
        name: "laptop.jpg",
        url: "https://images.unsplash.com/photo-1496181133206-80ce9b88a853?w=500&q=80",
    },
    SeedImage {
        name: "headphones.jpg",
        url: "https://images.unsplash.com/photo-1505740420928-5e560c06d30e?w=500&q=80",
    },
    SeedImage {
        name: "shoes.jpg",
        url: "https://images.unsplash.com/photo-1542291026-7eec264c27ff?w=500&q=80",
    },
    SeedImage {
        name: "coffeemaker.jpg",
        url: "https://images.unsplash.com/photo-1570087935000-74a3c7319b75?w=500&q=80",
    },
    SeedImage {
        name: "no-image.jpg",
        url: "https://upload.wikimedia.org/wikipedia/commons/thumb/6/65/No-Image-Placeholder.svg/495px-No-Image-Placeholder.svg.png?20200912122019",
    },
    SeedImage {
        name: "watch.jpg",
        url: "https://images.unsplash.com/photo-1523275335684-37898b6baf30?w=500&q=80",
    },
    SeedImage {
        name: "tablet.jpg",
        url: "https://images.unsplash.com/photo-1585790050230-5dd28404ccb9?w=500&q=80",
    },
];

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} fetching {url}")]
    Status { status: u16, url: String },
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Outcome of a seeding run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub downloaded: Vec<String>,
    pub skipped: Vec<String>,
    /// `(filename, error message)`
    pub failed: Vec<(String, String)>,
}

impl fmt::Display for SeedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} downloaded, {} already present",
            self.downloaded.len(),
            self.skipped.len()
        )?;
        if !self.failed.is_empty() {
            write!(f, ", {} failed", self.failed.len())?;
        }
        Ok(())
    }
}

/// Downloads over HTTPS with a per-request timeout.
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(timeout: Duration) -> Result<Self, SeedError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, SeedError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SeedError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Seed [`PRODUCT_IMAGES`] from the network.
pub async fn seed_product_images(service: &ImageService) -> Result<SeedReport, SeedError> {
    let downloader = Downloader::new(Duration::from_secs(30))?;
    Ok(seed_images(service, PRODUCT_IMAGES, |url| downloader.fetch(url)).await)
}

/// Import each missing image in `images`, fetching bytes with `fetch`.
pub async fn seed_images<'a, F, Fut>(
    service: &ImageService,
    images: &'a [SeedImage],
    fetch: F,
) -> SeedReport
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = Result<Vec<u8>, SeedError>>,
{
    let mut report = SeedReport::default();

    for image in images {
        match service.store().exists(image.name).await {
            Ok(true) => {
                info!(image = image.name, "already exists, skipping");
                report.skipped.push(image.name.to_string());
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(image = image.name, error = %e, "cannot check image");
                report.failed.push((image.name.to_string(), e.to_string()));
                continue;
            }
        }

        info!(image = image.name, url = image.url, "downloading");
        let result = match fetch(image.url).await {
            Ok(bytes) => service
                .import(image.name, bytes, SEED_MAX_WIDTH)
                .await
                .map(|_| ())
                .map_err(SeedError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => report.downloaded.push(image.name.to_string()),
            Err(e) => {
                warn!(image = image.name, error = %e, "seeding failed");
                report.failed.push((image.name.to_string(), e.to_string()));
            }
        }
    }

    info!(%report, "seeding finished");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::imaging::RustBackend;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    async fn service() -> (TempDir, ImageService) {
        let tmp = TempDir::new().unwrap();
        let mut config = ServiceConfig::default();
        config.storage.root = tmp.path().to_path_buf();
        config.processing.max_workers = Some(1);
        let service = ImageService::open(&config, Arc::new(RustBackend::new()))
            .await
            .unwrap();
        (tmp, service)
    }

    const TWO: &[SeedImage] = &[
        SeedImage {
            name: "wide.jpg",
            url: "https://example.test/wide",
        },
        SeedImage {
            name: "broken.jpg",
            url: "https://example.test/broken",
        },
    ];

    #[test]
    fn product_set_is_complete() {
        let names: Vec<_> = PRODUCT_IMAGES.iter().map(|i| i.name).collect();
        assert_eq!(
            names,
            vec![
                "smartphone.jpg",
                "laptop.jpg",
                "headphones.jpg",
                "shoes.jpg",
                "coffeemaker.jpg",
                "no-image.jpg",
                "watch.jpg",
                "tablet.jpg"
            ]
        );
    }

    #[tokio::test]
    async fn seeds_missing_and_reports_failures() {
        let (_tmp, service) = service().await;

        let report = seed_images(&service, TWO, |url| async move {
            if url.ends_with("wide") {
                Ok(png(1600, 400))
            } else {
                Err(SeedError::Status {
                    status: 404,
                    url: url.to_string(),
                })
            }
        })
        .await;

        assert_eq!(report.downloaded, vec!["wide.jpg"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken.jpg");
        assert_eq!(report.to_string(), "1 downloaded, 0 already present, 1 failed");

        let stored = image::load_from_memory(&service.store().read("wide.jpg").await.unwrap())
            .unwrap();
        assert_eq!((stored.width(), stored.height()), (SEED_MAX_WIDTH, 200));
    }

    #[tokio::test]
    async fn existing_images_are_skipped() {
        let (_tmp, service) = service().await;
        service.store().write("wide.jpg", b"keep me").await.unwrap();

        let fetches = AtomicUsize::new(0);
        let report = seed_images(&service, &TWO[..1], |_| {
            fetches.fetch_add(1, Ordering::SeqCst);
            async { Ok(png(10, 10)) }
        })
        .await;

        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert_eq!(report.skipped, vec!["wide.jpg"]);
        assert_eq!(service.store().read("wide.jpg").await.unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn undecodable_download_is_a_failure() {
        let (_tmp, service) = service().await;
        let report = seed_images(&service, &TWO[..1], |_| async { Ok(b"<html>".to_vec()) }).await;
        assert!(report.downloaded.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(!service.store().exists("wide.jpg").await.unwrap());
    }
}
