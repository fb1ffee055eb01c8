//! # Storefront Images
//!
//! Image storage and on-demand resizing for a storefront backend. Admins
//! upload product photos; clients fetch them at whatever size and format the
//! page needs, and every derivative is rendered once and then served from a
//! filesystem cache.
//!
//! # Request Flow
//!
//! ```text
//! GET /images/shoes.jpg?width=200&height=200&format=webp&quality=70
//!   http     parse query → ResizeOptions
//!   service  validate name → locate original
//!   cache    derive_key(path, 200, 200, options) → public/cache/{key}.webp exists?
//!   imaging  (miss) decode → cover-crop → encode WebP, on the resize pool
//!   cache    atomic write + record in reverse index
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`store`] | Originals under `public/images/`, atomic writes, listing |
//! | [`cache`] | Derivative keys, `public/cache/` storage, reverse index, optional LRU budget |
//! | [`imaging`] | Pure-Rust resize/encode behind the [`imaging::ImageBackend`] trait |
//! | [`service`] | Upload / get / delete / list orchestration and the resize worker pool |
//! | [`http`] | axum router, JSON envelope, admin JWT guard |
//! | [`config`] | `config.toml` loading, validation, environment overrides |
//! | [`naming`] | Generated upload filenames and path-traversal checks |
//! | [`error`] | [`error::ImageError`], shared by every layer below `http` |
//! | [`seed`] | Demo product image downloader |
//!
//! # Design Decisions
//!
//! ## Filesystem as the Only State
//!
//! Originals, derivatives and the cache index all live on disk. The process
//! holds no authoritative in-memory state, so a restart loses nothing but hit
//! counters.
//!
//! ## Explicit Invalidation
//!
//! Deleting an original removes exactly the derivatives recorded for it in the
//! cache's reverse index. Nothing is matched by filename patterns, so an image
//! named `foo.jpg` can never take `foobar.jpg`'s thumbnails with it.
//!
//! ## Pure-Rust Imaging
//!
//! The [`imaging`] module uses the `image` crate (Lanczos3 resampling, rav1e
//! for AVIF). No system libraries, so the binary runs anywhere it is copied.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod imaging;
pub mod naming;
pub mod seed;
pub mod service;
pub mod store;
