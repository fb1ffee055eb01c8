//! HTTP surface.
//!
//! | Method | Path | Auth | Response |
//! |---|---|---|---|
//! | GET | `/images` | - | `{success, count, data: [{filename, url}]}` |
//! | GET | `/images/{filename}` | - | image bytes, `X-Cache: HIT\|MISS\|ORIGINAL` |
//! | POST | `/images/upload` | admin | `{success, data: UploadedImage}` |
//! | DELETE | `/images/{filename}` | admin | `{success, data: DeleteReport}` |
//! | GET | `/images/cache/stats` | admin | `{success, data: CacheStats}` |
//! | GET | `/public/images/*` | - | originals, served statically |
//!
//! Every error renders as `{"success": false, "error": message}`.
//!
//! Admin routes expect `Authorization: Bearer <jwt>` signed with HS256 by the
//! account service, carrying `{id, role, exp}`. Without a configured secret
//! every admin request is rejected with 401.

use crate::config::ServiceConfig;
use crate::error::ImageError;
use crate::imaging::{Fit, MAX_DIMENSION, OutputFormat, Position, Quality, ResizeOptions};
use crate::service::{ImageService, UploadFile, UploadOptions};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::QueryRejection;
use axum::extract::{DefaultBodyLimit, FromRef, FromRequestParts, Multipart, Path, Query, State};
use axum::http::header::{self, HeaderName};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Derivatives never change under a given URL, so clients may keep them.
const CACHE_CONTROL: &str = "public, max-age=31536000";

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Body allowance on top of `upload.max_bytes` for multipart framing and
/// text fields, so an oversized file reaches the service's own size check.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("Not authorized to access this route")]
    Unauthorized,
    #[error("User role {0} is not authorized to access this route")]
    Forbidden(String),
    #[error("{0}")]
    Multipart(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Image(ImageError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Image(ImageError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Image(ImageError::ImageProcessing(_) | ImageError::Io(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Multipart(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::Multipart(err.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(err: MultipartRejection) -> Self {
        Self::Multipart(err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Image(ImageError::Io(e)) => {
                error!(error = %e, "request failed with an IO error");
                "Internal server error".to_string()
            }
            other => {
                if status.is_server_error() {
                    error!(error = %other, "request failed");
                }
                other.to_string()
            }
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

/// Claims carried by tokens from the account service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub id: String,
    pub role: String,
    pub exp: u64,
}

/// HS256 bearer-token verifier.
pub struct JwtVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let Some(key) = &self.key else {
            debug!("rejecting token: no JWT secret configured");
            return Err(ApiError::Unauthorized);
        };
        decode::<Claims>(token, key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "rejecting token");
                ApiError::Unauthorized
            })
    }
}

/// Extractor for routes restricted to the `admin` role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub Claims);

impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized)?;

        let claims = Arc::<JwtVerifier>::from_ref(state).verify(token)?;
        if claims.role != "admin" {
            debug!(user = %claims.id, role = %claims.role, "admin access denied");
            return Err(ApiError::Forbidden(claims.role));
        }
        Ok(Self(claims))
    }
}

#[derive(Clone, FromRef)]
pub struct AppState {
    pub images: Arc<ImageService>,
    pub auth: Arc<JwtVerifier>,
}

impl AppState {
    pub fn new(images: ImageService, jwt_secret: Option<&str>) -> Self {
        Self {
            images: Arc::new(images),
            auth: Arc::new(JwtVerifier::new(jwt_secret)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));
    let body_limit = state.images.max_upload_bytes() + MULTIPART_OVERHEAD;
    let originals = ServeDir::new(state.images.store().dir());

    Router::new()
        .route("/images", get(list_images))
        .route("/images/upload", post(upload_image))
        .route("/images/cache/stats", get(cache_stats))
        .route("/images/{filename}", get(get_image).delete(delete_image))
        .nest_service("/public/images", originals)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind to the configured address and serve until Ctrl+C or SIGTERM.
pub async fn serve(config: &ServiceConfig, images: ImageService) -> io::Result<()> {
    if config.auth.jwt_secret.is_none() {
        warn!("no JWT secret configured; admin routes will reject every request");
    }
    let state = AppState::new(images, config.auth.jwt_secret.as_deref());
    let app = router(state);

    let address = config.server.address();
    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                warn!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_images(State(images): State<Arc<ImageService>>) -> Result<Response, ApiError> {
    let listed = images.list().await?;
    Ok(Json(json!({
        "success": true,
        "count": listed.len(),
        "data": listed,
    }))
    .into_response())
}

/// Raw query string values; parsed by [`ImageQuery::resolve`] so that bad
/// values surface as validation errors in the JSON envelope.
#[derive(Debug, Default, Deserialize)]
pub struct ImageQuery {
    pub width: Option<String>,
    pub height: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
    pub fit: Option<String>,
    pub position: Option<String>,
}

/// Empty strings count as absent, matching `?width=&height=200`.
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_dimension(name: &str, value: Option<&str>) -> Result<Option<u32>, ImageError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    match raw.parse::<u32>() {
        Ok(v) if (1..=MAX_DIMENSION).contains(&v) => Ok(Some(v)),
        _ => Err(ImageError::Validation(format!(
            "{name} must be an integer between 1 and {MAX_DIMENSION}"
        ))),
    }
}

fn parse_quality(value: Option<&str>) -> Result<Option<Quality>, ImageError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    match raw.parse::<u32>() {
        Ok(v) if (1..=100).contains(&v) => Ok(Some(Quality::new(v))),
        _ => Err(ImageError::Validation(
            "quality must be an integer between 1 and 100".into(),
        )),
    }
}

fn parse_with<T: std::str::FromStr>(value: Option<&str>) -> Result<Option<T>, ImageError>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| raw.parse::<T>())
        .transpose()
        .map_err(|e| ImageError::Validation(e.to_string()))
}

impl ImageQuery {
    /// Parse into target dimensions and transform options.
    pub fn resolve(&self) -> Result<(Option<u32>, Option<u32>, ResizeOptions), ImageError> {
        let width = parse_dimension("width", present(&self.width))?;
        let height = parse_dimension("height", present(&self.height))?;
        let mut options = ResizeOptions {
            format: parse_with::<OutputFormat>(present(&self.format))?,
            ..ResizeOptions::default()
        };
        if let Some(quality) = parse_quality(present(&self.quality))? {
            options.quality = quality;
        }
        if let Some(fit) = parse_with::<Fit>(present(&self.fit))? {
            options.fit = fit;
        }
        if let Some(position) = parse_with::<Position>(present(&self.position))? {
            options.position = position;
        }
        Ok((width, height, options))
    }
}

async fn get_image(
    State(images): State<Arc<ImageService>>,
    Path(filename): Path<String>,
    query: Result<Query<ImageQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| ImageError::Validation(e.body_text()))?;
    let (width, height, options) = query.resolve()?;

    let response = images.get(&filename, width, height, &options).await?;
    let mime = response.mime_type();
    let cache_status = response.source.cache_status();
    let body = response.into_bytes().await?;

    Ok((
        [
            (header::CONTENT_TYPE, mime),
            (header::CACHE_CONTROL, CACHE_CONTROL),
            (X_CACHE, cache_status),
        ],
        body,
    )
        .into_response())
}

fn parse_flag(value: &str) -> Result<bool, ImageError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ImageError::Validation(format!(
            "optimize must be true or false, got '{other}'"
        ))),
    }
}

async fn upload_image(
    State(images): State<Arc<ImageService>>,
    AdminUser(admin): AdminUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut multipart = multipart?;
    let mut file = None;
    let mut options = UploadOptions::default();

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            "image" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await?;
                file = Some(UploadFile {
                    name: file_name,
                    mime_type,
                    bytes: bytes.to_vec(),
                });
            }
            "optimize" => options.optimize = Some(parse_flag(&field.text().await?)?),
            "maxWidth" => {
                let text = field.text().await?;
                options.max_width = parse_dimension("maxWidth", Some(text.trim()))?;
            }
            "format" => {
                let text = field.text().await?;
                options.format = parse_with::<OutputFormat>(present(&Some(text)))?;
            }
            "quality" => {
                let text = field.text().await?;
                options.quality = parse_quality(Some(text.trim()))?;
            }
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    let file = file.ok_or_else(|| ImageError::Validation("No image uploaded".into()))?;
    debug!(admin = %admin.id, file = %file.name, "upload requested");
    let uploaded = images.upload(file, &options).await?;
    Ok(Json(json!({ "success": true, "data": uploaded })).into_response())
}

async fn delete_image(
    State(images): State<Arc<ImageService>>,
    AdminUser(admin): AdminUser,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    debug!(admin = %admin.id, filename = %filename, "delete requested");
    let report = images.delete(&filename).await?;
    Ok(Json(json!({ "success": true, "data": report })).into_response())
}

async fn cache_stats(
    State(images): State<Arc<ImageService>>,
    _admin: AdminUser,
) -> Result<Response, ApiError> {
    let stats = images.cache_stats().await;
    debug!(%stats, "cache stats requested");
    Ok(Json(json!({ "success": true, "data": stats })).into_response())
}
