//! Service configuration.
//!
//! Handles loading, validating, and merging `config.toml`. Stock defaults are
//! serialized to a TOML table, the user file is merged on top, and the result
//! is deserialized and validated. A couple of deployment knobs can also come
//! from the environment (`PORT`, `JWT_SECRET`), which wins over the file.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [server]
//! host = "0.0.0.0"
//! port = 3000
//!
//! [storage]
//! root = "."                # public/images and public/cache live under here
//!
//! [upload]
//! max_bytes = 5242880       # 5 MiB
//! optimize = true           # Re-encode uploads before storing
//! max_width = 1200          # Optimization width ceiling
//! format = "jpeg"           # Optimization output format
//! quality = 80
//!
//! [cache]
//! # max_bytes = 1073741824  # Omit for an unbounded cache
//!
//! [processing]
//! # max_workers = 4         # Omit for auto = CPU cores
//! timeout_secs = 30
//!
//! [auth]
//! # jwt_secret = "..."      # Or set JWT_SECRET
//! ```
//!
//! Config files are sparse: override just the values you want. Unknown keys
//! are rejected to catch typos early.

use crate::imaging::{OutputFormat, Quality};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Service configuration loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub cache: CacheConfig,
    pub processing: ProcessingConfig,
    pub auth: AuthConfig,
}

impl ServiceConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.max_bytes == 0 {
            return Err(ConfigError::Validation(
                "upload.max_bytes must be positive".into(),
            ));
        }
        if self.upload.max_width == 0 || self.upload.max_width > crate::imaging::MAX_DIMENSION {
            return Err(ConfigError::Validation(format!(
                "upload.max_width must be 1-{}",
                crate::imaging::MAX_DIMENSION
            )));
        }
        if !(1..=100).contains(&self.upload.quality) {
            return Err(ConfigError::Validation(
                "upload.quality must be 1-100".into(),
            ));
        }
        if self.processing.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "processing.timeout_secs must be positive".into(),
            ));
        }
        if self.processing.max_workers == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_workers must be positive".into(),
            ));
        }
        if self.cache.max_bytes == Some(0) {
            return Err(ConfigError::Validation(
                "cache.max_bytes must be positive (omit it for no limit)".into(),
            ));
        }
        if self.auth.jwt_secret.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Validation(
                "auth.jwt_secret must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding stored originals.
    pub fn images_dir(&self) -> PathBuf {
        self.storage.root.join("public").join("images")
    }

    /// Directory holding cached derivatives.
    pub fn cache_dir(&self) -> PathBuf {
        self.storage.root.join("public").join("cache")
    }

    /// Apply `PORT` and `JWT_SECRET` overrides, looking variables up through
    /// `lookup` (`|k| std::env::var(k).ok()` outside tests).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| ConfigError::Validation(format!("Invalid PORT value: {e}")))?;
            info!(port = self.server.port, "port taken from PORT");
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            if secret.is_empty() {
                warn!("JWT_SECRET is set but empty, ignoring");
            } else {
                self.auth.jwt_secret = Some(secret);
                info!("JWT secret taken from JWT_SECRET");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Base directory; `public/images/` and `public/cache/` are created under it.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
        }
    }
}

/// Upload acceptance and optimization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Largest accepted upload in bytes.
    pub max_bytes: usize,
    /// Re-encode uploads before storing them.
    pub optimize: bool,
    /// Width ceiling for optimized uploads. Smaller images are not enlarged.
    pub max_width: u32,
    pub format: OutputFormat,
    pub quality: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            optimize: true,
            max_width: 1200,
            format: OutputFormat::Jpeg,
            quality: Quality::default().value(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Byte budget for cached derivatives. When absent the cache is unbounded.
    pub max_bytes: Option<u64>,
}

/// Parallel processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel resize workers.
    /// When absent or null, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_workers: Option<usize>,
    /// Upper bound on a single resize, in seconds.
    pub timeout_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            timeout_secs: 30,
        }
    }
}

impl ProcessingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_workers.map(|n| n.min(cores)).unwrap_or(cores)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// HS256 secret shared with the service that issues tokens.
    pub jwt_secret: Option<String>,
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    toml::Value::try_from(ServiceConfig::default())
        .map_err(|e| ConfigError::Validation(format!("default config must serialize: {e}")))
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<ServiceConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: ServiceConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `path`, falling back to stock defaults when it is absent.
///
/// Environment overrides are not applied here; see [`ServiceConfig::apply_env`].
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_config(path)?;
    if overlay.is_none() {
        info!(path = %path.display(), "no config file, using defaults");
    }
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Storefront Images Configuration
# ===============================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Unknown keys will cause an error.
# PORT and JWT_SECRET in the environment override the values here.

# ---------------------------------------------------------------------------
# HTTP server
# ---------------------------------------------------------------------------
[server]
host = "0.0.0.0"
port = 3000

# ---------------------------------------------------------------------------
# Storage
# ---------------------------------------------------------------------------
[storage]
# Originals go to <root>/public/images, derivatives to <root>/public/cache.
root = "."

# ---------------------------------------------------------------------------
# Uploads
# ---------------------------------------------------------------------------
[upload]
# Largest accepted upload in bytes (5 MiB).
max_bytes = 5242880

# Re-encode uploads before storing. A request can turn this off per upload.
optimize = true

# Optimized uploads are scaled down to at most this width. Never enlarged.
max_width = 1200

# Output format for optimized uploads: jpeg, png, webp, gif, avif.
format = "jpeg"

# Lossy encoding quality (1 = worst, 100 = best).
quality = 80

# ---------------------------------------------------------------------------
# Derivative cache
# ---------------------------------------------------------------------------
[cache]
# Total byte budget for cached derivatives. Least recently used entries are
# evicted once it is exceeded. Omit for an unbounded cache.
# max_bytes = 1073741824

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel resize workers.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_workers = 4

# A resize taking longer than this fails the request.
timeout_secs = 30

# ---------------------------------------------------------------------------
# Auth
# ---------------------------------------------------------------------------
[auth]
# HS256 secret used to verify bearer tokens on admin routes.
# Without it every admin route answers 401.
# jwt_secret = "change-me"
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn default_config_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.upload.max_bytes, 5_242_880);
        assert_eq!(config.upload.max_width, 1200);
        assert!(config.upload.optimize);
        assert_eq!(config.upload.format, OutputFormat::Jpeg);
        assert_eq!(config.upload.quality, 80);
        assert_eq!(config.cache.max_bytes, None);
        assert_eq!(config.processing.timeout_secs, 30);
        assert_eq!(config.auth.jwt_secret, None);
    }

    #[test]
    fn directories_derive_from_root() {
        let mut config = ServiceConfig::default();
        config.storage.root = PathBuf::from("/srv/shop");
        assert_eq!(config.images_dir(), PathBuf::from("/srv/shop/public/images"));
        assert_eq!(config.cache_dir(), PathBuf::from("/srv/shop/public/cache"));
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[upload]
max_width = 800
format = "webp"
"#;
        let config: ServiceConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.upload.max_width, 800);
        assert_eq!(config.upload.format, OutputFormat::Webp);
        // Defaults preserved
        assert_eq!(config.upload.quality, 80);
        assert_eq!(config.server.port, 3000);
    }

    // =========================================================================
    // load_config tests
    // =========================================================================

    #[test]
    fn load_config_returns_default_when_no_file() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[server]
port = 8080

[cache]
max_bytes = 1000000
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cache.max_bytes, Some(1_000_000));
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn load_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "this is not valid toml [[[").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn load_config_validates_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[upload]\nquality = 200\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Validation(_))));
    }

    // =========================================================================
    // Unknown key rejection tests
    // =========================================================================

    #[test]
    fn unknown_key_rejected() {
        let result: Result<ServiceConfig, _> = toml::from_str("[upload]\nmax_widht = 90\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("unknown field"), "{err}");
    }

    #[test]
    fn unknown_section_rejected() {
        let result: Result<ServiceConfig, _> = toml::from_str("[uploads]\nmax_width = 90\n");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_format_rejected() {
        let result: Result<ServiceConfig, _> = toml::from_str("[upload]\nformat = \"tiff\"\n");
        assert!(result.is_err());
    }

    // =========================================================================
    // Validation tests
    // =========================================================================

    #[test]
    fn validate_default_config_passes() {
        assert!(ServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_quality_bounds() {
        let mut config = ServiceConfig::default();
        config.upload.quality = 0;
        assert!(config.validate().is_err());
        config.upload.quality = 100;
        assert!(config.validate().is_ok());
        config.upload.quality = 101;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("quality"));
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = ServiceConfig::default();
        config.upload.max_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.processing.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.cache.max_bytes = Some(0);
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.processing.max_workers = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_max_width_ceiling() {
        let mut config = ServiceConfig::default();
        config.upload.max_width = crate::imaging::MAX_DIMENSION + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_secret() {
        let mut config = ServiceConfig::default();
        config.auth.jwt_secret = Some(String::new());
        assert!(config.validate().is_err());
    }

    // =========================================================================
    // Environment overrides
    // =========================================================================

    #[test]
    fn env_overrides_port_and_secret() {
        let mut config = ServiceConfig::default();
        config
            .apply_env(env(&[("PORT", "8081"), ("JWT_SECRET", "s3cret")]))
            .unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn env_invalid_port_is_error() {
        let mut config = ServiceConfig::default();
        let result = config.apply_env(env(&[("PORT", "eighty")]));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn env_empty_secret_is_ignored() {
        let mut config = ServiceConfig::default();
        config.auth.jwt_secret = Some("from-file".into());
        config.apply_env(env(&[("JWT_SECRET", "")])).unwrap();
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("from-file"));
    }

    // =========================================================================
    // Processing config tests
    // =========================================================================

    #[test]
    fn effective_threads_auto() {
        let config = ProcessingConfig::default();
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(effective_threads(&config), cores);
    }

    #[test]
    fn effective_threads_clamped_to_cores() {
        let config = ProcessingConfig {
            max_workers: Some(99999),
            ..ProcessingConfig::default()
        };
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(effective_threads(&config), cores);
    }

    #[test]
    fn effective_threads_user_constrains_down() {
        let config = ProcessingConfig {
            max_workers: Some(1),
            ..ProcessingConfig::default()
        };
        assert_eq!(effective_threads(&config), 1);
    }

    // =========================================================================
    // merge_toml tests
    // =========================================================================

    #[test]
    fn merge_toml_table_merge() {
        let base: toml::Value = toml::from_str("[upload]\nmax_width = 1200\nquality = 80\n").unwrap();
        let overlay: toml::Value = toml::from_str("[upload]\nquality = 70\n").unwrap();
        let merged = merge_toml(base, overlay);
        let upload = merged.get("upload").unwrap();
        assert_eq!(upload.get("quality").unwrap().as_integer(), Some(70));
        assert_eq!(upload.get("max_width").unwrap().as_integer(), Some(1200));
    }

    #[test]
    fn merge_toml_scalar_replaces() {
        let base: toml::Value = toml::from_str("a = 1\nb = 2\n").unwrap();
        let overlay: toml::Value = toml::from_str("a = 10\n").unwrap();
        let merged = merge_toml(base, overlay);
        assert_eq!(merged.get("a").unwrap().as_integer(), Some(10));
        assert_eq!(merged.get("b").unwrap().as_integer(), Some(2));
    }

    #[test]
    fn resolve_config_with_overlay() {
        let base = stock_defaults_value().unwrap();
        let overlay: toml::Value = toml::from_str("[processing]\ntimeout_secs = 5\n").unwrap();
        let config = resolve_config(base, Some(overlay)).unwrap();
        assert_eq!(config.processing.timeout_secs, 5);
        assert_eq!(config.upload.max_width, 1200);
    }

    #[test]
    fn stock_defaults_value_has_all_sections() {
        let val = stock_defaults_value().unwrap();
        for section in ["server", "storage", "upload", "cache", "processing", "auth"] {
            assert!(val.get(section).is_some(), "missing [{section}]");
        }
    }

    // =========================================================================
    // stock_config_toml tests
    // =========================================================================

    #[test]
    fn stock_config_toml_roundtrips_to_defaults() {
        let config: ServiceConfig = toml::from_str(stock_config_toml()).unwrap();
        let defaults = ServiceConfig::default();
        assert_eq!(config.server.port, defaults.server.port);
        assert_eq!(config.upload.max_bytes, defaults.upload.max_bytes);
        assert_eq!(config.upload.format, defaults.upload.format);
        assert_eq!(config.processing.timeout_secs, defaults.processing.timeout_secs);
        assert_eq!(config.cache.max_bytes, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn stock_config_toml_contains_all_sections() {
        let content = stock_config_toml();
        for section in ["[server]", "[storage]", "[upload]", "[cache]", "[processing]", "[auth]"] {
            assert!(content.contains(section), "missing {section}");
        }
    }
}
