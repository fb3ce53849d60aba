//! Configuration types for welcomer-images
//!
//! The service reads a single TOML file. Every section is optional and falls
//! back to the defaults below, so an empty file is a valid configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Quantizer concurrency used when the configured value is 0.
pub const UNBOUNDED_QUANTIZERS: usize = 1024;

/// Root configuration for the image service
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener configuration
    pub http: HttpConfig,
    /// On-disk locations and access policy
    pub store: StoreConfig,
    /// Resource cache and janitor timings
    pub cache: CacheConfig,
    /// Remote avatar fetching
    pub avatar: AvatarConfig,
    /// GIF quantization limits
    pub quantizer: QuantizerConfig,
    /// Graceful shutdown
    pub shutdown: ShutdownConfig,
    /// Logging
    pub logging: LoggingConfig,
    /// Keys accepted in the `Authorization` header of `POST /images`
    pub api_keys: Vec<String>,
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration file at `path`.
    ///
    /// Returns `Ok(None)` when the file does not exist so the caller can
    /// decide whether defaults are acceptable.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text).map(Some)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.http.listen.trim().is_empty() {
            return Err(Error::Configuration("http.listen must not be empty".into()));
        }
        if self.cache.janitor_interval_secs == 0 {
            return Err(Error::Configuration(
                "cache.janitor_interval_secs must be greater than 0".into(),
            ));
        }
        if !(1..=30).contains(&self.quantizer.speed) {
            return Err(Error::Configuration(format!(
                "quantizer.speed must be within 1..=30, got {}",
                self.quantizer.speed
            )));
        }
        Ok(())
    }

    /// Check an `Authorization` header value against the configured keys.
    #[must_use]
    pub fn is_authorized(&self, api_key: Option<&str>) -> bool {
        if self.store.allow_anonymous_access {
            return true;
        }
        api_key.is_some_and(|key| self.api_keys.iter().any(|k| k == key))
    }
}

/// HTTP listener configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address the HTTP server binds to
    pub listen: String,
    /// Public base URL used to build bookmarkable links
    pub bookmarkable_url: String,
    /// Maximum accepted request body for `POST /images`
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:4999".to_string(),
            bookmarkable_url: "http://localhost:4999".to_string(),
            max_body_bytes: 64 * 1024,
        }
    }
}

/// Paths and access policy
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Folder generated images are written into
    pub store_path: PathBuf,
    /// Location of the embedded artifact index
    pub database_path: PathBuf,
    /// Folder of custom backgrounds, loaded on demand and evicted when idle
    pub backgrounds_path: PathBuf,
    /// Folder of backgrounds loaded at startup and kept for the process lifetime
    pub static_backgrounds_path: PathBuf,
    /// Folder of `.ttf`/`.otf` fonts
    pub fonts_path: PathBuf,
    /// Static background served when a requested one cannot be loaded
    pub background_fallback: String,
    /// Font used when a requested one is unknown
    pub default_font: String,
    /// Fonts consulted, in order, for characters the chosen font lacks
    pub fallback_fonts: Vec<String>,
    /// Image served by `GET /images/{id}` when nothing is stored under `id`
    pub default_image_location: PathBuf,
    /// Skip the API key check on the write endpoint
    pub allow_anonymous_access: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./data/store"),
            database_path: PathBuf::from("./data/images.redb"),
            backgrounds_path: PathBuf::from("./data/backgrounds"),
            static_backgrounds_path: PathBuf::from("./data/static-backgrounds"),
            fonts_path: PathBuf::from("./data/fonts"),
            background_fallback: "default".to_string(),
            default_font: "default".to_string(),
            fallback_fonts: Vec::new(),
            default_image_location: PathBuf::from("./data/default.png"),
            allow_anonymous_access: false,
        }
    }
}

/// Resource cache TTLs and janitor timings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle time before a rendered font face is evicted
    pub font_face_ttl_secs: u64,
    /// Idle time before a fetched avatar is evicted
    pub profile_ttl_secs: u64,
    /// Idle time before a decoded background is evicted
    pub background_ttl_secs: u64,
    /// Interval between janitor sweeps
    pub janitor_interval_secs: u64,
    /// Lifetime of a persisted artifact
    pub artifact_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            font_face_ttl_secs: 15 * 60,
            profile_ttl_secs: 5 * 60,
            background_ttl_secs: 5 * 60,
            janitor_interval_secs: 60,
            artifact_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn font_face_ttl(&self) -> Duration {
        Duration::from_secs(self.font_face_ttl_secs)
    }

    #[must_use]
    pub const fn profile_ttl(&self) -> Duration {
        Duration::from_secs(self.profile_ttl_secs)
    }

    #[must_use]
    pub const fn background_ttl(&self) -> Duration {
        Duration::from_secs(self.background_ttl_secs)
    }

    #[must_use]
    pub const fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    #[must_use]
    pub const fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }
}

/// Avatar fetching
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    /// Root of the avatar CDN; requests go to `{cdn_root}/{user_id}/{avatar}.png?size=256`
    pub cdn_root: String,
    /// Upper bound on a single avatar fetch
    pub fetch_timeout_ms: u64,
    /// Serve the fallback avatar instead of failing when a fetch fails
    pub use_fallback_profile: bool,
    /// Image used as the fallback avatar; a plain placeholder is used when unset
    pub fallback_profile_path: Option<PathBuf>,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            cdn_root: "https://cdn.discordapp.com/avatars".to_string(),
            fetch_timeout_ms: 10_000,
            use_fallback_profile: true,
            fallback_profile_path: None,
        }
    }
}

impl AvatarConfig {
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// GIF quantization limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizerConfig {
    /// Maximum frames quantized at once across the process; 0 means effectively unbounded
    pub concurrent_quantizers: usize,
    /// NeuQuant sampling speed, 1 (best) to 30 (fastest)
    pub speed: i32,
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self {
            concurrent_quantizers: 4,
            speed: 10,
        }
    }
}

impl QuantizerConfig {
    /// Effective concurrency limit for the quantization gate.
    #[must_use]
    pub const fn effective_limit(&self) -> usize {
        if self.concurrent_quantizers == 0 {
            UNBOUNDED_QUANTIZERS
        } else {
            self.concurrent_quantizers
        }
    }
}

/// Graceful shutdown
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight generations before exiting
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
        }
    }
}

/// Logging
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.cache.janitor_interval_secs, 60);
        assert_eq!(config.cache.artifact_ttl(), Duration::from_secs(604_800));
        assert_eq!(config.cache.font_face_ttl(), Duration::from_secs(900));
        assert!(config.avatar.use_fallback_profile);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            api_keys = ["secret"]

            [store]
            allow_anonymous_access = false
            background_fallback = "plain"
            fallback_fonts = ["NotoSans", "NotoEmoji"]

            [quantizer]
            concurrent_quantizers = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.store.background_fallback, "plain");
        assert_eq!(config.store.fallback_fonts, vec!["NotoSans", "NotoEmoji"]);
        assert!(Config::default().store.fallback_fonts.is_empty());
        assert_eq!(config.quantizer.effective_limit(), UNBOUNDED_QUANTIZERS);
        assert_eq!(config.api_keys, vec!["secret".to_string()]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Config::from_toml("[cache]\njanitor_interval_secs = 0").is_err());
        assert!(Config::from_toml("[quantizer]\nspeed = 31").is_err());
        assert!(Config::from_toml("[http]\nlisten = \"\"").is_err());
        assert!(Config::from_toml("not toml at all [").is_err());
    }

    #[test]
    fn test_is_authorized() {
        let mut config = Config {
            api_keys: vec!["k1".into(), "k2".into()],
            ..Config::default()
        };
        assert!(config.is_authorized(Some("k2")));
        assert!(!config.is_authorized(Some("nope")));
        assert!(!config.is_authorized(None));

        config.store.allow_anonymous_access = true;
        assert!(config.is_authorized(None));
    }

    #[test]
    fn test_load_missing_file() {
        let loaded = Config::load("/nonexistent/welcomer-images.toml").unwrap();
        assert!(loaded.is_none());
    }
}
