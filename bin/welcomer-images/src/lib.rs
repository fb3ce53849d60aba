//! Welcomer Images - HTTP service
//!
//! Wires the artifact store, the generator and the janitor behind an axum
//! router. `main.rs` only parses arguments and runs the server.

pub mod handlers;
pub mod inflight;
pub mod janitor;
pub mod metrics_middleware;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};
use bytes::Bytes;
use inflight::InFlightTracker;
use std::path::Path;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use welcomer_common::{Config, ImageFormat, ImageMetrics};
use welcomer_render::Generator;
use welcomer_store::ArtifactStore;

/// Image served for unknown or expired ids
#[derive(Debug, Clone)]
pub struct DefaultImage {
    pub bytes: Bytes,
    pub format: ImageFormat,
}

impl DefaultImage {
    /// Read the default image from `path`, or use a transparent pixel.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let format = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .and_then(ImageFormat::from_extension)
                    .unwrap_or(ImageFormat::Png);
                Ok(Self {
                    bytes: Bytes::from(bytes),
                    format,
                })
            }
            Err(e) => {
                warn!(
                    "Default image {} unavailable ({}), serving a blank image",
                    path.display(),
                    e
                );
                let bytes = welcomer_render::encode::solid_png(1, 1, [0, 0, 0, 0])
                    .context("Failed to encode placeholder image")?;
                Ok(Self {
                    bytes: Bytes::from(bytes),
                    format: ImageFormat::Png,
                })
            }
        }
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub store: ArtifactStore,
    pub generator: Arc<Generator>,
    pub metrics: Arc<ImageMetrics>,
    pub inflight: InFlightTracker,
    pub default_image: DefaultImage,
}

impl AppState {
    /// Open the store, load fonts and backgrounds and prepare the default image.
    pub fn from_config(config: Config, metrics: Arc<ImageMetrics>) -> Result<Self> {
        std::fs::create_dir_all(&config.store.store_path).with_context(|| {
            format!(
                "Failed to create store folder {}",
                config.store.store_path.display()
            )
        })?;

        let store = ArtifactStore::open(&config.store.database_path).with_context(|| {
            format!(
                "Failed to open artifact store {}",
                config.store.database_path.display()
            )
        })?;
        info!(
            "Opened artifact store {} ({} records)",
            config.store.database_path.display(),
            store.count().unwrap_or(0)
        );

        let generator = Generator::from_config(&config, Arc::clone(&metrics))
            .context("Failed to initialise image generator")?;
        let default_image = DefaultImage::load(&config.store.default_image_location)?;

        Ok(Self {
            config,
            store,
            generator: Arc::new(generator),
            metrics,
            inflight: InFlightTracker::new(),
            default_image,
        })
    }
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = DefaultBodyLimit::max(state.config.http.max_body_bytes);
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health_check))
        .route("/images", post(handlers::create_image))
        .route("/images/{id}", get(handlers::get_image))
        .layer(body_limit)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.metrics),
            metrics_middleware::metrics_layer,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
