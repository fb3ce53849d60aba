//! Avatar sources
//!
//! The generator only needs raw avatar bytes for a user; where they come
//! from is behind [`AvatarSource`] so tests can serve avatars from memory.

use crate::error::{RenderError, RenderResult};
use async_trait::async_trait;
use bytes::Bytes;
use image::{Rgba, RgbaImage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use welcomer_common::ImageMetrics;

/// Size requested from the CDN and used for the generated placeholder
pub const AVATAR_SIZE: u32 = 256;

const USER_AGENT: &str = concat!("welcomer-images/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait AvatarSource: Send + Sync {
    /// Fetch the encoded avatar `avatar` of `user_id`.
    async fn fetch(&self, user_id: u64, avatar: &str) -> RenderResult<Bytes>;
}

/// Fetches avatars over HTTP from `{cdn_root}/{user_id}/{avatar}.png?size=256`.
pub struct CdnAvatarSource {
    client: reqwest::Client,
    cdn_root: String,
    metrics: Arc<ImageMetrics>,
}

impl CdnAvatarSource {
    pub fn new(
        cdn_root: impl Into<String>,
        timeout: Duration,
        metrics: Arc<ImageMetrics>,
    ) -> RenderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RenderError::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            cdn_root: cdn_root.into().trim_end_matches('/').to_string(),
            metrics,
        })
    }

    #[must_use]
    pub fn avatar_url(&self, user_id: u64, avatar: &str) -> String {
        format!("{}/{}/{}.png?size={}", self.cdn_root, user_id, avatar, AVATAR_SIZE)
    }
}

#[async_trait]
impl AvatarSource for CdnAvatarSource {
    async fn fetch(&self, user_id: u64, avatar: &str) -> RenderResult<Bytes> {
        let url = self.avatar_url(user_id, avatar);
        let start = Instant::now();

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.record_avatar_fetch(None, start.elapsed());
                return Err(RenderError::AvatarFetch(format!("{url}: {e}")));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.metrics
                .record_avatar_fetch(Some(status.as_u16()), start.elapsed());
            return Err(RenderError::AvatarFetch(format!("{url}: status {status}")));
        }

        let body = response.bytes().await;
        self.metrics
            .record_avatar_fetch(Some(status.as_u16()), start.elapsed());
        let body = body.map_err(|e| RenderError::AvatarFetch(format!("{url}: {e}")))?;

        debug!("Fetched avatar {} ({} bytes)", url, body.len());
        Ok(body)
    }
}

/// Avatar used when a fetch fails and fallbacks are enabled.
///
/// Reads `path` when given; otherwise, or if that image cannot be decoded,
/// produces a plain grey square.
#[must_use]
pub fn fallback_avatar(path: Option<&std::path::Path>) -> RgbaImage {
    if let Some(path) = path {
        match std::fs::read(path)
            .map_err(RenderError::from)
            .and_then(|bytes| crate::frames::decode_any(&bytes, "fallback avatar"))
        {
            Ok(image) => return image,
            Err(e) => warn!("Failed to load fallback avatar {}: {}", path.display(), e),
        }
    }
    RgbaImage::from_pixel(AVATAR_SIZE, AVATAR_SIZE, Rgba([88, 101, 242, 255]))
}
