//! Generation pipeline
//!
//! [`Generator`] owns the resource caches and turns [`ImageOptions`] into
//! encoded bytes: resolve the avatar, the background and the font (filling
//! caches on a miss), composite the theme, then encode.
//!
//! Besides file names, a background may be `solid:<hex colour>` or
//! `solid:profile`, a flat colour picked from the user's avatar.

use crate::avatar::{AvatarSource, CdnAvatarSource, fallback_avatar};
use crate::cache::{SweepOutcome, TtlCache};
use crate::encode::{Encoded, QuantizeGate, encode_frames};
use crate::error::{RenderError, RenderResult};
use crate::fonts::{FontFace, FontLibrary};
use crate::frames::{DecodedImage, decode_any};
use crate::theme;
use image::RgbaImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use welcomer_common::{CacheKind, Colour, Config, ImageFormat, ImageMetrics, ImageOptions};

/// Background used when a request names none
pub const DEFAULT_BACKGROUND: &str = "default";

/// Prefix of flat-colour backgrounds
pub const SOLID_PREFIX: &str = "solid:";

/// `solid:profile` takes its colour from the avatar
pub const SOLID_PROFILE: &str = "profile";

/// Starting lightness (0..=10, tenths of full luminance) a profile colour must exceed
const PROFILE_LIGHTNESS_TENTHS: u8 = 7;

/// What a request's background string refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundSource<'a> {
    /// A static or on-disk background, by name
    Named(&'a str),
    Solid(Colour),
    SolidProfile,
}

impl<'a> BackgroundSource<'a> {
    /// Classify `background`. A `solid:` value that is not a colour is treated
    /// as a name, which then resolves to the fallback background.
    #[must_use]
    pub fn parse(background: &'a str) -> Self {
        let background = background.trim();
        let Some(value) = background.strip_prefix(SOLID_PREFIX) else {
            return Self::Named(background);
        };
        if value == SOLID_PROFILE {
            return Self::SolidProfile;
        }
        value
            .parse::<Colour>()
            .map_or(Self::Named(background), Self::Solid)
    }
}

/// Background cache key: a still variant never shadows an animated one
pub type BackgroundKey = (String, bool);

/// Face cache key: font name and the bit pattern of the pixel size
pub type FaceKey = (String, u32);

/// Tunables for [`Generator`]
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub backgrounds_path: PathBuf,
    pub background_fallback: String,
    pub background_ttl: Duration,
    pub profile_ttl: Duration,
    pub font_face_ttl: Duration,
    pub use_fallback_profile: bool,
    pub concurrent_quantizers: usize,
    pub quantizer_speed: i32,
}

impl GeneratorSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            backgrounds_path: config.store.backgrounds_path.clone(),
            background_fallback: config.store.background_fallback.clone(),
            background_ttl: config.cache.background_ttl(),
            profile_ttl: config.cache.profile_ttl(),
            font_face_ttl: config.cache.font_face_ttl(),
            use_fallback_profile: config.avatar.use_fallback_profile,
            concurrent_quantizers: config.quantizer.effective_limit(),
            quantizer_speed: config.quantizer.speed,
        }
    }
}

/// Entries removed from each cache by one sweep
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheSweep {
    pub profiles: SweepOutcome,
    pub backgrounds: SweepOutcome,
    pub font_faces: SweepOutcome,
}

pub struct Generator {
    settings: GeneratorSettings,
    static_backgrounds: HashMap<String, Arc<DecodedImage>>,
    backgrounds: TtlCache<BackgroundKey, DecodedImage>,
    avatars: TtlCache<u64, RgbaImage>,
    fonts: FontLibrary,
    faces: TtlCache<FaceKey, FontFace>,
    avatar_source: Arc<dyn AvatarSource>,
    fallback_avatar: Arc<RgbaImage>,
    gate: Arc<QuantizeGate>,
    metrics: Arc<ImageMetrics>,
}

impl Generator {
    pub fn new(
        settings: GeneratorSettings,
        fonts: FontLibrary,
        static_backgrounds: HashMap<String, Arc<DecodedImage>>,
        avatar_source: Arc<dyn AvatarSource>,
        fallback_avatar: RgbaImage,
        metrics: Arc<ImageMetrics>,
    ) -> Self {
        let gate = Arc::new(QuantizeGate::new(
            settings.concurrent_quantizers,
            Some(Arc::clone(&metrics)),
        ));
        Self {
            backgrounds: TtlCache::new("backgrounds", settings.background_ttl),
            avatars: TtlCache::new("profiles", settings.profile_ttl),
            faces: TtlCache::new("font_faces", settings.font_face_ttl),
            settings,
            static_backgrounds,
            fonts,
            avatar_source,
            fallback_avatar: Arc::new(fallback_avatar),
            gate,
            metrics,
        }
    }

    /// Build a generator from the service configuration, loading fonts and
    /// static backgrounds from disk.
    pub fn from_config(config: &Config, metrics: Arc<ImageMetrics>) -> RenderResult<Self> {
        let fonts = FontLibrary::load_dir(&config.store.fonts_path, &config.store.default_font)?
            .with_fallbacks(config.store.fallback_fonts.clone());
        let static_backgrounds = load_static_backgrounds(&config.store.static_backgrounds_path)?;
        if !static_backgrounds.contains_key(&config.store.background_fallback) {
            warn!(
                "Fallback background {} is not among the static backgrounds",
                config.store.background_fallback
            );
        }
        let avatar_source = CdnAvatarSource::new(
            config.avatar.cdn_root.clone(),
            config.avatar.fetch_timeout(),
            Arc::clone(&metrics),
        )?;
        let fallback = fallback_avatar(config.avatar.fallback_profile_path.as_deref());

        metrics.set_cache_population(CacheKind::Fonts, fonts.len());

        Ok(Self::new(
            GeneratorSettings::from_config(config),
            fonts,
            static_backgrounds,
            Arc::new(avatar_source),
            fallback,
            metrics,
        ))
    }

    #[must_use]
    pub fn gate(&self) -> &QuantizeGate {
        &self.gate
    }

    /// Render `options` into an encoded image.
    ///
    /// Resolution runs on the caller's task and stops if the caller goes
    /// away. Compositing and encoding run on a task of their own, so once
    /// they start they finish.
    pub async fn generate(self: &Arc<Self>, options: &ImageOptions) -> RenderResult<Encoded> {
        let start = Instant::now();
        let result = self.generate_inner(options).await;
        match &result {
            Ok(encoded) => self.metrics.record_generation(encoded.bytes.len(), start.elapsed()),
            Err(_) => self.metrics.record_generation_failure(),
        }
        result
    }

    async fn generate_inner(self: &Arc<Self>, options: &ImageOptions) -> RenderResult<Encoded> {
        let avatar = self.avatar(options.user_id, &options.avatar).await?;
        let background = match BackgroundSource::parse(&options.background) {
            BackgroundSource::Named(name) => self.background(name, options.allow_gif).await?,
            BackgroundSource::Solid(colour) => solid_background(colour),
            BackgroundSource::SolidProfile => {
                let colour = avatar.as_deref().map_or(Colour::WHITE, profile_colour);
                debug!("Profile colour for user {} is {:?}", options.user_id, colour);
                solid_background(colour)
            }
        };

        let this = Arc::clone(self);
        let options = options.clone();
        let task = tokio::spawn(async move {
            let allow_gif = options.allow_gif;
            let frames = {
                let this = Arc::clone(&this);
                let background = Arc::clone(&background);
                tokio::task::spawn_blocking(move || {
                    let face_at = |size: f32| this.face(&options.font, size);
                    theme::compose(&options, &background, avatar.as_deref(), &face_at)
                })
                .await??
            };
            encode_frames(
                frames,
                &background,
                allow_gif,
                &this.gate,
                this.settings.quantizer_speed,
            )
            .await
        });
        task.await?
    }

    /// Resolve a background: static set, then the background cache (loading
    /// from disk on a miss), then the configured fallback.
    pub async fn background(&self, name: &str, allow_gif: bool) -> RenderResult<Arc<DecodedImage>> {
        let name = if name.is_empty() { DEFAULT_BACKGROUND } else { name };

        if let Some(background) = self.static_backgrounds.get(name) {
            return Ok(Arc::clone(background));
        }

        let loaded = if is_safe_name(name) {
            let dir = self.settings.backgrounds_path.clone();
            let owned = name.to_string();
            self.backgrounds
                .get_or_load((name.to_string(), allow_gif), || async move {
                    tokio::task::spawn_blocking(move || load_background(&dir, &owned, allow_gif))
                        .await
                        .unwrap_or_else(|e| Err(e.into()))
                })
                .await
        } else {
            Err(RenderError::BackgroundNotFound(name.to_string()))
        };

        match loaded {
            Ok(background) => Ok(background),
            Err(e) => {
                debug!("Background {} unavailable ({}), using fallback", name, e);
                self.static_backgrounds
                    .get(&self.settings.background_fallback)
                    .cloned()
                    .ok_or(e)
            }
        }
    }

    /// Resolve an avatar through the profile cache.
    ///
    /// Returns `None` only when the request names no avatar and fallbacks
    /// are disabled.
    pub async fn avatar(&self, user_id: u64, avatar: &str) -> RenderResult<Option<Arc<RgbaImage>>> {
        if avatar.is_empty() {
            return Ok(self
                .settings
                .use_fallback_profile
                .then(|| Arc::clone(&self.fallback_avatar)));
        }

        let source = Arc::clone(&self.avatar_source);
        let loaded = self
            .avatars
            .get_or_load(user_id, || async move {
                let bytes = source.fetch(user_id, avatar).await?;
                let image =
                    tokio::task::spawn_blocking(move || decode_any(&bytes, "avatar")).await??;
                Ok::<_, RenderError>(image)
            })
            .await;

        match loaded {
            Ok(image) => Ok(Some(image)),
            Err(e) if self.settings.use_fallback_profile => {
                warn!("Failed to fetch avatar for user {}: {}", user_id, e);
                self.metrics.record_avatar_fallback();
                Ok(Some(Arc::clone(&self.fallback_avatar)))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a face of `font` (or the default font), with the fallback
    /// fonts behind it, at `size` pixels.
    pub fn face(&self, font: &str, size: f32) -> RenderResult<Arc<FontFace>> {
        let chain = self.fonts.resolve_chain(font)?;
        let name = chain.first().map_or("", |f| f.name()).to_string();
        self.faces
            .get_or_try_insert_with((name, size.to_bits()), || {
                Ok(FontFace::with_fallbacks(chain, size))
            })
    }

    /// Drop idle entries from the avatar, background and face caches.
    ///
    /// Loaded fonts and static backgrounds are never evicted.
    pub fn sweep(&self, now: Instant) -> CacheSweep {
        CacheSweep {
            profiles: self.avatars.sweep(now),
            backgrounds: self.backgrounds.sweep(now),
            font_faces: self.faces.sweep(now),
        }
    }

    /// Current population of each cache
    #[must_use]
    pub fn cache_populations(&self) -> [(CacheKind, usize); 4] {
        [
            (CacheKind::Fonts, self.fonts.len()),
            (CacheKind::FontFaces, self.faces.len()),
            (CacheKind::Backgrounds, self.backgrounds.len()),
            (CacheKind::Profiles, self.avatars.len()),
        ]
    }
}

/// A one-pixel still, stretched over the canvas by the compositor.
fn solid_background(colour: Colour) -> Arc<DecodedImage> {
    let pixel = RgbaImage::from_pixel(1, 1, image::Rgba(colour.to_array()));
    Arc::new(DecodedImage::still(ImageFormat::Png, pixel))
}

/// Most common light colour among the visible pixels of `avatar`.
///
/// The lightness bar starts high and drops a tenth at a time until some
/// pixel clears it; an avatar with no pixel above a tenth gives black.
/// Ties go to the smallest colour so the choice is stable.
fn profile_colour(avatar: &RgbaImage) -> Colour {
    for tenths in (1..=PROFILE_LIGHTNESS_TENTHS).rev() {
        let threshold = f64::from(tenths) / 10.0;
        let mut counts: HashMap<[u8; 3], usize> = HashMap::new();
        for pixel in avatar.pixels() {
            let [r, g, b, a] = pixel.0;
            if a > 0 && luminance(r, g, b) > threshold {
                *counts.entry([r, g, b]).or_default() += 1;
            }
        }
        let common = counts
            .into_iter()
            .max_by(|x, y| x.1.cmp(&y.1).then_with(|| y.0.cmp(&x.0)));
        if let Some(([r, g, b], _)) = common {
            return Colour::rgb(r, g, b);
        }
    }
    Colour::BLACK
}

/// Relative luminance in `0.0..=1.0`
fn luminance(r: u8, g: u8, b: u8) -> f64 {
    (0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b)) / 255.0
}

/// Names are plain file stems; anything that could walk out of the folder is rejected.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
}

/// Load `<name>.gif` (when animation is allowed), `.png`, `.jpg` or `.jpeg`
/// from `dir`, first match wins.
fn load_background(dir: &Path, name: &str, allow_gif: bool) -> RenderResult<DecodedImage> {
    let candidates: &[&str] = if allow_gif {
        &["gif", "png", "jpg", "jpeg"]
    } else {
        &["png", "jpg", "jpeg"]
    };
    for ext in candidates {
        let path = dir.join(format!("{name}.{ext}"));
        if path.is_file() {
            debug!("Loading background {}", path.display());
            return DecodedImage::open(&path);
        }
    }
    Err(RenderError::BackgroundNotFound(name.to_string()))
}

/// Decode every image in `dir` into the never-evicted static set.
///
/// A missing folder yields an empty set.
pub fn load_static_backgrounds(dir: &Path) -> RenderResult<HashMap<String, Arc<DecodedImage>>> {
    let mut backgrounds = HashMap::new();
    if !dir.exists() {
        warn!("Static background directory {} does not exist", dir.display());
        return Ok(backgrounds);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ImageFormat::from_extension)
            .is_some();
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !supported {
            continue;
        }
        match DecodedImage::open(&path) {
            Ok(image) => {
                backgrounds.insert(name.to_string(), Arc::new(image));
            }
            Err(e) => warn!("Skipping static background {}: {}", path.display(), e),
        }
    }

    info!("Loaded {} static backgrounds from {}", backgrounds.len(), dir.display());
    Ok(backgrounds)
}
