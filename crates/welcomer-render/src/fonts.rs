//! Font library and sized faces
//!
//! Font files are read once at startup into a [`FontLibrary`] and kept for
//! the life of the process. A [`FontFace`] is a font at one pixel size; faces
//! are what the face cache holds and what the janitor evicts.
//!
//! A face carries the requested font followed by the configured fallback
//! fonts. Every character is drawn with the first font in that chain that
//! has a glyph for it.

use crate::error::{RenderError, RenderResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tiny_skia::{Path as SkPath, PathBuilder, Transform};
use ttf_parser::GlyphId;
use tracing::{debug, info, warn};

/// A parsed font file
#[derive(Debug)]
pub struct LoadedFont {
    name: String,
    data: Vec<u8>,
    units_per_em: f32,
    ascender: f32,
    descender: f32,
    line_gap: f32,
}

impl LoadedFont {
    /// Validate and keep the raw font data.
    pub fn parse(name: impl Into<String>, data: Vec<u8>) -> RenderResult<Self> {
        let name = name.into();
        let (units_per_em, ascender, descender, line_gap) = {
            let face = ttf_parser::Face::parse(&data, 0)
                .map_err(|e| RenderError::decode(format!("font {name}"), e))?;
            (
                f32::from(face.units_per_em()),
                f32::from(face.ascender()),
                f32::from(face.descender()),
                f32::from(face.line_gap()),
            )
        };
        Ok(Self {
            name,
            data,
            units_per_em,
            ascender,
            descender,
            line_gap,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn face(&self) -> RenderResult<ttf_parser::Face<'_>> {
        ttf_parser::Face::parse(&self.data, 0)
            .map_err(|e| RenderError::Internal(format!("font {} no longer parses: {e}", self.name)))
    }
}

/// Fonts available for rendering, keyed by file stem
pub struct FontLibrary {
    fonts: HashMap<String, Arc<LoadedFont>>,
    default_font: String,
    fallbacks: Vec<String>,
}

impl FontLibrary {
    #[must_use]
    pub fn new(default_font: impl Into<String>) -> Self {
        Self {
            fonts: HashMap::new(),
            default_font: default_font.into(),
            fallbacks: Vec::new(),
        }
    }

    /// Fonts consulted, in order, for characters the requested font lacks.
    #[must_use]
    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        for name in &fallbacks {
            if !self.fonts.contains_key(name) {
                warn!("Fallback font {} is not loaded", name);
            }
        }
        self.fallbacks = fallbacks;
        self
    }

    /// Load every `.ttf`/`.otf` file in `dir`.
    ///
    /// A missing directory yields an empty library; files that fail to parse
    /// are skipped with a warning.
    pub fn load_dir(dir: &Path, default_font: impl Into<String>) -> RenderResult<Self> {
        let mut library = Self::new(default_font);
        if !dir.exists() {
            warn!("Font directory {} does not exist, no fonts loaded", dir.display());
            return Ok(library);
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_font = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("ttf") || e.eq_ignore_ascii_case("otf"));
            if !is_font {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let data = std::fs::read(&path)?;
            match LoadedFont::parse(name, data) {
                Ok(font) => {
                    debug!("Loaded font {}", name);
                    library.insert(font);
                }
                Err(e) => warn!("Skipping font {}: {}", path.display(), e),
            }
        }

        info!("Loaded {} fonts from {}", library.len(), dir.display());
        Ok(library)
    }

    pub fn insert(&mut self, font: LoadedFont) {
        self.fonts.insert(font.name.clone(), Arc::new(font));
    }

    /// Find `name`, falling back to the default font.
    pub fn resolve(&self, name: &str) -> RenderResult<Arc<LoadedFont>> {
        if let Some(font) = self.fonts.get(name) {
            return Ok(Arc::clone(font));
        }
        if let Some(font) = self.fonts.get(&self.default_font) {
            if !name.is_empty() {
                debug!("Font {} not found, using {}", name, self.default_font);
            }
            return Ok(Arc::clone(font));
        }
        Err(RenderError::FontNotFound(name.to_string()))
    }

    /// The font for `name` (or the default font) followed by every loaded
    /// fallback font, without repeats.
    pub fn resolve_chain(&self, name: &str) -> RenderResult<Vec<Arc<LoadedFont>>> {
        let mut chain: Vec<Arc<LoadedFont>> = self.resolve(name).into_iter().collect();
        for fallback in &self.fallbacks {
            let Some(font) = self.fonts.get(fallback) else {
                continue;
            };
            if chain.iter().all(|f| f.name != font.name) {
                chain.push(Arc::clone(font));
            }
        }
        if chain.is_empty() {
            return Err(RenderError::FontNotFound(name.to_string()));
        }
        Ok(chain)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }
}

/// Looks up the glyph for a character, reporting `None` when the font has
/// no glyph for it.
trait GlyphLookup {
    fn lookup(&self, c: char) -> Option<GlyphId>;
}

impl GlyphLookup for ttf_parser::Face<'_> {
    fn lookup(&self, c: char) -> Option<GlyphId> {
        self.glyph_index(c).filter(|g| g.0 != 0)
    }
}

/// First font in `chain` that covers `c`; the primary font's `.notdef`
/// when none does.
fn select_glyph<G: GlyphLookup>(chain: &[G], c: char) -> (usize, GlyphId) {
    chain
        .iter()
        .enumerate()
        .find_map(|(i, face)| face.lookup(c).map(|g| (i, g)))
        .unwrap_or((0, GlyphId(0)))
}

#[derive(Debug)]
struct ScaledFont {
    font: Arc<LoadedFont>,
    scale: f32,
}

/// A font and its fallbacks at a fixed pixel size
#[derive(Debug)]
pub struct FontFace {
    chain: Vec<ScaledFont>,
    size: f32,
}

impl FontFace {
    /// A face of `chain[0]` that borrows glyphs from the rest of `chain`.
    ///
    /// Line metrics always come from the first font.
    #[must_use]
    pub fn with_fallbacks(chain: Vec<Arc<LoadedFont>>, size: f32) -> Self {
        let chain = chain
            .into_iter()
            .map(|font| ScaledFont {
                scale: size / font.units_per_em,
                font,
            })
            .collect();
        Self { chain, size }
    }

    #[must_use]
    pub const fn size(&self) -> f32 {
        self.size
    }

    #[must_use]
    pub fn font_name(&self) -> &str {
        self.chain.first().map_or("", |f| f.font.name())
    }

    /// Distance from the top of a line to its baseline
    #[must_use]
    pub fn ascent(&self) -> f32 {
        self.chain
            .first()
            .map_or(0.0, |f| (f.font.ascender * f.scale).ceil())
    }

    #[must_use]
    pub fn line_height(&self) -> f32 {
        self.chain.first().map_or(0.0, |f| {
            ((f.font.ascender - f.font.descender + f.font.line_gap) * f.scale).ceil()
        })
    }

    fn faces(&self) -> RenderResult<Vec<ttf_parser::Face<'_>>> {
        if self.chain.is_empty() {
            return Err(RenderError::Internal("font face has no fonts".to_string()));
        }
        self.chain.iter().map(|f| f.font.face()).collect()
    }

    /// Advance width of a single line
    pub fn measure(&self, line: &str) -> RenderResult<f32> {
        let faces = self.faces()?;
        let width: f32 = line
            .chars()
            .map(|c| {
                let (i, glyph) = select_glyph(&faces, c);
                f32::from(faces[i].glyph_hor_advance(glyph).unwrap_or(0)) * self.chain[i].scale
            })
            .sum();
        Ok(width.ceil())
    }

    /// Outlines of `line` in pixel space, with the pen starting at `x` on `baseline`.
    pub fn line_paths(&self, line: &str, x: f32, baseline: f32) -> RenderResult<Vec<SkPath>> {
        let faces = self.faces()?;
        let mut paths = Vec::with_capacity(line.len());
        let mut pen = x;

        for c in line.chars() {
            let (i, glyph) = select_glyph(&faces, c);
            let face = &faces[i];
            let scale = self.chain[i].scale;
            let mut builder = GlyphOutlineBuilder::new();
            if face.outline_glyph(glyph, &mut builder).is_some() {
                let transform = Transform::from_row(scale, 0.0, 0.0, -scale, pen, baseline);
                if let Some(path) = builder.finish().and_then(|p| p.transform(transform)) {
                    paths.push(path);
                }
            }
            pen += f32::from(face.glyph_hor_advance(glyph).unwrap_or(0)) * scale;
        }
        Ok(paths)
    }
}

/// Collects a glyph outline, in font units, into a tiny-skia path.
struct GlyphOutlineBuilder {
    builder: PathBuilder,
}

impl GlyphOutlineBuilder {
    fn new() -> Self {
        Self {
            builder: PathBuilder::new(),
        }
    }

    fn finish(self) -> Option<SkPath> {
        self.builder.finish()
    }
}

impl ttf_parser::OutlineBuilder for GlyphOutlineBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}
