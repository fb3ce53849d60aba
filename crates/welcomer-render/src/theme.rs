//! Theme compositor
//!
//! A theme draws the avatar and the message onto a transparent overlay and
//! says where the overlay and the background go on the final canvas. The
//! overlay is then laid over every background frame.

use crate::error::{RenderError, RenderResult};
use crate::fonts::FontFace;
use crate::frames::DecodedImage;
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use std::sync::Arc;
use tiny_skia::{
    ColorU8, FillRule, LineCap, LineJoin, Mask, Paint, Path, PathBuilder, Pixmap, PixmapPaint,
    Rect, Stroke, Transform,
};
use welcomer_common::{
    Colour, HorizontalAlignment, ImageOptions, ProfileAlignment, ProfileBorderCurve, Theme,
    VerticalAlignment,
};

/// Starting point for text fitting
pub const DEFAULT_FONT_SIZE: f32 = 96.0;

/// Padding between the canvas edge and the overlay
const OVERLAY_PADDING: i64 = 32;

/// Resolves a face of the requested font at a pixel size
pub type FaceLookup<'a> = dyn Fn(f32) -> RenderResult<Arc<FontFace>> + 'a;

/// Output of a theme: what to draw, and where
pub struct Layout {
    pub width: u32,
    pub height: u32,
    pub overlay: Pixmap,
    pub overlay_anchor: (i64, i64),
    pub background_anchor: (i64, i64),
    pub background_width: u32,
    pub background_height: u32,
}

/// Text box handed to [`draw_multiline`]
struct TextBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

/// Composite the final frames for `options`.
///
/// Produces one frame per background frame, in order.
pub fn compose(
    options: &ImageOptions,
    background: &DecodedImage,
    avatar: Option<&RgbaImage>,
    face_at: &FaceLookup<'_>,
) -> RenderResult<Vec<RgbaImage>> {
    let avatar = avatar.map(|a| apply_avatar_effects(a, options)).transpose()?;
    let mut layout = build_layout(options, avatar.as_ref(), face_at)?;
    if options.border_width > 0 {
        layout = apply_border(layout, options.border_width, options.border_colour())?;
    }
    Ok(overlay_frames(&layout, background))
}

/// Lay out the theme requested by `options` on a transparent overlay.
pub fn build_layout(
    options: &ImageOptions,
    avatar: Option<&RgbaImage>,
    face_at: &FaceLookup<'_>,
) -> RenderResult<Layout> {
    match options.theme {
        Theme::Regular => regular(options, avatar, face_at),
        Theme::Badge => badge(options, avatar, face_at),
        Theme::Vertical => vertical(options, avatar, face_at),
    }
}

fn new_pixmap(width: u32, height: u32) -> RenderResult<Pixmap> {
    Pixmap::new(width, height)
        .ok_or_else(|| RenderError::Internal(format!("invalid canvas size {width}x{height}")))
}

fn padded_layout(overlay: Pixmap, width: u32, height: u32) -> Layout {
    Layout {
        width,
        height,
        overlay,
        overlay_anchor: (OVERLAY_PADDING, OVERLAY_PADDING),
        background_anchor: (0, 0),
        background_width: width,
        background_height: height,
    }
}

fn regular(
    options: &ImageOptions,
    avatar: Option<&RgbaImage>,
    face_at: &FaceLookup<'_>,
) -> RenderResult<Layout> {
    let mut overlay = new_pixmap(936, 236)?;

    let text_box = match avatar {
        Some(avatar) => {
            let (avatar_x, text_x) = match options.profile_alignment {
                ProfileAlignment::Left => (0, 268.0),
                ProfileAlignment::Right => (700, 0.0),
            };
            draw_image(&mut overlay, avatar, 236, avatar_x, 0)?;
            TextBox { x: text_x, y: 0.0, width: 668.0, height: 236.0 }
        }
        None => TextBox { x: 0.0, y: 0.0, width: 936.0, height: 236.0 },
    };
    draw_multiline(&mut overlay, options, &text_box, face_at)?;

    Ok(padded_layout(overlay, 1000, 300))
}

fn badge(
    options: &ImageOptions,
    avatar: Option<&RgbaImage>,
    face_at: &FaceLookup<'_>,
) -> RenderResult<Layout> {
    let mut overlay = new_pixmap(900, 256)?;

    if let Some(panel) = rounded_rect(50.0, 33.0, 850.0, 190.0, 32.0) {
        overlay.fill_path(
            &panel,
            &paint(options.profile_border_colour()),
            FillRule::Winding,
            Transform::identity(),
            None,
        );
    }
    if let Some(avatar) = avatar {
        draw_image(&mut overlay, avatar, 256, 0, 0)?;
    }
    let text_box = TextBox { x: 288.0, y: 50.0, width: 579.0, height: 159.0 };
    draw_multiline(&mut overlay, options, &text_box, face_at)?;

    Ok(padded_layout(overlay, 964, 320))
}

fn vertical(
    options: &ImageOptions,
    avatar: Option<&RgbaImage>,
    face_at: &FaceLookup<'_>,
) -> RenderResult<Layout> {
    let mut overlay = new_pixmap(686, 452)?;

    let text_box = match avatar {
        Some(avatar) => {
            draw_image(&mut overlay, avatar, 236, 225, 0)?;
            TextBox { x: 0.0, y: 236.0, width: 686.0, height: 200.0 }
        }
        None => TextBox { x: 0.0, y: 0.0, width: 686.0, height: 452.0 },
    };
    draw_multiline(&mut overlay, options, &text_box, face_at)?;

    Ok(padded_layout(overlay, 750, 516))
}

/// Grow the canvas by `width` on every side and frame it in `colour`.
fn apply_border(layout: Layout, width: u32, colour: Colour) -> RenderResult<Layout> {
    let canvas_width = layout.width + width * 2;
    let canvas_height = layout.height + width * 2;
    let mut overlay = new_pixmap(canvas_width, canvas_height)?;

    let (w, h, b) = (canvas_width as f32, canvas_height as f32, width as f32);
    let sides = [
        Rect::from_xywh(0.0, 0.0, w, b),
        Rect::from_xywh(w - b, b, b, h - b * 2.0),
        Rect::from_xywh(0.0, h - b, w, b),
        Rect::from_xywh(0.0, b, b, h - b * 2.0),
    ];
    let border_paint = paint(colour);
    for side in sides.into_iter().flatten() {
        overlay.fill_rect(side, &border_paint, Transform::identity(), None);
    }

    let offset = i64::from(width);
    overlay.draw_pixmap(
        i32::try_from(offset + layout.overlay_anchor.0).unwrap_or(0),
        i32::try_from(offset + layout.overlay_anchor.1).unwrap_or(0),
        layout.overlay.as_ref(),
        &PixmapPaint::default(),
        Transform::identity(),
        None,
    );

    Ok(Layout {
        width: canvas_width,
        height: canvas_height,
        overlay,
        overlay_anchor: (0, 0),
        background_anchor: (
            layout.background_anchor.0 + offset,
            layout.background_anchor.1 + offset,
        ),
        background_width: layout.background_width,
        background_height: layout.background_height,
    })
}

/// Fit every background frame to the layout and lay the overlay on top.
pub fn overlay_frames(layout: &Layout, background: &DecodedImage) -> Vec<RgbaImage> {
    let overlay = from_pixmap(&layout.overlay);
    background
        .frames
        .iter()
        .map(|frame| {
            let mut canvas = RgbaImage::new(layout.width, layout.height);
            let fitted = fill(&frame.image, layout.background_width, layout.background_height);
            imageops::replace(
                &mut canvas,
                &fitted,
                layout.background_anchor.0,
                layout.background_anchor.1,
            );
            imageops::overlay(
                &mut canvas,
                &overlay,
                layout.overlay_anchor.0,
                layout.overlay_anchor.1,
            );
            canvas
        })
        .collect()
}

/// Scale `image` to cover `width`x`height`, then crop the centre.
fn fill(image: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let (src_w, src_h) = image.dimensions();
    if (src_w, src_h) == (width, height) {
        return image.clone();
    }
    if src_w == 0 || src_h == 0 {
        return RgbaImage::new(width, height);
    }
    let scale = f64::max(
        f64::from(width) / f64::from(src_w),
        f64::from(height) / f64::from(src_h),
    );
    let scaled_w = ((f64::from(src_w) * scale).ceil() as u32).max(width);
    let scaled_h = ((f64::from(src_h) * scale).ceil() as u32).max(height);
    let scaled = imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle);
    let x = (scaled_w - width) / 2;
    let y = (scaled_h - height) / 2;
    imageops::crop_imm(&scaled, x, y, width, height).to_image()
}

/// Mask and frame an avatar according to the profile border options.
///
/// The result is the avatar grown by `profile_border_width` on every side.
pub fn apply_avatar_effects(avatar: &RgbaImage, options: &ImageOptions) -> RenderResult<RgbaImage> {
    let (width, height) = avatar.dimensions();
    let border = options.profile_border_width;
    let mut atlas = new_pixmap(width + border * 2, height + border * 2)?;
    if border > 0 {
        let c = options.profile_border_colour();
        atlas.fill(tiny_skia::Color::from_rgba8(c.r, c.g, c.b, c.a));
    }

    let (avatar_image, rounding) = match options.profile_border_curve {
        ProfileBorderCurve::Circle => {
            let source = match transparent_border(avatar) {
                Some(padding) if padding * 2 < width && padding * 2 < height => {
                    let mut shrunk = RgbaImage::new(width, height);
                    let inner = imageops::resize(
                        avatar,
                        width - padding * 2,
                        height - padding * 2,
                        FilterType::CatmullRom,
                    );
                    imageops::overlay(&mut shrunk, &inner, i64::from(padding), i64::from(padding));
                    shrunk
                }
                _ => avatar.clone(),
            };
            (round_image(&source, f32::MAX)?, f32::MAX)
        }
        ProfileBorderCurve::Soft => (round_image(avatar, 16.0)?, 16.0 + border as f32),
        ProfileBorderCurve::Square => (avatar.clone(), 0.0),
    };

    atlas.draw_pixmap(
        i32::try_from(border).unwrap_or(0),
        i32::try_from(border).unwrap_or(0),
        to_pixmap(&avatar_image)?.as_ref(),
        &PixmapPaint::default(),
        Transform::identity(),
        None,
    );

    let framed = from_pixmap(&atlas);
    if rounding > 0.0 {
        round_image(&framed, rounding)
    } else {
        Ok(framed)
    }
}

/// Padding to shrink by when the avatar's outer ring is fully transparent.
fn transparent_border(image: &RgbaImage) -> Option<u32> {
    let (w, h) = image.dimensions();
    let padding = w / 8;
    if padding == 0 {
        return None;
    }
    let samples = [
        (padding, padding),
        (w / 2, padding),
        (w - padding, padding),
        (padding, h / 2),
        (w - padding, h / 2),
        (padding, h - padding),
        (w / 2, h - padding),
        (w - padding, h - padding),
    ];
    samples
        .iter()
        .all(|&(x, y)| x < w && y < h && image.get_pixel(x, y)[3] == 0)
        .then_some(padding)
}

/// Clip `image` to a rounded rectangle; the radius is clamped to half the short side.
fn round_image(image: &RgbaImage, radius: f32) -> RenderResult<RgbaImage> {
    let (w, h) = image.dimensions();
    let mut pixmap = to_pixmap(image)?;
    let mut mask = Mask::new(w, h)
        .ok_or_else(|| RenderError::Internal(format!("invalid mask size {w}x{h}")))?;
    if let Some(path) = rounded_rect(0.0, 0.0, w as f32, h as f32, radius) {
        mask.fill_path(&path, FillRule::Winding, true, Transform::identity());
    }
    pixmap.apply_mask(&mask);
    Ok(from_pixmap(&pixmap))
}

fn rounded_rect(x: f32, y: f32, w: f32, h: f32, radius: f32) -> Option<Path> {
    let r = radius.min(w / 2.0).min(h / 2.0).max(0.0);
    if r <= 0.0 {
        return Some(PathBuilder::from_rect(Rect::from_xywh(x, y, w, h)?));
    }
    // Cubic approximation of a quarter circle
    let k = 0.552_284_8 * r;
    let mut pb = PathBuilder::new();
    pb.move_to(x + r, y);
    pb.line_to(x + w - r, y);
    pb.cubic_to(x + w - r + k, y, x + w, y + r - k, x + w, y + r);
    pb.line_to(x + w, y + h - r);
    pb.cubic_to(x + w, y + h - r + k, x + w - r + k, y + h, x + w - r, y + h);
    pb.line_to(x + r, y + h);
    pb.cubic_to(x + r - k, y + h, x, y + h - r + k, x, y + h - r);
    pb.line_to(x, y + r);
    pb.cubic_to(x, y + r - k, x + r - k, y, x + r, y);
    pb.close();
    pb.finish()
}

/// Resize `image` to `size`x`size` and draw it at (`x`, `y`).
fn draw_image(target: &mut Pixmap, image: &RgbaImage, size: u32, x: i32, y: i32) -> RenderResult<()> {
    let resized = imageops::resize(image, size, size, FilterType::CatmullRom);
    target.draw_pixmap(
        x,
        y,
        to_pixmap(&resized)?.as_ref(),
        &PixmapPaint::default(),
        Transform::identity(),
        None,
    );
    Ok(())
}

/// Draw the newline separated message inside `text_box`, shrinking the font
/// by 10% at a time until the widest line and the stacked line heights fit.
fn draw_multiline(
    target: &mut Pixmap,
    options: &ImageOptions,
    text_box: &TextBox,
    face_at: &FaceLookup<'_>,
) -> RenderResult<()> {
    if options.text.trim().is_empty() {
        return Ok(());
    }
    let lines: Vec<&str> = options.text.split('\n').collect();
    let line_count = lines.len() as f32;

    let stroke = options.text_stroke as f32;
    let x = text_box.x + stroke;
    let y = text_box.y + stroke;
    let width = text_box.width - stroke * 2.0;
    let height = text_box.height - stroke * 2.0;

    let mut size = DEFAULT_FONT_SIZE;
    let mut face = face_at(size)?;

    let mut widest = lines[0];
    let mut widest_width = 0.0;
    for &line in &lines {
        let w = face.measure(line)?;
        if w > widest_width {
            widest = line;
            widest_width = w;
        }
    }

    while size > 1.0
        && (face.measure(widest)? > width || face.line_height() * line_count > height)
    {
        size = (size * 0.9).max(1.0);
        face = face_at(size)?;
    }

    let ascent = face.ascent();
    let line_height = face.line_height();
    let total_height = line_height * line_count;

    let stroke_paint = paint(options.text_stroke_colour());
    let text_paint = paint(options.text_colour());
    let stroke_style = Stroke {
        width: stroke * 2.0,
        line_join: LineJoin::Round,
        line_cap: LineCap::Round,
        ..Stroke::default()
    };

    for (index, line) in lines.iter().enumerate() {
        let advance = face.measure(line)?;
        let dx = match options.text_alignment_x {
            HorizontalAlignment::Left => 0.0,
            HorizontalAlignment::Middle => ((width - advance) / 2.0).floor(),
            HorizontalAlignment::Right => width - advance,
        };
        let offset = index as f32 * line_height;
        let dy = match options.text_alignment_y {
            VerticalAlignment::Top => offset,
            VerticalAlignment::Center => offset + (height / 2.0).floor() - (total_height / 2.0).floor(),
            VerticalAlignment::Bottom => height - total_height + offset,
        };

        let paths = face.line_paths(line, x + dx, y + dy + ascent)?;
        if options.text_stroke > 0 {
            for path in &paths {
                target.stroke_path(path, &stroke_paint, &stroke_style, Transform::identity(), None);
            }
        }
        for path in &paths {
            target.fill_path(path, &text_paint, FillRule::Winding, Transform::identity(), None);
        }
    }
    Ok(())
}

fn paint(colour: Colour) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(colour.r, colour.g, colour.b, colour.a);
    paint.anti_alias = true;
    paint
}

/// Straight RGBA → premultiplied pixmap
pub fn to_pixmap(image: &RgbaImage) -> RenderResult<Pixmap> {
    let (w, h) = image.dimensions();
    let mut pixmap = new_pixmap(w, h)?;
    for (dst, src) in pixmap.pixels_mut().iter_mut().zip(image.pixels()) {
        *dst = ColorU8::from_rgba(src[0], src[1], src[2], src[3]).premultiply();
    }
    Ok(pixmap)
}

/// Premultiplied pixmap → straight RGBA
#[must_use]
pub fn from_pixmap(pixmap: &Pixmap) -> RgbaImage {
    let mut image = RgbaImage::new(pixmap.width(), pixmap.height());
    for (dst, src) in image.pixels_mut().zip(pixmap.pixels()) {
        let c = src.demultiply();
        *dst = Rgba([c.red(), c.green(), c.blue(), c.alpha()]);
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use welcomer_common::ImageFormat;

    fn no_fonts(_: f32) -> RenderResult<Arc<FontFace>> {
        Err(RenderError::FontNotFound("default".into()))
    }

    fn solid(width: u32, height: u32, colour: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(colour))
    }

    #[test]
    fn test_theme_canvas_sizes() {
        let avatar = solid(256, 256, [10, 20, 30, 255]);
        for (theme, size) in [
            (Theme::Regular, (1000, 300)),
            (Theme::Badge, (964, 320)),
            (Theme::Vertical, (750, 516)),
        ] {
            let options = ImageOptions { theme, ..ImageOptions::default() };
            let layout = build_layout(&options, Some(&avatar), &no_fonts).unwrap();
            assert_eq!((layout.width, layout.height), size);
            assert_eq!(layout.overlay_anchor, (32, 32));
        }
    }

    #[test]
    fn test_text_without_font_fails() {
        let options = ImageOptions {
            text: "Welcome!".into(),
            ..ImageOptions::default()
        };
        let result = build_layout(&options, None, &no_fonts);
        assert!(matches!(result, Err(RenderError::FontNotFound(_))));
    }

    #[test]
    fn test_border_grows_canvas() {
        let background = DecodedImage::still(ImageFormat::Png, solid(10, 10, [0, 255, 0, 255]));
        let options = ImageOptions {
            border_width: 8,
            border_colour: Some(Colour::rgb(255, 0, 0)),
            ..ImageOptions::default()
        };
        let frames = compose(&options, &background, None, &no_fonts).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dimensions(), (1016, 316));
        assert_eq!(frames[0].get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(frames[0].get_pixel(500, 150).0, [0, 255, 0, 255]);
    }

    #[test]
    fn test_every_background_frame_is_composited() {
        let mut background = DecodedImage::still(ImageFormat::Gif, solid(20, 6, [0, 0, 255, 255]));
        background.frames.push(background.frames[0].clone());
        background.frames.push(background.frames[0].clone());

        let options = ImageOptions::default();
        let frames = compose(&options, &background, None, &no_fonts).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.dimensions() == (1000, 300)));
    }

    #[test]
    fn test_circle_effect_clears_corners() {
        let avatar = solid(64, 64, [200, 100, 50, 255]);
        let options = ImageOptions {
            profile_border_width: 4,
            profile_border_colour: Some(Colour::WHITE),
            profile_border_curve: ProfileBorderCurve::Circle,
            ..ImageOptions::default()
        };
        let framed = apply_avatar_effects(&avatar, &options).unwrap();
        assert_eq!(framed.dimensions(), (72, 72));
        assert_eq!(framed.get_pixel(0, 0)[3], 0);
        assert_eq!(framed.get_pixel(36, 36).0, [200, 100, 50, 255]);
    }

    #[test]
    fn test_square_effect_keeps_corners() {
        let avatar = solid(32, 32, [1, 2, 3, 255]);
        let options = ImageOptions {
            profile_border_curve: ProfileBorderCurve::Square,
            ..ImageOptions::default()
        };
        let framed = apply_avatar_effects(&avatar, &options).unwrap();
        assert_eq!(framed.get_pixel(0, 0).0, [1, 2, 3, 255]);
    }

    #[test]
    fn test_transparent_border_detection() {
        let mut avatar = solid(64, 64, [0, 0, 0, 0]);
        for x in 24..40 {
            for y in 24..40 {
                avatar.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        assert_eq!(transparent_border(&avatar), Some(8));
        assert_eq!(transparent_border(&solid(64, 64, [9, 9, 9, 255])), None);
    }

    #[test]
    fn test_fill_covers_and_crops() {
        let wide = solid(40, 10, [5, 5, 5, 255]);
        let filled = fill(&wide, 20, 20);
        assert_eq!(filled.dimensions(), (20, 20));
    }

    #[test]
    fn test_pixmap_roundtrip_preserves_opaque_pixels() {
        let image = solid(3, 3, [12, 34, 56, 255]);
        let back = from_pixmap(&to_pixmap(&image).unwrap());
        assert_eq!(back.get_pixel(1, 1).0, [12, 34, 56, 255]);
    }
}
