//! Decoded image resources
//!
//! Backgrounds and avatars are decoded once into straight-alpha RGBA frames.
//! Animated GIFs are composited frame by frame according to each frame's
//! disposal method, so every [`Frame`] holds the full canvas as it would be
//! displayed.

use crate::error::{RenderError, RenderResult};
use gif::{ColorOutput, DisposalMethod};
use image::RgbaImage;
use std::io::Cursor;
use std::path::Path;
use welcomer_common::ImageFormat;

/// One displayed frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbaImage,
    /// Delay in hundredths of a second
    pub delay: u16,
    pub dispose: DisposalMethod,
}

/// A decoded background or avatar
///
/// Static sources always decode to exactly one frame; GIF sources keep
/// their frame order, timing and loop metadata.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub format: ImageFormat,
    pub frames: Vec<Frame>,
    pub width: u32,
    pub height: u32,
    pub repeat: gif::Repeat,
    /// Background colour index of the source's global palette
    pub background_index: Option<u8>,
}

impl DecodedImage {
    /// Wrap a single still image.
    #[must_use]
    pub fn still(format: ImageFormat, image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            format,
            frames: vec![Frame {
                image,
                delay: 0,
                dispose: DisposalMethod::Keep,
            }],
            width,
            height,
            repeat: gif::Repeat::Infinite,
            background_index: None,
        }
    }

    #[must_use]
    pub fn is_animated(&self) -> bool {
        self.frames.len() > 1
    }

    /// Decode `bytes` as `format`.
    pub fn decode(bytes: &[u8], format: ImageFormat, what: &str) -> RenderResult<Self> {
        match format {
            ImageFormat::Gif => decode_gif(bytes, what),
            ImageFormat::Png => decode_still(bytes, image::ImageFormat::Png, format, what),
            ImageFormat::Jpeg => decode_still(bytes, image::ImageFormat::Jpeg, format, what),
        }
    }

    /// Read and decode a file, picking the decoder from its extension.
    pub fn open(path: &Path) -> RenderResult<Self> {
        let what = path.display().to_string();
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ImageFormat::from_extension)
            .ok_or_else(|| RenderError::decode(&what, "unsupported file extension"))?;
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes, format, &what)
    }
}

/// Decode a still image of unknown format (avatars, fallback assets).
pub fn decode_any(bytes: &[u8], what: &str) -> RenderResult<RgbaImage> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| RenderError::decode(what, e))
}

fn decode_still(
    bytes: &[u8],
    decoder: image::ImageFormat,
    format: ImageFormat,
    what: &str,
) -> RenderResult<DecodedImage> {
    let image = image::load_from_memory_with_format(bytes, decoder)
        .map_err(|e| RenderError::decode(what, e))?
        .to_rgba8();
    Ok(DecodedImage::still(format, image))
}

fn decode_gif(bytes: &[u8], what: &str) -> RenderResult<DecodedImage> {
    let mut options = gif::DecodeOptions::new();
    options.set_color_output(ColorOutput::RGBA);
    let mut decoder = options
        .read_info(Cursor::new(bytes))
        .map_err(|e| RenderError::decode(what, e))?;

    let width = u32::from(decoder.width());
    let height = u32::from(decoder.height());
    let background_index = decoder.bg_color().and_then(|i| u8::try_from(i).ok());

    let mut canvas = RgbaImage::new(width, height);
    let mut frames = Vec::new();

    while let Some(frame) = decoder
        .read_next_frame()
        .map_err(|e| RenderError::decode(what, e))?
    {
        let left = u32::from(frame.left);
        let top = u32::from(frame.top);
        let frame_width = u32::from(frame.width);
        let frame_height = u32::from(frame.height);
        let dispose = frame.dispose;
        let delay = frame.delay;

        let previous = (dispose == DisposalMethod::Previous).then(|| canvas.clone());

        for (i, pixel) in frame.buffer.chunks_exact(4).enumerate() {
            // Transparent palette entries leave the canvas untouched
            if pixel[3] == 0 {
                continue;
            }
            let i = u32::try_from(i).unwrap_or(u32::MAX);
            let x = left + i % frame_width;
            let y = top + i / frame_width;
            if x < width && y < height {
                canvas.put_pixel(x, y, image::Rgba([pixel[0], pixel[1], pixel[2], pixel[3]]));
            }
        }

        frames.push(Frame {
            image: canvas.clone(),
            delay,
            dispose,
        });

        match dispose {
            DisposalMethod::Background => {
                for y in top..(top + frame_height).min(height) {
                    for x in left..(left + frame_width).min(width) {
                        canvas.put_pixel(x, y, image::Rgba([0, 0, 0, 0]));
                    }
                }
            }
            DisposalMethod::Previous => {
                if let Some(previous) = previous {
                    canvas = previous;
                }
            }
            DisposalMethod::Any | DisposalMethod::Keep => {}
        }
    }

    if frames.is_empty() {
        return Err(RenderError::decode(what, "gif contains no frames"));
    }

    let repeat = decoder.repeat();

    Ok(DecodedImage {
        format: ImageFormat::Gif,
        frames,
        width,
        height,
        repeat,
        background_index,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two-frame 4x4 GIF: red then blue.
    pub(crate) fn two_frame_gif() -> Vec<u8> {
        let palette = [255u8, 0, 0, 0, 0, 255];
        let mut out = Vec::new();
        {
            let mut encoder = gif::Encoder::new(&mut out, 4, 4, &palette).unwrap();
            encoder.set_repeat(gif::Repeat::Infinite).unwrap();
            for (index, delay) in [(0u8, 10u16), (1u8, 20u16)] {
                let mut frame = gif::Frame::default();
                frame.width = 4;
                frame.height = 4;
                frame.delay = delay;
                frame.dispose = DisposalMethod::Background;
                frame.buffer = std::borrow::Cow::Owned(vec![index; 16]);
                encoder.write_frame(&frame).unwrap();
            }
        }
        out
    }

    pub(crate) fn png_bytes(width: u32, height: u32, colour: [u8; 4]) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, image::Rgba(colour));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_png_is_single_frame() {
        let bytes = png_bytes(3, 2, [1, 2, 3, 255]);
        let decoded = DecodedImage::decode(&bytes, ImageFormat::Png, "test").unwrap();
        assert_eq!(decoded.frames.len(), 1);
        assert!(!decoded.is_animated());
        assert_eq!((decoded.width, decoded.height), (3, 2));
        assert_eq!(decoded.frames[0].image.get_pixel(0, 0).0, [1, 2, 3, 255]);
    }

    #[test]
    fn test_decode_gif_preserves_frames() {
        let decoded = DecodedImage::decode(&two_frame_gif(), ImageFormat::Gif, "test").unwrap();
        assert!(decoded.is_animated());
        assert_eq!(decoded.frames.len(), 2);
        assert_eq!(decoded.frames[0].delay, 10);
        assert_eq!(decoded.frames[1].delay, 20);
        assert_eq!(decoded.frames[0].dispose, DisposalMethod::Background);
        assert_eq!(decoded.frames[0].image.get_pixel(1, 1).0, [255, 0, 0, 255]);
        assert_eq!(decoded.frames[1].image.get_pixel(1, 1).0, [0, 0, 255, 255]);
        assert_eq!(decoded.repeat, gif::Repeat::Infinite);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = DecodedImage::decode(b"not an image", ImageFormat::Png, "bg").unwrap_err();
        assert!(matches!(err, RenderError::Decode { .. }));
        assert!(decode_any(b"nope", "avatar").is_err());
    }

    #[test]
    fn test_open_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg.bmp");
        std::fs::write(&path, b"x").unwrap();
        assert!(DecodedImage::open(&path).is_err());
    }
}
