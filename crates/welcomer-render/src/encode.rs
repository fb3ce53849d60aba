//! Frame encoding and the process-wide quantization gate
//!
//! Animated output is quantized frame by frame (NeuQuant via the `gif`
//! crate). Quantization is CPU-bound, so every frame goes through a
//! [`QuantizeGate`] which caps how many run at once across all requests and
//! queues the rest. Still output is encoded as PNG.

use crate::error::{RenderError, RenderResult};
use crate::frames::DecodedImage;
use futures::future::try_join_all;
use image::RgbaImage;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::debug;
use welcomer_common::{ImageFormat, ImageMetrics};

/// Offset of the background colour index in a GIF logical screen descriptor
const GIF_BACKGROUND_INDEX_OFFSET: usize = 11;

/// Encoded image bytes and their container
#[derive(Debug, Clone)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

/// Counting semaphore in front of frame quantization
pub struct QuantizeGate {
    semaphore: Semaphore,
    limit: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    metrics: Option<Arc<ImageMetrics>>,
}

impl QuantizeGate {
    #[must_use]
    pub fn new(limit: usize, metrics: Option<Arc<ImageMetrics>>) -> Self {
        let limit = limit.max(1);
        if let Some(metrics) = &metrics {
            metrics.set_quantizer_limit(limit);
        }
        Self {
            semaphore: Semaphore::new(limit),
            limit,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            metrics,
        }
    }

    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Quantizations running right now
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest concurrent count observed since creation
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Wait for a permit, then run `work` on the blocking pool.
    pub async fn run<F, T>(&self, work: F) -> RenderResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| RenderError::Internal(format!("quantize gate closed: {e}")))?;
        let _slot = InFlight::enter(self);
        Ok(tokio::task::spawn_blocking(work).await?)
    }

    fn publish(&self, in_flight: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_quantizations_in_flight(in_flight);
        }
    }
}

/// Keeps the in-flight counter honest even if the blocking task panics
struct InFlight<'a> {
    gate: &'a QuantizeGate,
}

impl<'a> InFlight<'a> {
    fn enter(gate: &'a QuantizeGate) -> Self {
        let now = gate.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gate.peak.fetch_max(now, Ordering::SeqCst);
        gate.publish(now);
        Self { gate }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let now = self.gate.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.gate.publish(now);
    }
}

/// Encode composited frames.
///
/// More than one frame with `allow_animation` set yields a GIF carrying the
/// source's per-frame delay and disposal, loop count and background index.
/// Anything else yields a PNG of the first frame.
pub async fn encode_frames(
    frames: Vec<RgbaImage>,
    source: &DecodedImage,
    allow_animation: bool,
    gate: &QuantizeGate,
    speed: i32,
) -> RenderResult<Encoded> {
    if frames.len() > 1 && allow_animation {
        encode_gif(frames, source, gate, speed).await
    } else {
        let first = frames
            .into_iter()
            .next()
            .ok_or_else(|| RenderError::Encode("empty frame list".into()))?;
        let bytes = tokio::task::spawn_blocking(move || encode_png(&first)).await??;
        Ok(Encoded {
            bytes,
            format: ImageFormat::Png,
        })
    }
}

fn encode_png(frame: &RgbaImage) -> RenderResult<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    frame.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// PNG of a single colour, used as a placeholder image.
pub fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> RenderResult<Vec<u8>> {
    encode_png(&RgbaImage::from_pixel(width, height, image::Rgba(rgba)))
}

async fn encode_gif(
    frames: Vec<RgbaImage>,
    source: &DecodedImage,
    gate: &QuantizeGate,
    speed: i32,
) -> RenderResult<Encoded> {
    let start = Instant::now();
    let (width, height) = frames[0].dimensions();
    let gif_width = u16::try_from(width)
        .map_err(|_| RenderError::Encode(format!("frame width {width} too large for gif")))?;
    let gif_height = u16::try_from(height)
        .map_err(|_| RenderError::Encode(format!("frame height {height} too large for gif")))?;
    let frame_count = frames.len();

    let quantized = try_join_all(frames.into_iter().map(|frame| {
        gate.run(move || {
            let mut pixels = frame.into_raw();
            gif::Frame::from_rgba_speed(gif_width, gif_height, &mut pixels, speed)
        })
    }))
    .await?;
    let quantize_elapsed = start.elapsed();

    let mut out = Vec::new();
    {
        let mut encoder = gif::Encoder::new(&mut out, gif_width, gif_height, &[])?;
        encoder.set_repeat(source.repeat)?;
        for (index, mut frame) in quantized.into_iter().enumerate() {
            if let Some(meta) = source.frames.get(index) {
                frame.delay = meta.delay;
                frame.dispose = meta.dispose;
            }
            encoder.write_frame(&frame)?;
        }
    }

    if let Some(index) = source.background_index {
        if let Some(byte) = out.get_mut(GIF_BACKGROUND_INDEX_OFFSET) {
            *byte = index;
        }
    }

    debug!(
        "Encoded gif: {} frames, quantized in {}ms, total {}ms",
        frame_count,
        quantize_elapsed.as_millis(),
        start.elapsed().as_millis()
    );

    Ok(Encoded {
        bytes: out,
        format: ImageFormat::Gif,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::tests::two_frame_gif;
    use image::Rgba;
    use std::time::Duration;

    fn frames(count: usize) -> Vec<RgbaImage> {
        (0..count)
            .map(|i| RgbaImage::from_pixel(8, 8, Rgba([(i * 40) as u8, 0, 0, 255])))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_gate_bounds_concurrency() {
        let gate = Arc::new(QuantizeGate::new(2, None));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                gate.run(|| std::thread::sleep(Duration::from_millis(20)))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(gate.peak() <= 2);
        assert!(gate.peak() >= 1);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_gate_publishes_metrics() {
        let metrics = Arc::new(ImageMetrics::new());
        let gate = QuantizeGate::new(3, Some(Arc::clone(&metrics)));
        gate.run(|| ()).await.unwrap();
        let text = metrics.export_prometheus();
        assert!(text.contains("welcomer_images_quantizer_limit 3"));
        assert!(text.contains("welcomer_images_quantizations_in_flight 0"));
    }

    #[tokio::test]
    async fn test_still_frames_encode_as_png() {
        let gate = QuantizeGate::new(1, None);
        let source = DecodedImage::still(ImageFormat::Png, RgbaImage::new(8, 8));
        let encoded = encode_frames(frames(1), &source, true, &gate, 10).await.unwrap();
        assert_eq!(encoded.format, ImageFormat::Png);
        assert_eq!(&encoded.bytes[1..4], b"PNG");
    }

    #[tokio::test]
    async fn test_animation_disallowed_encodes_first_frame_as_png() {
        let gate = QuantizeGate::new(1, None);
        let source = DecodedImage::decode(&two_frame_gif(), ImageFormat::Gif, "bg").unwrap();
        let encoded = encode_frames(frames(2), &source, false, &gate, 10).await.unwrap();
        assert_eq!(encoded.format, ImageFormat::Png);
        assert_eq!(gate.peak(), 0);
    }

    #[tokio::test]
    async fn test_animated_gif_keeps_timing() {
        let gate = QuantizeGate::new(2, None);
        let source = DecodedImage::decode(&two_frame_gif(), ImageFormat::Gif, "bg").unwrap();
        let encoded = encode_frames(frames(2), &source, true, &gate, 10).await.unwrap();
        assert_eq!(encoded.format, ImageFormat::Gif);
        assert_eq!(&encoded.bytes[..6], b"GIF89a");

        let decoded = DecodedImage::decode(&encoded.bytes, ImageFormat::Gif, "out").unwrap();
        assert_eq!(decoded.frames.len(), 2);
        assert_eq!(decoded.frames[0].delay, 10);
        assert_eq!(decoded.frames[1].delay, 20);
        assert_eq!((decoded.width, decoded.height), (8, 8));
    }

    #[test]
    fn test_solid_png() {
        let bytes = solid_png(3, 2, [0, 0, 0, 0]).unwrap();
        let image = crate::frames::decode_any(&bytes, "solid").unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_empty_frame_list_is_an_encode_error() {
        let gate = QuantizeGate::new(1, None);
        let source = DecodedImage::still(ImageFormat::Png, RgbaImage::new(1, 1));
        let err = encode_frames(Vec::new(), &source, false, &gate, 10).await.unwrap_err();
        assert!(matches!(err, RenderError::Encode(_)));
    }
}
