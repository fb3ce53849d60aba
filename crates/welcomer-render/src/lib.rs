//! Welcomer Render - Image generation for welcomer-images
//!
//! This crate provides:
//! - Idle-evicting caches for backgrounds, avatars and font faces
//! - Background and avatar decoding, including animated GIFs
//! - Theme layout and text rendering
//! - PNG/GIF encoding behind a process-wide quantization gate

pub mod avatar;
pub mod cache;
pub mod encode;
pub mod error;
pub mod fonts;
pub mod frames;
pub mod pipeline;
pub mod theme;

pub use avatar::{AvatarSource, CdnAvatarSource};
pub use cache::{SweepOutcome, TtlCache};
pub use encode::{Encoded, QuantizeGate};
pub use error::{RenderError, RenderErrorKind, RenderResult};
pub use fonts::{FontFace, FontLibrary};
pub use frames::DecodedImage;
pub use pipeline::{BackgroundSource, CacheSweep, Generator, GeneratorSettings};
