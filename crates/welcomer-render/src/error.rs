//! Error types for image generation

use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

/// Broad failure class, used to pick log levels and response messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderErrorKind {
    /// A background, font or avatar could not be resolved
    Resolution,
    /// Quantization or encoding failed
    Encode,
    Internal,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("background not found: {0}")]
    BackgroundNotFound(String),

    #[error("font not found: {0}")]
    FontNotFound(String),

    #[error("avatar fetch failed: {0}")]
    AvatarFetch(String),

    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RenderError {
    pub fn decode(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> RenderErrorKind {
        match self {
            Self::BackgroundNotFound(_)
            | Self::FontNotFound(_)
            | Self::AvatarFetch(_)
            | Self::Decode { .. } => RenderErrorKind::Resolution,
            Self::Encode(_) => RenderErrorKind::Encode,
            Self::Io(_) | Self::Join(_) | Self::Internal(_) => RenderErrorKind::Internal,
        }
    }
}

impl From<gif::EncodingError> for RenderError {
    fn from(e: gif::EncodingError) -> Self {
        Self::Encode(e.to_string())
    }
}

impl From<image::ImageError> for RenderError {
    fn from(e: image::ImageError) -> Self {
        Self::Encode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            RenderError::BackgroundNotFound("x".into()).kind(),
            RenderErrorKind::Resolution
        );
        assert_eq!(
            RenderError::decode("avatar", "bad header").kind(),
            RenderErrorKind::Resolution
        );
        assert_eq!(RenderError::Encode("x".into()).kind(), RenderErrorKind::Encode);
        assert_eq!(
            RenderError::Internal("x".into()).kind(),
            RenderErrorKind::Internal
        );
    }
}
