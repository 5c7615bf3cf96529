//! Error types for audio playback
//!
//! Platform failures are classified into a small `MediaErrorKind` set before
//! they leave a resource. The coordinator wraps them in `PlaybackError`, which
//! is the only error type player surfaces ever see.

use thiserror::Error;

/// Classification of a failure reported by an audio resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MediaErrorKind {
    /// Fetch was aborted before it finished
    #[error("loading was aborted")]
    Aborted,
    /// Transport failure while fetching bytes
    #[error("network error")]
    Network,
    /// Bytes arrived but could not be decoded
    #[error("audio could not be decoded")]
    Decode,
    /// Source format or content type is not playable
    #[error("audio format not supported")]
    SrcNotSupported,
    #[error("unknown media error")]
    Unknown,
}

/// Errors surfaced by the playback coordinator and the preload cache
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    /// Empty or malformed audio URL, rejected before any load attempt
    #[error("invalid audio url: {0:?}")]
    InvalidUrl(String),

    /// Load or play failure reported by the resource
    #[error("media error: {0}")]
    Media(#[from] MediaErrorKind),

    /// A command needed a bound session and there was none
    #[error("no active playback session")]
    NoActiveSession,

    /// The audio backend could not be opened
    #[error("audio output unavailable: {0}")]
    Unavailable(String),
}

impl PlaybackError {
    /// Short user-facing notice for an inline, dismissable message
    pub fn notice(&self) -> &'static str {
        match self {
            PlaybackError::InvalidUrl(_) => "Audio not available",
            PlaybackError::Media(MediaErrorKind::Aborted) => "Audio loading was interrupted",
            PlaybackError::Media(MediaErrorKind::Network) => "Network error while loading audio",
            PlaybackError::Media(MediaErrorKind::Decode) => "Audio file is damaged",
            PlaybackError::Media(MediaErrorKind::SrcNotSupported) => "Audio format not supported",
            PlaybackError::Media(MediaErrorKind::Unknown) => "Audio playback failed",
            PlaybackError::NoActiveSession => "Nothing is playing",
            PlaybackError::Unavailable(_) => "Audio output unavailable",
        }
    }

    /// Whether retrying the same article can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlaybackError::Media(MediaErrorKind::Aborted | MediaErrorKind::Network | MediaErrorKind::Unknown)
        )
    }
}

/// Convenience Result type using `PlaybackError`
pub type Result<T> = std::result::Result<T, PlaybackError>;
