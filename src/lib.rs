//! lexaudio - audio commentary playback for article readers
//!
//! One `PlaybackCoordinator` owns the only playing resource. Player surfaces
//! render its state and send it commands; a `PreloadCache` keeps upcoming
//! articles warm so playback starts without waiting on the network.

pub mod audio;
pub mod catalog;
pub mod error;
pub mod settings;

pub use audio::{PlaybackCoordinator, PreloadCache, RodioBackend};
pub use catalog::{ArticleAudio, Catalog};
pub use error::{MediaErrorKind, PlaybackError};
pub use settings::Settings;
