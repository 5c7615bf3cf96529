//! Audio playback module
//!
//! - `PlaybackCoordinator`: the single shared "now playing" slot
//! - `PreloadCache`: URL -> warm resource, bounded and deduplicated
//! - `PlayerSurface` / `NowPlayingIndicator`: UI-side consumers of coordinator state
//! - `Visualizer`: spectrum bars from the playing resource, idle animation otherwise
//! - `RodioBackend`: rodio output with reqwest streaming downloads
//! - `streaming`: streaming buffer and download utilities

pub mod analyzer;
pub mod cache;
pub mod coordinator;
pub mod events;
mod progress;
pub mod resource;
pub mod rodio_backend;
pub mod streaming;
#[cfg(test)]
mod stub;
pub mod surface;
pub mod visualizer;

pub use analyzer::AnalysisTap;
pub use cache::PreloadCache;
pub use coordinator::PlaybackCoordinator;
pub use events::{
    NotificationReceiver, PlaybackNotification, PlaybackState, PlaybackStatus, StateReceiver,
};
pub use resource::{AudioBackend, AudioResource, LoadState, Playable, ResourceEvent, ShadowResource};
pub use rodio_backend::RodioBackend;
pub use surface::{NowPlayingIndicator, PlayerSurface, SurfaceKind, SurfaceView};
pub use visualizer::{Visualizer, VisualizerFrame, VisualizerMode};
