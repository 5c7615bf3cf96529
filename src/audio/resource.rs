//! Platform audio abstraction
//!
//! An `AudioResource` is a stateful handle to one loadable audio stream. All
//! state changes are reported through `ResourceEvent`s; callers subscribe
//! before issuing commands and never assume synchronous completion.
//!
//! ```text
//! Unloaded --load()--> Loading --CanPlayThrough--> Ready
//!                         \------Error(kind)-----> Error
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::analyzer::AnalysisTap;
use crate::error::MediaErrorKind;

/// Capacity of a resource's event channel
pub const RESOURCE_EVENT_CAPACITY: usize = 64;

/// Load state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Ready,
    Error,
}

/// Signals emitted by a resource
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    /// Fetch started
    LoadStart,
    /// Enough data is buffered to play without stalling
    CanPlayThrough,
    /// Duration resolved
    LoadedMetadata { duration: Duration },
    /// Playback position moved
    TimeUpdate { position: Duration },
    Play,
    Pause,
    /// Natural end of stream
    Ended,
    Error(MediaErrorKind),
}

pub type ResourceEventSender = broadcast::Sender<ResourceEvent>;
pub type ResourceEventReceiver = broadcast::Receiver<ResourceEvent>;

/// Create a resource event channel
pub fn resource_event_channel() -> ResourceEventSender {
    broadcast::channel(RESOURCE_EVENT_CAPACITY).0
}

/// A loadable, playable audio stream
#[async_trait]
pub trait AudioResource: Send + Sync {
    /// Source URL, immutable for the lifetime of the resource
    fn url(&self) -> &str;

    fn load_state(&self) -> LoadState;

    /// Start fetching. Calling it again while loading or ready does nothing.
    fn load(&self);

    /// Start or resume playback, resolving once output has begun
    async fn play(&self) -> Result<(), MediaErrorKind>;

    fn pause(&self);

    fn is_paused(&self) -> bool;

    fn current_time(&self) -> Duration;

    fn set_current_time(&self, position: Duration);

    /// Total length, `None` until metadata resolves
    fn duration(&self) -> Option<Duration>;

    fn volume(&self) -> f32;

    fn set_volume(&self, volume: f32);

    fn subscribe(&self) -> ResourceEventReceiver;

    /// Stop output and drop playback state. The resource is unusable afterwards.
    fn release(&self);

    /// Fresh playable instance sharing fetched bytes but no playback state
    fn fork(&self) -> Arc<dyn AudioResource>;

    /// Spectrum tap on this instance's output, if the backend provides one
    fn analysis(&self) -> Option<AnalysisTap> {
        None
    }
}

impl std::fmt::Debug for dyn AudioResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioResource")
            .field("url", &self.url())
            .field("load_state", &self.load_state())
            .finish_non_exhaustive()
    }
}

/// Factory for resources bound to one output device
pub trait AudioBackend: Send + Sync {
    fn create(&self, url: &str) -> Arc<dyn AudioResource>;
}

/// A playable instance handed out by the preload cache.
///
/// Only the playback coordinator can drive it, so a player surface that
/// obtains one cannot start a second audible stream on its own.
pub struct Playable(Arc<dyn AudioResource>);

impl Playable {
    pub(crate) fn new(resource: Arc<dyn AudioResource>) -> Self {
        Self(resource)
    }

    pub fn url(&self) -> &str {
        self.0.url()
    }

    pub(crate) fn into_inner(self) -> Arc<dyn AudioResource> {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn resource(&self) -> &Arc<dyn AudioResource> {
        &self.0
    }
}

impl std::fmt::Debug for Playable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Playable").field(&self.0.url()).finish()
    }
}

/// A muted, non-authoritative instance for analysis-only consumers.
///
/// It can be started to feed a spectrum tap but never affects the
/// coordinator's session and is released when dropped.
pub struct ShadowResource(Arc<dyn AudioResource>);

impl ShadowResource {
    pub(crate) fn new(resource: Arc<dyn AudioResource>) -> Self {
        resource.set_volume(0.0);
        Self(resource)
    }

    pub fn url(&self) -> &str {
        self.0.url()
    }

    pub async fn start(&self) -> Result<(), MediaErrorKind> {
        self.0.set_volume(0.0);
        self.0.play().await
    }

    pub fn stop(&self) {
        self.0.pause();
    }

    pub fn analysis(&self) -> Option<AnalysisTap> {
        self.0.analysis()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.0.duration()
    }
}

impl Drop for ShadowResource {
    fn drop(&mut self) {
        self.0.release();
    }
}
