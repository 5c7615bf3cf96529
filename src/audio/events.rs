//! Coordinator state and notifications
//!
//! ```text
//! PlaybackCoordinator --[watch<PlaybackState>]--------> player surfaces
//! PlaybackCoordinator --[broadcast<PlaybackNotification>]--> indicators, list rows
//! ```
//!
//! Surfaces read the latest `PlaybackState` snapshot; decoupled widgets that
//! only care about "what started" and "what ended" listen to notifications.

use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::error::PlaybackError;

/// Capacity of the notification channel
pub const NOTIFICATION_CAPACITY: usize = 32;

/// Coordinator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Error,
}

impl PlaybackStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Loading | Self::Playing | Self::Paused)
    }
}

/// Snapshot published to every subscriber after each transition
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    pub active_article_id: Option<String>,
    pub active_article_number: Option<String>,
    pub active_url: Option<String>,
    pub is_minimized: bool,
    pub position: Duration,
    pub duration: Option<Duration>,
    pub volume: f32,
    /// Last failure, kept until dismissed or a new session starts
    pub error: Option<PlaybackError>,
    /// Article the last failure belongs to
    pub failed_article_id: Option<String>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Idle,
            active_article_id: None,
            active_article_number: None,
            active_url: None,
            is_minimized: false,
            position: Duration::ZERO,
            duration: None,
            volume: 1.0,
            error: None,
            failed_article_id: None,
        }
    }
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        self.status == PlaybackStatus::Playing
    }

    pub fn is_loading(&self) -> bool {
        self.status == PlaybackStatus::Loading
    }

    /// Whether `article_id` owns the current session
    pub fn is_active(&self, article_id: &str) -> bool {
        self.active_article_id.as_deref() == Some(article_id)
    }

    /// Playback progress in percent (0 to 100), zero while duration is unknown
    pub fn progress(&self) -> f64 {
        match self.duration {
            Some(total) if !total.is_zero() => {
                (self.position.as_secs_f64() / total.as_secs_f64() * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        }
    }

    /// Inline notice text for the current error, if any
    pub fn notice(&self) -> Option<&'static str> {
        self.error.as_ref().map(PlaybackError::notice)
    }

    /// Record a failure for `article_id`
    pub(crate) fn set_error(&mut self, article_id: Option<String>, error: PlaybackError) {
        self.error = Some(error);
        self.failed_article_id = article_id;
    }

    /// Forget the last failure. Returns whether there was one.
    pub(crate) fn clear_error(&mut self) -> bool {
        self.failed_article_id = None;
        self.error.take().is_some()
    }

    /// Drop session fields, keeping user preferences
    pub(crate) fn clear_session(&mut self) {
        self.active_article_id = None;
        self.active_article_number = None;
        self.active_url = None;
        self.position = Duration::ZERO;
        self.duration = None;
    }
}

/// Process-wide playback notifications
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackNotification {
    NowPlaying {
        article_id: String,
        article_number: Option<String>,
        audio_url: String,
    },
    AudioEnded {
        article_id: String,
    },
    Failed {
        article_id: Option<String>,
        error: PlaybackError,
    },
}

pub type StateSender = watch::Sender<PlaybackState>;
pub type StateReceiver = watch::Receiver<PlaybackState>;
pub type NotificationSender = broadcast::Sender<PlaybackNotification>;
pub type NotificationReceiver = broadcast::Receiver<PlaybackNotification>;

/// Create the state channel
pub fn state_channel(initial: PlaybackState) -> (StateSender, StateReceiver) {
    watch::channel(initial)
}

/// Create the notification channel
pub fn notification_channel() -> NotificationSender {
    broadcast::channel(NOTIFICATION_CAPACITY).0
}
