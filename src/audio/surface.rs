//! Player surfaces and the now-playing indicator
//!
//! Inline rows, the floating mini player and focus mode are thin views over
//! the coordinator. They own no audio: every command goes through
//! `PlaybackCoordinator`, and every render reads the shared `PlaybackState`.
//!
//! Inline and focus surfaces are bound to one article. The mini player is
//! bound to whatever session is active.

use std::time::Duration;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

use super::coordinator::PlaybackCoordinator;
use super::events::{
    NotificationReceiver, PlaybackNotification, PlaybackState, PlaybackStatus, StateReceiver,
};
use crate::catalog::ArticleAudio;
use crate::error::{PlaybackError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    InlineRow,
    MiniPlayer,
    FocusMode,
}

/// What a surface should render right now
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SurfaceView {
    pub article_id: Option<String>,
    pub article_number: Option<String>,
    /// This surface's article owns the session
    pub is_active: bool,
    pub is_playing: bool,
    pub is_loading: bool,
    pub is_minimized: bool,
    /// Percent, 0 to 100
    pub progress: f64,
    pub position: Duration,
    pub duration: Option<Duration>,
    pub notice: Option<&'static str>,
}

pub struct PlayerSurface {
    kind: SurfaceKind,
    article: Option<ArticleAudio>,
    coordinator: PlaybackCoordinator,
    state: StateReceiver,
}

impl std::fmt::Debug for PlayerSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerSurface")
            .field("kind", &self.kind)
            .field("article", &self.article.as_ref().map(|a| &a.article_id))
            .finish()
    }
}

impl PlayerSurface {
    /// Row player inside an article list
    pub fn inline(coordinator: &PlaybackCoordinator, article: ArticleAudio) -> Self {
        Self::bind(SurfaceKind::InlineRow, coordinator, Some(article))
    }

    /// Full-screen focus mode player
    pub fn focus(coordinator: &PlaybackCoordinator, article: ArticleAudio) -> Self {
        Self::bind(SurfaceKind::FocusMode, coordinator, Some(article))
    }

    /// Floating player that follows the active session
    pub fn mini(coordinator: &PlaybackCoordinator) -> Self {
        Self::bind(SurfaceKind::MiniPlayer, coordinator, None)
    }

    fn bind(
        kind: SurfaceKind,
        coordinator: &PlaybackCoordinator,
        article: Option<ArticleAudio>,
    ) -> Self {
        Self {
            kind,
            article,
            coordinator: coordinator.clone(),
            state: coordinator.subscribe(),
        }
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn article(&self) -> Option<&ArticleAudio> {
        self.article.as_ref()
    }

    pub fn view(&self) -> SurfaceView {
        render(self.kind, self.article.as_ref(), &self.state.borrow())
    }

    /// Wait for the next coordinator transition. `None` once the coordinator is gone.
    pub async fn changed(&mut self) -> Option<SurfaceView> {
        self.state.changed().await.ok()?;
        let view = render(self.kind, self.article.as_ref(), &self.state.borrow_and_update());
        Some(view)
    }

    /// Play/pause button
    pub async fn toggle(&self) -> Result<()> {
        let state = self.state.borrow().clone();
        match &self.article {
            Some(article) if state.is_active(&article.article_id) && state.is_playing() => {
                self.coordinator.pause_audio()
            }
            Some(article) => self.coordinator.play_audio(article.clone()).await,
            None => match (state.status, active_article(&state)) {
                (PlaybackStatus::Playing, _) => self.coordinator.pause_audio(),
                (PlaybackStatus::Paused, Some(article)) => {
                    self.coordinator.play_audio(article).await
                }
                _ => {
                    debug!("Mini player toggle ignored in {:?}", state.status);
                    Err(PlaybackError::NoActiveSession)
                }
            },
        }
    }

    /// Scrub to `percentage`. Ignored unless this surface's article is active.
    pub fn seek(&self, percentage: f64) -> Result<()> {
        if !self.view().is_active {
            debug!("Seek ignored on inactive {:?}", self.kind);
            return Ok(());
        }
        self.coordinator.seek_to(percentage)
    }

    /// Collapse or expand the mini player
    pub fn set_minimized(&self, minimized: bool) {
        if self.kind != SurfaceKind::MiniPlayer {
            debug!("Only the mini player can be minimized");
            return;
        }
        self.coordinator.set_minimized(minimized);
    }

    /// Close button. Stops playback if this surface's article is active.
    pub fn close(&self) {
        if self.view().is_active {
            self.coordinator.stop_audio();
        }
    }

    pub fn dismiss_notice(&self) {
        self.coordinator.dismiss_error();
    }
}

fn active_article(state: &PlaybackState) -> Option<ArticleAudio> {
    let id = state.active_article_id.clone()?;
    let url = state.active_url.clone()?;
    let mut article = ArticleAudio::new(id, url);
    article.article_number = state.active_article_number.clone();
    Some(article)
}

fn render(kind: SurfaceKind, article: Option<&ArticleAudio>, state: &PlaybackState) -> SurfaceView {
    let (article_id, article_number, notice) = match article {
        Some(article) => {
            let failed = state.failed_article_id.as_deref() == Some(article.article_id.as_str());
            (
                Some(article.article_id.clone()),
                article.article_number.clone(),
                state.notice().filter(|_| failed),
            )
        }
        None => (
            state.active_article_id.clone(),
            state.active_article_number.clone(),
            state.notice(),
        ),
    };

    let base = SurfaceView {
        is_active: article_id.as_deref().is_some_and(|id| state.is_active(id)),
        article_id,
        article_number,
        is_minimized: kind == SurfaceKind::MiniPlayer && state.is_minimized,
        notice,
        ..Default::default()
    };
    if !base.is_active {
        return base;
    }

    SurfaceView {
        is_playing: state.is_playing(),
        is_loading: state.is_loading(),
        progress: state.progress(),
        position: state.position,
        duration: state.duration,
        ..base
    }
}

/// Tracks which article list rows should highlight as playing.
///
/// Driven only by notifications, so it works for widgets that never see
/// the coordinator state directly.
pub struct NowPlayingIndicator {
    notifications: NotificationReceiver,
    state: StateReceiver,
    current: Option<(String, Option<String>)>,
}

impl NowPlayingIndicator {
    pub fn new(coordinator: &PlaybackCoordinator) -> Self {
        let mut indicator = Self {
            notifications: coordinator.notifications(),
            state: coordinator.subscribe(),
            current: None,
        };
        indicator.resync();
        indicator
    }

    pub fn highlighted(&self) -> Option<&str> {
        self.current.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn is_highlighted(&self, article_id: &str) -> bool {
        self.highlighted() == Some(article_id)
    }

    /// "Article 12" when a number is known, otherwise the id
    pub fn label(&self) -> Option<String> {
        self.current.as_ref().map(|(id, number)| match number {
            Some(number) => format!("Article {}", number),
            None => id.clone(),
        })
    }

    /// Drain pending notifications without waiting. Returns whether the highlight changed.
    pub fn poll(&mut self) -> bool {
        let before = self.current.clone();
        loop {
            match self.notifications.try_recv() {
                Ok(notification) => self.apply(&notification),
                Err(TryRecvError::Lagged(_)) => self.resync(),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        before != self.current
    }

    /// Wait for the next notification and apply it
    pub async fn next(&mut self) -> Option<PlaybackNotification> {
        loop {
            match self.notifications.recv().await {
                Ok(notification) => {
                    self.apply(&notification);
                    return Some(notification);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Indicator skipped {} notifications", skipped);
                    self.resync();
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn apply(&mut self, notification: &PlaybackNotification) {
        match notification {
            PlaybackNotification::NowPlaying {
                article_id,
                article_number,
                ..
            } => self.current = Some((article_id.clone(), article_number.clone())),
            PlaybackNotification::AudioEnded { article_id }
            | PlaybackNotification::Failed {
                article_id: Some(article_id),
                ..
            } => {
                if self.is_highlighted(article_id) {
                    self.current = None;
                }
            }
            PlaybackNotification::Failed { article_id: None, .. } => {}
        }
    }

    /// Rebuild the highlight from the coordinator state after missed notifications
    fn resync(&mut self) {
        let state = self.state.borrow();
        self.current = match (&state.active_article_id, state.status) {
            (Some(id), PlaybackStatus::Playing | PlaybackStatus::Paused) => {
                Some((id.clone(), state.active_article_number.clone()))
            }
            _ => None,
        };
    }
}
