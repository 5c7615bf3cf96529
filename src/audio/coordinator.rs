//! Playback coordinator - the single "now playing" slot
//!
//! Every player surface issues commands here and renders the published
//! `PlaybackState`. No surface holds its own playing resource.
//!
//! ```text
//! Idle --play_audio--> Loading --play resolved--> Playing <--pause/resume--> Paused
//!                         |                          |                          |
//!                         +--load/play error--> Error                           |
//!                                                    +--stop / ended--> Idle <--+
//! ```
//!
//! Starting a session tears down the previous one first (pause, rewind,
//! detach listener, release, stop ticker) while holding the slot lock, so
//! two sessions never overlap. Each session carries a generation id;
//! anything that resolves after its session was replaced is discarded.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::analyzer::AnalysisTap;
use super::cache::{PreloadCache, check_url};
use super::events::{
    NotificationReceiver, NotificationSender, PlaybackNotification, PlaybackState, PlaybackStatus,
    StateReceiver, StateSender, notification_channel, state_channel,
};
use super::progress::ProgressTicker;
use super::resource::{AudioResource, ResourceEvent, ResourceEventReceiver};
use crate::catalog::ArticleAudio;
use crate::error::{PlaybackError, Result};
use crate::settings::PlaybackSettings;

/// One article bound to the slot
struct Session {
    id: u64,
    article: ArticleAudio,
    status: PlaybackStatus,
    /// `None` while the resource is still being fetched
    resource: Option<Arc<dyn AudioResource>>,
    listener: Option<JoinHandle<()>>,
    ticker: Option<ProgressTicker>,
}

impl Session {
    fn loading(id: u64, article: ArticleAudio) -> Self {
        Self {
            id,
            article,
            status: PlaybackStatus::Loading,
            resource: None,
            listener: None,
            ticker: None,
        }
    }

    /// Silence the resource and drop every handle the session owns
    fn teardown(&mut self) {
        self.ticker = None;
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(resource) = self.resource.take() {
            resource.pause();
            resource.set_current_time(Duration::ZERO);
            resource.release();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct Slot {
    generation: u64,
    session: Option<Session>,
    volume: f32,
}

impl Slot {
    fn current(&mut self, id: u64) -> Option<&mut Session> {
        self.session.as_mut().filter(|s| s.id == id)
    }
}

struct CoordinatorInner {
    cache: PreloadCache,
    settings: PlaybackSettings,
    slot: Mutex<Slot>,
    state: StateSender,
    notifications: NotificationSender,
}

/// How a `play_audio` request relates to the current slot
enum Start {
    AlreadyActive,
    Resume(u64, Arc<dyn AudioResource>),
    Fresh(u64),
}

/// Shared handle to the coordinator. Construct once and pass it to every surface.
#[derive(Clone)]
pub struct PlaybackCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for PlaybackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("PlaybackCoordinator")
            .field("status", &state.status)
            .field("active_article_id", &state.active_article_id)
            .finish_non_exhaustive()
    }
}

impl PlaybackCoordinator {
    pub fn new(cache: PreloadCache, settings: PlaybackSettings) -> Self {
        let volume = settings.initial_volume.clamp(0.0, 1.0);
        let (state, _) = state_channel(PlaybackState {
            volume,
            ..Default::default()
        });
        Self {
            inner: Arc::new(CoordinatorInner {
                cache,
                settings,
                slot: Mutex::new(Slot {
                    generation: 0,
                    session: None,
                    volume,
                }),
                state,
                notifications: notification_channel(),
            }),
        }
    }

    pub fn cache(&self) -> &PreloadCache {
        &self.inner.cache
    }

    /// Latest published state
    pub fn state(&self) -> PlaybackState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that wakes on every state change
    pub fn subscribe(&self) -> StateReceiver {
        self.inner.state.subscribe()
    }

    /// Process-wide now-playing / ended / failed notifications
    pub fn notifications(&self) -> NotificationReceiver {
        self.inner.notifications.subscribe()
    }

    /// Play `article`, taking over whatever was playing.
    ///
    /// Calling it again for the active article resumes a paused session and
    /// is a no-op while loading or playing. Failures are also published to
    /// the state and the notification channel.
    pub async fn play_audio(&self, article: ArticleAudio) -> Result<()> {
        if let Err(e) = check_url(&article.audio_url) {
            warn!("Rejected audio for {}: {}", article.article_id, e);
            self.inner.reject(&article, e.clone());
            return Err(e);
        }

        match self.inner.begin(&article) {
            Start::AlreadyActive => Ok(()),
            Start::Resume(id, resource) => self.inner.clone().start(id, resource, false).await,
            Start::Fresh(id) => {
                let playable = match self.inner.cache.get(&article.audio_url) {
                    Some(playable) => playable,
                    None => match self.inner.cache.preload(&article.audio_url).await {
                        Ok(playable) => playable,
                        Err(e) => return self.inner.fail(id, e),
                    },
                };
                let resource = playable.into_inner();
                if !self.inner.attach(id, resource.clone()) {
                    resource.release();
                    return Ok(());
                }
                self.inner.clone().start(id, resource, true).await
            }
        }
    }

    /// Pause the playing session, keeping its position
    pub fn pause_audio(&self) -> Result<()> {
        let mut slot = self.inner.slot.lock();
        let Some(session) = slot.session.as_mut() else {
            debug!("Pause ignored: no active session");
            return Err(PlaybackError::NoActiveSession);
        };
        if session.status != PlaybackStatus::Playing {
            debug!("Pause ignored in {:?}", session.status);
            return Ok(());
        }

        session.ticker = None;
        session.status = PlaybackStatus::Paused;
        let position = session.resource.as_ref().map(|resource| {
            resource.pause();
            resource.current_time()
        });
        info!("Paused {}", session.article.article_id);

        self.inner.state.send_modify(|state| {
            state.status = PlaybackStatus::Paused;
            if let Some(position) = position {
                state.position = position;
            }
        });
        Ok(())
    }

    /// End the active session and return to idle
    pub fn stop_audio(&self) {
        let mut slot = self.inner.slot.lock();
        match slot.session.take() {
            Some(session) => {
                info!("Stopped {}", session.article.article_id);
                self.inner.finish(session);
            }
            None => debug!("Stop ignored: no active session"),
        }
    }

    /// Seek to `percentage` (0 to 100) of the known duration.
    ///
    /// Ignored while the duration is unknown or zero. The resource may take a
    /// while to reach the target, so the slot is not held while it seeks.
    pub fn seek_to(&self, percentage: f64) -> Result<()> {
        let (id, resource, duration) = {
            let slot = self.inner.slot.lock();
            let Some(session) = slot.session.as_ref() else {
                debug!("Seek ignored: no active session");
                return Err(PlaybackError::NoActiveSession);
            };
            let Some(resource) = session.resource.clone() else {
                debug!("Seek ignored while loading {}", session.article.article_id);
                return Ok(());
            };
            let Some(duration) = resource.duration().filter(|d| !d.is_zero()) else {
                debug!("Seek ignored: duration unknown");
                return Ok(());
            };
            (session.id, resource, duration)
        };
        if !percentage.is_finite() {
            warn!("Seek ignored: invalid percentage {}", percentage);
            return Ok(());
        }

        let target = duration.mul_f64(percentage.clamp(0.0, 100.0) / 100.0);
        resource.set_current_time(target);

        let mut slot = self.inner.slot.lock();
        if slot.current(id).is_some() {
            self.inner.state.send_modify(|state| {
                state.position = target;
                state.duration = Some(duration);
            });
        }
        Ok(())
    }

    /// Set output volume (clamped to 0.0..=1.0); carried over to later sessions
    pub fn set_volume(&self, level: f32) {
        if level.is_nan() {
            warn!("Volume ignored: NaN");
            return;
        }
        let volume = level.clamp(0.0, 1.0);
        let mut slot = self.inner.slot.lock();
        slot.volume = volume;
        if let Some(resource) = slot.session.as_ref().and_then(|s| s.resource.as_ref()) {
            resource.set_volume(volume);
        }
        self.inner.state.send_modify(|state| state.volume = volume);
    }

    /// UI hint for the floating player; has no effect on playback
    pub fn set_minimized(&self, minimized: bool) {
        self.inner
            .state
            .send_if_modified(|state| std::mem::replace(&mut state.is_minimized, minimized) != minimized);
    }

    /// Clear the surfaced error notice
    pub fn dismiss_error(&self) {
        self.inner.state.send_if_modified(|state| {
            let had_error = state.clear_error();
            if had_error && state.status == PlaybackStatus::Error {
                state.status = PlaybackStatus::Idle;
            }
            had_error
        });
    }

    /// Spectrum tap of the resource bound to the active session
    pub fn analysis_tap(&self) -> Option<AnalysisTap> {
        let slot = self.inner.slot.lock();
        slot.session
            .as_ref()
            .and_then(|s| s.resource.as_ref())
            .and_then(|r| r.analysis())
    }
}

impl CoordinatorInner {
    /// Decide how to serve a play request; tears down a different session
    fn begin(&self, article: &ArticleAudio) -> Start {
        let mut slot = self.slot.lock();

        if let Some(session) = slot
            .session
            .as_ref()
            .filter(|s| s.article.article_id == article.article_id)
        {
            match (session.status, session.resource.as_ref()) {
                (PlaybackStatus::Paused, Some(resource)) => {
                    return Start::Resume(session.id, resource.clone());
                }
                (PlaybackStatus::Loading | PlaybackStatus::Playing, _) => {
                    debug!("{} already active", article.article_id);
                    return Start::AlreadyActive;
                }
                _ => {}
            }
        }

        if let Some(mut previous) = slot.session.take() {
            info!(
                "Takeover: {} replaces {}",
                article.article_id, previous.article.article_id
            );
            previous.teardown();
        }

        slot.generation += 1;
        let id = slot.generation;
        slot.session = Some(Session::loading(id, article.clone()));

        self.state.send_modify(|state| {
            state.clear_session();
            state.status = PlaybackStatus::Loading;
            state.active_article_id = Some(article.article_id.clone());
            state.active_article_number = article.article_number.clone();
            state.active_url = Some(article.audio_url.clone());
            state.clear_error();
        });
        Start::Fresh(id)
    }

    /// Bind a fetched resource to session `id`. Returns false if it was superseded.
    fn attach(self: &Arc<Self>, id: u64, resource: Arc<dyn AudioResource>) -> bool {
        let mut slot = self.slot.lock();
        let volume = slot.volume;
        let Some(session) = slot.current(id) else {
            debug!("Session {} superseded while loading", id);
            return false;
        };

        resource.set_volume(volume);
        let events = resource.subscribe();
        session.listener = Some(tokio::spawn(listen(Arc::downgrade(self), id, events)));
        session.resource = Some(resource);
        true
    }

    /// Start or resume output for session `id`
    async fn start(
        self: Arc<Self>,
        id: u64,
        resource: Arc<dyn AudioResource>,
        announce: bool,
    ) -> Result<()> {
        if let Err(kind) = resource.play().await {
            return self.fail(id, PlaybackError::Media(kind));
        }

        let mut slot = self.slot.lock();
        let Some(session) = slot.current(id) else {
            debug!("Session {} superseded before playback began", id);
            resource.pause();
            return Ok(());
        };

        session.status = PlaybackStatus::Playing;
        session.ticker = Some(self.start_ticker(id, resource.clone()));
        let article = session.article.clone();
        info!("Playing {}", article.article_id);

        let position = resource.current_time();
        let duration = resource.duration();
        self.state.send_modify(|state| {
            state.status = PlaybackStatus::Playing;
            state.position = position;
            if duration.is_some() {
                state.duration = duration;
            }
        });
        if announce {
            let _ = self.notifications.send(PlaybackNotification::NowPlaying {
                article_id: article.article_id,
                article_number: article.article_number,
                audio_url: article.audio_url,
            });
        }
        Ok(())
    }

    fn start_ticker(self: &Arc<Self>, id: u64, resource: Arc<dyn AudioResource>) -> ProgressTicker {
        let inner = Arc::downgrade(self);
        ProgressTicker::start(self.settings.progress_interval(), move || {
            inner
                .upgrade()
                .is_some_and(|inner| inner.sample(id, resource.as_ref()))
        })
    }

    /// Copy position and duration from the resource into the state
    fn sample(&self, id: u64, resource: &dyn AudioResource) -> bool {
        let mut slot = self.slot.lock();
        if slot.current(id).is_none() {
            return false;
        }
        let position = resource.current_time();
        let duration = resource.duration();
        self.state.send_if_modified(|state| {
            let changed = state.position != position || (duration.is_some() && state.duration != duration);
            state.position = position;
            if duration.is_some() {
                state.duration = duration;
            }
            changed
        });
        true
    }

    /// Apply a resource event to session `id`. Returns false once the session is over.
    fn handle_event(self: &Arc<Self>, id: u64, event: ResourceEvent) -> bool {
        let mut slot = self.slot.lock();
        let Some(session) = slot.current(id) else {
            return false;
        };

        match event {
            ResourceEvent::LoadedMetadata { duration } => {
                self.state.send_modify(|state| state.duration = Some(duration));
            }
            ResourceEvent::TimeUpdate { position } => {
                self.state.send_modify(|state| state.position = position);
            }
            ResourceEvent::Pause if session.status == PlaybackStatus::Playing => {
                debug!("{} paused by the platform", session.article.article_id);
                session.ticker = None;
                session.status = PlaybackStatus::Paused;
                self.state.send_modify(|state| state.status = PlaybackStatus::Paused);
            }
            ResourceEvent::Play if session.status == PlaybackStatus::Paused => {
                debug!("{} resumed by the platform", session.article.article_id);
                session.status = PlaybackStatus::Playing;
                if let Some(resource) = session.resource.clone() {
                    session.ticker = Some(self.start_ticker(id, resource));
                }
                self.state.send_modify(|state| state.status = PlaybackStatus::Playing);
            }
            ResourceEvent::Ended => {
                if let Some(session) = slot.session.take() {
                    info!("Finished {}", session.article.article_id);
                    self.finish(session);
                }
                return false;
            }
            ResourceEvent::Error(kind) => {
                drop(slot);
                let _ = self.fail(id, PlaybackError::Media(kind));
                return false;
            }
            _ => {}
        }
        true
    }

    /// Tear down `session`, go idle and announce the end
    fn finish(&self, mut session: Session) {
        session.teardown();
        let article_id = session.article.article_id.clone();
        self.state.send_modify(|state| {
            state.clear_session();
            state.status = PlaybackStatus::Idle;
        });
        let _ = self
            .notifications
            .send(PlaybackNotification::AudioEnded { article_id });
    }

    /// Fail session `id`. A superseded session fails silently.
    fn fail(&self, id: u64, error: PlaybackError) -> Result<()> {
        let mut slot = self.slot.lock();
        let Some(mut session) = slot.session.take_if(|s| s.id == id) else {
            debug!("Ignoring failure of superseded session {}: {}", id, error);
            return Ok(());
        };
        session.teardown();
        error!("Playback of {} failed: {}", session.article.article_id, error);

        self.state.send_modify(|state| {
            state.clear_session();
            state.status = PlaybackStatus::Error;
            state.set_error(Some(session.article.article_id.clone()), error.clone());
        });
        let _ = self.notifications.send(PlaybackNotification::Failed {
            article_id: Some(session.article.article_id.clone()),
            error: error.clone(),
        });
        Err(error)
    }

    /// Surface an invalid request without touching the current session
    fn reject(&self, article: &ArticleAudio, error: PlaybackError) {
        self.state
            .send_modify(|state| state.set_error(Some(article.article_id.clone()), error.clone()));
        let _ = self.notifications.send(PlaybackNotification::Failed {
            article_id: Some(article.article_id.clone()),
            error,
        });
    }
}

async fn listen(inner: Weak<CoordinatorInner>, id: u64, mut events: ResourceEventReceiver) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Session {} listener skipped {} events", id, skipped);
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.handle_event(id, event) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stub::{Behavior, Op, StubBackend, StubResource};
    use crate::error::MediaErrorKind;
    use crate::settings::PreloadSettings;

    fn url(n: u32) -> String {
        format!("https://cdn.test/art-{n}.mp3")
    }

    fn article(n: u32) -> ArticleAudio {
        ArticleAudio::new(format!("art-{n}"), url(n))
    }

    fn setup() -> (StubBackend, PlaybackCoordinator) {
        let backend = StubBackend::new();
        let cache = PreloadCache::new(Arc::new(backend.clone()), PreloadSettings::default());
        let coordinator = PlaybackCoordinator::new(cache, PlaybackSettings::default());
        (backend, coordinator)
    }

    /// Let spawned listeners drain their events
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_session_plays_at_a_time() {
        let (backend, coordinator) = setup();

        for n in 1..=3 {
            coordinator.play_audio(article(n)).await.unwrap();
            settle().await;

            let audible: Vec<_> = backend
                .instances()
                .into_iter()
                .filter(|r| r.was_played() && !r.is_paused())
                .collect();
            assert_eq!(audible.len(), 1);
            assert_eq!(audible[0].url(), url(n));
            assert!(coordinator.state().is_active(&format!("art-{n}")));
        }

        let first = backend.playing_instance(&url(1)).unwrap();
        assert!(first.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_silences_old_session_before_new_load() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        let first = backend.playing_instance(&url(1)).unwrap();

        coordinator.play_audio(article(2)).await.unwrap();

        let paused = backend
            .position(|c| c.instance == first.instance() && c.op == Op::Pause)
            .unwrap();
        let released = backend
            .position(|c| c.instance == first.instance() && c.op == Op::Release)
            .unwrap();
        let next = backend
            .position(|c| c.url == url(2) && c.op == Op::Create)
            .unwrap();
        assert!(paused < next);
        assert!(released < next);
        assert_eq!(first.current_time(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_while_loading_discards_stale_result() {
        let (backend, coordinator) = setup();
        backend.set_behavior(
            &url(1),
            Behavior {
                load_delay: Duration::from_secs(1),
                ..Default::default()
            },
        );

        let slow = coordinator.clone();
        let pending = tokio::spawn(async move { slow.play_audio(article(1)).await });
        tokio::task::yield_now().await;
        assert!(coordinator.state().is_loading());

        coordinator.play_audio(article(2)).await.unwrap();
        assert!(pending.await.unwrap().is_ok());
        settle().await;

        let state = coordinator.state();
        assert!(state.is_playing());
        assert!(state.is_active("art-2"));
        assert!(backend.playing_instance(&url(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_resets_and_notifies() {
        let (backend, coordinator) = setup();
        let mut notes = coordinator.notifications();

        coordinator.play_audio(article(1)).await.unwrap();
        let instance = backend.playing_instance(&url(1)).unwrap();
        instance.advance(Duration::from_secs(30));
        instance.finish();
        settle().await;

        let state = coordinator.state();
        assert_eq!(state.status, PlaybackStatus::Idle);
        assert!(state.active_article_id.is_none());
        assert_eq!(state.position, Duration::ZERO);
        assert_eq!(state.progress(), 0.0);
        assert!(instance.is_released());

        assert!(matches!(
            notes.recv().await.unwrap(),
            PlaybackNotification::NowPlaying { ref article_id, .. } if article_id == "art-1"
        ));
        assert_eq!(
            notes.recv().await.unwrap(),
            PlaybackNotification::AudioEnded {
                article_id: "art-1".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn seek_maps_percentage_onto_duration() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        settle().await;

        coordinator.seek_to(50.0).unwrap();

        let instance = backend.playing_instance(&url(1)).unwrap();
        assert_eq!(instance.current_time(), Duration::from_secs(100));
        let state = coordinator.state();
        assert_eq!(state.position, Duration::from_secs(100));
        assert!((state.progress() - 50.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_is_ignored_while_duration_unknown() {
        let (backend, coordinator) = setup();
        assert_eq!(coordinator.seek_to(10.0), Err(PlaybackError::NoActiveSession));

        backend.set_behavior(
            &url(1),
            Behavior {
                duration: None,
                ..Default::default()
            },
        );
        coordinator.play_audio(article(1)).await.unwrap();
        settle().await;

        assert!(coordinator.seek_to(50.0).is_ok());
        assert!(backend.position(|c| matches!(c.op, Op::Seek(_))).is_none());
        assert_eq!(coordinator.state().position, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_releases_the_progress_timer() {
        let (backend, coordinator) = setup();
        let mut notes = coordinator.notifications();
        coordinator.play_audio(article(1)).await.unwrap();
        let instance = backend.playing_instance(&url(1)).unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(instance.time_reads() > 3);

        coordinator.stop_audio();
        let at_stop = instance.time_reads();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(instance.time_reads(), at_stop);

        assert_eq!(coordinator.state().status, PlaybackStatus::Idle);
        assert!(instance.is_released());
        let _now_playing = notes.recv().await.unwrap();
        assert_eq!(
            notes.recv().await.unwrap(),
            PlaybackNotification::AudioEnded {
                article_id: "art-1".into()
            }
        );
    }

    /// Let the ticker run, then check that it stays quiet once `end` has run
    async fn assert_sampling_stops(instance: &StubResource, end: impl FnOnce()) {
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(instance.time_reads() > 3);

        end();
        settle().await;
        let after = instance.time_reads();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(instance.time_reads(), after);
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_releases_the_old_progress_timer() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        let first = backend.playing_instance(&url(1)).unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(first.time_reads() > 3);

        coordinator.play_audio(article(2)).await.unwrap();
        let at_takeover = first.time_reads();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(first.time_reads(), at_takeover);
        let second = backend.playing_instance(&url(2)).unwrap();
        assert!(second.time_reads() > 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_releases_the_progress_timer() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        let instance = backend.playing_instance(&url(1)).unwrap();

        assert_sampling_stops(&instance, || instance.fail(MediaErrorKind::Network)).await;
        assert_eq!(coordinator.state().status, PlaybackStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_releases_the_progress_timer() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        let instance = backend.playing_instance(&url(1)).unwrap();

        assert_sampling_stops(&instance, || instance.finish()).await;
        assert_eq!(coordinator.state().status, PlaybackStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_seek_does_not_block_other_commands() {
        let (backend, coordinator) = setup();
        let gate = Arc::new(std::sync::Barrier::new(2));
        backend.set_behavior(
            &url(1),
            Behavior {
                seek_gate: Some(gate.clone()),
                ..Default::default()
            },
        );
        coordinator.play_audio(article(1)).await.unwrap();

        let seeking = coordinator.clone();
        let seeker = std::thread::spawn(move || seeking.seek_to(50.0));
        // The seek is now parked inside the resource
        gate.wait();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let commands = coordinator.clone();
        let other = std::thread::spawn(move || {
            commands.set_volume(0.3);
            let _ = commands.pause_audio();
            let _ = done_tx.send(());
        });
        let finished = done_rx.recv_timeout(Duration::from_secs(2)).is_ok();

        gate.wait();
        seeker.join().unwrap().unwrap();
        other.join().unwrap();

        assert!(finished);
        let state = coordinator.state();
        assert_eq!(state.status, PlaybackStatus::Paused);
        assert_eq!(state.volume, 0.3);
        assert_eq!(state.position, Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn pausing_stops_sampling() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        let instance = backend.playing_instance(&url(1)).unwrap();

        coordinator.pause_audio().unwrap();
        let at_pause = instance.time_reads();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(instance.time_reads(), at_pause);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_continues_from_paused_position() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        let instance = backend.playing_instance(&url(1)).unwrap();
        instance.advance(Duration::from_secs(30));

        coordinator.pause_audio().unwrap();
        let state = coordinator.state();
        assert_eq!(state.status, PlaybackStatus::Paused);
        assert_eq!(state.position, Duration::from_secs(30));
        assert!(instance.is_paused());

        coordinator.play_audio(article(1)).await.unwrap();
        assert!(coordinator.state().is_playing());
        assert!(!instance.is_paused());
        assert_eq!(instance.current_time(), Duration::from_secs(30));
        assert!(backend.position(|c| matches!(c.op, Op::Seek(_))).is_none());
        assert_eq!(backend.loads_for(&url(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_play_while_playing_is_a_noop() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        coordinator.play_audio(article(1)).await.unwrap();

        let plays = backend
            .calls()
            .iter()
            .filter(|c| c.op == Op::Play)
            .count();
        assert_eq!(plays, 1);
        assert!(coordinator.state().is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn load_failure_surfaces_error_and_can_retry() {
        let (backend, coordinator) = setup();
        let mut notes = coordinator.notifications();
        backend.set_behavior(
            &url(1),
            Behavior {
                load_error: Some(MediaErrorKind::Network),
                ..Default::default()
            },
        );

        let result = coordinator.play_audio(article(1)).await;
        assert_eq!(result, Err(PlaybackError::Media(MediaErrorKind::Network)));

        let state = coordinator.state();
        assert_eq!(state.status, PlaybackStatus::Error);
        assert!(state.active_article_id.is_none());
        assert_eq!(state.notice(), Some("Network error while loading audio"));
        assert_eq!(
            notes.recv().await.unwrap(),
            PlaybackNotification::Failed {
                article_id: Some("art-1".into()),
                error: PlaybackError::Media(MediaErrorKind::Network),
            }
        );

        backend.set_behavior(&url(1), Behavior::default());
        coordinator.play_audio(article(1)).await.unwrap();
        assert!(coordinator.state().is_playing());
        assert!(coordinator.state().error.is_none());
        assert_eq!(backend.loads_for(&url(1)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_source_is_classified() {
        let (backend, coordinator) = setup();
        backend.set_behavior(
            &url(1),
            Behavior {
                play_error: Some(MediaErrorKind::SrcNotSupported),
                ..Default::default()
            },
        );

        let result = coordinator.play_audio(article(1)).await;
        assert_eq!(
            result,
            Err(PlaybackError::Media(MediaErrorKind::SrcNotSupported))
        );
        assert_eq!(coordinator.state().notice(), Some("Audio format not supported"));
        assert!(backend.instances().iter().all(|r| r.is_paused()));
    }

    #[tokio::test(start_paused = true)]
    async fn mid_playback_error_resets_session() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        let instance = backend.playing_instance(&url(1)).unwrap();

        instance.fail(MediaErrorKind::Decode);
        settle().await;

        let state = coordinator.state();
        assert_eq!(state.status, PlaybackStatus::Error);
        assert!(state.active_article_id.is_none());
        assert_eq!(state.error, Some(PlaybackError::Media(MediaErrorKind::Decode)));
        assert!(instance.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_url_is_rejected_without_loading() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();

        let result = coordinator.play_audio(ArticleAudio::new("art-x", "")).await;
        assert!(matches!(result, Err(PlaybackError::InvalidUrl(_))));
        assert_eq!(backend.loads(), 1);

        let state = coordinator.state();
        assert!(state.is_playing());
        assert!(state.is_active("art-1"));
        assert_eq!(state.notice(), Some("Audio not available"));

        coordinator.dismiss_error();
        assert!(coordinator.state().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn platform_pause_is_reflected_and_resumable() {
        let (backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        let instance = backend.playing_instance(&url(1)).unwrap();

        instance.external_pause();
        settle().await;
        assert_eq!(coordinator.state().status, PlaybackStatus::Paused);

        coordinator.play_audio(article(1)).await.unwrap();
        assert!(coordinator.state().is_playing());
        assert!(!instance.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn volume_is_clamped_and_carried_into_sessions() {
        let (backend, coordinator) = setup();
        coordinator.set_volume(1.5);
        assert_eq!(coordinator.state().volume, 1.0);

        coordinator.set_volume(0.25);
        coordinator.play_audio(article(1)).await.unwrap();
        let instance = backend.playing_instance(&url(1)).unwrap();
        assert_eq!(instance.volume(), 0.25);

        coordinator.set_volume(-3.0);
        assert_eq!(instance.volume(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn minimized_flag_does_not_touch_playback() {
        let (_backend, coordinator) = setup();
        coordinator.play_audio(article(1)).await.unwrap();
        let mut rx = coordinator.subscribe();
        rx.borrow_and_update();

        coordinator.set_minimized(true);
        assert!(rx.has_changed().unwrap());
        let state = rx.borrow_and_update().clone();
        assert!(state.is_minimized);
        assert!(state.is_playing());

        coordinator.set_minimized(true);
        assert!(!rx.has_changed().unwrap());
    }
}
