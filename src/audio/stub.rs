//! In-memory backend for tests
//!
//! Every instance created by a `StubBackend` (including forks) appends to one
//! shared call log, so tests can assert cross-resource ordering such as
//! "the old session was paused before the new one started loading".

use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::analyzer::AnalysisTap;
use super::resource::{
    AudioBackend, AudioResource, LoadState, ResourceEvent, ResourceEventReceiver,
    ResourceEventSender, resource_event_channel,
};
use crate::error::MediaErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create,
    Fork,
    Load,
    Play,
    Pause,
    Seek(Duration),
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub instance: u64,
    pub url: String,
    pub op: Op,
}

/// How a URL behaves when loaded and played
#[derive(Debug, Clone)]
pub struct Behavior {
    pub load_delay: Duration,
    pub load_error: Option<MediaErrorKind>,
    pub play_error: Option<MediaErrorKind>,
    /// Stay in `Loading` forever
    pub stall: bool,
    pub duration: Option<Duration>,
    /// Expose an analysis tap on every instance
    pub analysis: bool,
    /// Non-zero seeks meet this barrier twice: once on arrival, once to leave
    pub seek_gate: Option<Arc<Barrier>>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            load_delay: Duration::from_millis(10),
            load_error: None,
            play_error: None,
            stall: false,
            duration: Some(Duration::from_secs(200)),
            analysis: false,
            seek_gate: None,
        }
    }
}

#[derive(Default)]
pub struct StubLog {
    calls: Mutex<Vec<Call>>,
    loads: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_instance: AtomicU64,
}

impl StubLog {
    fn record(&self, instance: u64, url: &str, op: Op) {
        self.calls.lock().push(Call {
            instance,
            url: url.to_string(),
            op,
        });
    }

    fn load_started(&self) {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn load_settled(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct StubBackend {
    log: Arc<StubLog>,
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    instances: Arc<Mutex<Vec<Arc<StubResource>>>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, url: &str, behavior: Behavior) {
        self.behaviors.lock().insert(url.to_string(), behavior);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.calls.lock().clone()
    }

    /// Position of the first call matching `pred`
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.log.calls.lock().iter().position(pred)
    }

    /// Number of network loads actually started
    pub fn loads(&self) -> usize {
        self.log.loads.load(Ordering::SeqCst)
    }

    pub fn loads_for(&self, url: &str) -> usize {
        self.log
            .calls
            .lock()
            .iter()
            .filter(|c| c.url == url && c.op == Op::Load)
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.log.max_in_flight.load(Ordering::SeqCst)
    }

    /// URLs in the order their loads started
    pub fn loaded_urls(&self) -> Vec<String> {
        self.log
            .calls
            .lock()
            .iter()
            .filter(|c| c.op == Op::Load)
            .map(|c| c.url.clone())
            .collect()
    }

    pub fn instances(&self) -> Vec<Arc<StubResource>> {
        self.instances.lock().clone()
    }

    /// Most recently created instance (warm or fork) for `url` that was played
    pub fn playing_instance(&self, url: &str) -> Option<Arc<StubResource>> {
        self.instances
            .lock()
            .iter()
            .rev()
            .find(|r| r.download.url == url && r.was_played())
            .cloned()
    }

    fn register(&self, resource: Arc<StubResource>) -> Arc<StubResource> {
        self.instances.lock().push(resource.clone());
        resource
    }
}

impl AudioBackend for StubBackend {
    fn create(&self, url: &str) -> Arc<dyn AudioResource> {
        let behavior = self.behaviors.lock().get(url).cloned().unwrap_or_default();
        let download = Arc::new(StubDownload {
            url: url.to_string(),
            behavior,
            state: Mutex::new(LoadState::Unloaded),
            listeners: Mutex::new(Vec::new()),
        });
        let resource = StubResource::new(download, self.clone(), Op::Create);
        self.register(resource)
    }
}

struct StubDownload {
    url: String,
    behavior: Behavior,
    state: Mutex<LoadState>,
    listeners: Mutex<Vec<ResourceEventSender>>,
}

impl StubDownload {
    fn notify(&self, event: ResourceEvent) {
        for tx in self.listeners.lock().iter() {
            let _ = tx.send(event.clone());
        }
    }
}

struct StubPlayback {
    paused: bool,
    played: bool,
    released: bool,
    position: Duration,
    volume: f32,
}

pub struct StubResource {
    instance: u64,
    download: Arc<StubDownload>,
    backend: StubBackend,
    events: ResourceEventSender,
    playback: Mutex<StubPlayback>,
    time_reads: AtomicUsize,
    tap: Option<AnalysisTap>,
}

impl StubResource {
    fn new(download: Arc<StubDownload>, backend: StubBackend, op: Op) -> Arc<Self> {
        let instance = backend.log.next_instance.fetch_add(1, Ordering::SeqCst);
        let events = resource_event_channel();
        download.listeners.lock().push(events.clone());
        backend.log.record(instance, &download.url, op);
        let tap = download.behavior.analysis.then(AnalysisTap::new);
        Arc::new(Self {
            instance,
            download,
            backend,
            events,
            playback: Mutex::new(StubPlayback {
                paused: true,
                played: false,
                released: false,
                position: Duration::ZERO,
                volume: 1.0,
            }),
            time_reads: AtomicUsize::new(0),
            tap,
        })
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn was_played(&self) -> bool {
        self.playback.lock().played
    }

    pub fn is_released(&self) -> bool {
        self.playback.lock().released
    }

    /// How many times `current_time` has been sampled
    pub fn time_reads(&self) -> usize {
        self.time_reads.load(Ordering::SeqCst)
    }

    /// Move the playhead forward as if audio had been rendered
    pub fn advance(&self, by: Duration) {
        let mut playback = self.playback.lock();
        playback.position += by;
    }

    /// Signal natural end of stream
    pub fn finish(&self) {
        self.playback.lock().paused = true;
        let _ = self.events.send(ResourceEvent::Ended);
    }

    /// Signal a mid-playback failure
    pub fn fail(&self, kind: MediaErrorKind) {
        let _ = self.events.send(ResourceEvent::Error(kind));
    }

    /// Signal a pause that did not come from the coordinator
    pub fn external_pause(&self) {
        self.playback.lock().paused = true;
        let _ = self.events.send(ResourceEvent::Pause);
    }

    fn record(&self, op: Op) {
        self.backend.log.record(self.instance, &self.download.url, op);
    }

    async fn wait_loaded(&self) -> Result<(), MediaErrorKind> {
        loop {
            match *self.download.state.lock() {
                LoadState::Ready => return Ok(()),
                LoadState::Error => {
                    return Err(self.download.behavior.load_error.unwrap_or(MediaErrorKind::Unknown));
                }
                LoadState::Loading | LoadState::Unloaded => {}
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl AudioResource for StubResource {
    fn url(&self) -> &str {
        &self.download.url
    }

    fn load_state(&self) -> LoadState {
        *self.download.state.lock()
    }

    fn load(&self) {
        {
            let mut state = self.download.state.lock();
            if *state != LoadState::Unloaded {
                return;
            }
            *state = LoadState::Loading;
        }
        self.record(Op::Load);
        self.backend.log.load_started();
        self.download.notify(ResourceEvent::LoadStart);

        let download = self.download.clone();
        let log = self.backend.log.clone();
        tokio::spawn(async move {
            if download.behavior.stall {
                return;
            }
            tokio::time::sleep(download.behavior.load_delay).await;
            match download.behavior.load_error {
                Some(kind) => {
                    *download.state.lock() = LoadState::Error;
                    download.notify(ResourceEvent::Error(kind));
                }
                None => {
                    *download.state.lock() = LoadState::Ready;
                    download.notify(ResourceEvent::CanPlayThrough);
                }
            }
            log.load_settled();
        });
    }

    async fn play(&self) -> Result<(), MediaErrorKind> {
        self.record(Op::Play);
        if self.playback.lock().released {
            return Err(MediaErrorKind::Aborted);
        }
        self.load();
        self.wait_loaded().await?;

        if let Some(kind) = self.download.behavior.play_error {
            return Err(kind);
        }

        {
            let mut playback = self.playback.lock();
            playback.paused = false;
            playback.played = true;
        }
        if let Some(duration) = self.download.behavior.duration {
            let _ = self.events.send(ResourceEvent::LoadedMetadata { duration });
        }
        let _ = self.events.send(ResourceEvent::Play);
        Ok(())
    }

    fn pause(&self) {
        self.record(Op::Pause);
        self.playback.lock().paused = true;
    }

    fn is_paused(&self) -> bool {
        self.playback.lock().paused
    }

    fn current_time(&self) -> Duration {
        self.time_reads.fetch_add(1, Ordering::SeqCst);
        self.playback.lock().position
    }

    fn set_current_time(&self, position: Duration) {
        self.record(Op::Seek(position));
        if let Some(gate) = self.download.behavior.seek_gate.as_ref() {
            if !position.is_zero() {
                gate.wait();
                gate.wait();
            }
        }
        self.playback.lock().position = position;
    }

    fn duration(&self) -> Option<Duration> {
        if self.playback.lock().played {
            self.download.behavior.duration
        } else {
            None
        }
    }

    fn volume(&self) -> f32 {
        self.playback.lock().volume
    }

    fn set_volume(&self, volume: f32) {
        self.playback.lock().volume = volume;
    }

    fn subscribe(&self) -> ResourceEventReceiver {
        self.events.subscribe()
    }

    fn release(&self) {
        self.record(Op::Release);
        let mut playback = self.playback.lock();
        playback.released = true;
        playback.paused = true;
    }

    fn fork(&self) -> Arc<dyn AudioResource> {
        let fork = StubResource::new(self.download.clone(), self.backend.clone(), Op::Fork);
        self.backend.register(fork)
    }

    fn analysis(&self) -> Option<AnalysisTap> {
        self.tap.clone()
    }
}
