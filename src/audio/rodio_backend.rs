//! Production audio backend on rodio and reqwest
//!
//! ```text
//! RodioBackend ──create(url)──> RodioResource ──fork()──> RodioResource ...
//!                                     │                         │
//!                                     └──── Arc<Download> ──────┘   one fetch, one SharedBuffer
//!                                                 │
//!                                  reqwest / file ──> SharedBuffer
//!
//! play(): SharedBuffer ──StreamingBuffer──> Decoder ──AnalyzingSource──> Sink ──> Mixer
//! ```
//!
//! The `OutputStream` lives on a dedicated `audio-output` thread; resources
//! only see its `Mixer`. Each playing instance owns one `Sink`. The download
//! is cancelled when the last resource sharing it is dropped.

use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rodio::decoder::DecoderError;
use rodio::mixer::Mixer;
use rodio::{Decoder, OutputStreamBuilder, Sink, Source};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::analyzer::{AnalysisTap, AnalyzingSource};
use super::resource::{
    AudioBackend, AudioResource, LoadState, ResourceEvent, ResourceEventReceiver,
    ResourceEventSender, resource_event_channel,
};
use super::streaming::{
    SharedBuffer, StreamingBuffer, StreamingEvent, extension_from_content_type,
    extension_from_url, fetch,
};
use crate::error::{MediaErrorKind, PlaybackError};
use crate::settings::Settings;

/// Map a rodio decoder failure onto the media error classification
pub fn classify_decoder_error(error: &DecoderError, download_complete: bool) -> MediaErrorKind {
    match error {
        DecoderError::UnrecognizedFormat => MediaErrorKind::SrcNotSupported,
        // Running out of bytes on a finished download means the data is bad
        DecoderError::IoError(_) if download_complete => MediaErrorKind::Decode,
        DecoderError::IoError(_) => MediaErrorKind::Network,
        _ => MediaErrorKind::Decode,
    }
}

/// Owns the output stream. Dropping it closes the device.
struct OutputThread {
    _shutdown: mpsc::Sender<()>,
}

impl OutputThread {
    fn open() -> Result<(Self, Mixer), PlaybackError> {
        let (mixer_tx, mixer_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match OutputStreamBuilder::open_default_stream() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = mixer_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = mixer_tx.send(Ok(stream.mixer().clone()));
                info!("Audio output opened");

                // Returns once the backend drops its sender
                let _ = shutdown_rx.recv();
                drop(stream);
                info!("Audio output closed");
            })
            .map_err(|e| PlaybackError::Unavailable(format!("failed to spawn audio thread: {}", e)))?;

        let mixer = mixer_rx
            .recv()
            .map_err(|_| PlaybackError::Unavailable("audio thread exited".to_string()))?
            .map_err(PlaybackError::Unavailable)?;

        Ok((
            Self {
                _shutdown: shutdown_tx,
            },
            mixer,
        ))
    }
}

pub struct RodioBackend {
    mixer: Mixer,
    client: reqwest::Client,
    runtime: Handle,
    _output: Option<OutputThread>,
}

impl RodioBackend {
    /// Open the default output device. Must be called inside a tokio runtime.
    pub fn open(settings: &Settings) -> Result<Self, PlaybackError> {
        let runtime = Handle::try_current()
            .map_err(|_| PlaybackError::Unavailable("no async runtime".to_string()))?;
        let client = reqwest::Client::builder()
            .user_agent(settings.network.user_agent.as_str())
            .connect_timeout(Duration::from_secs(settings.network.connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.network.read_timeout_secs))
            .build()
            .map_err(|e| PlaybackError::Unavailable(e.to_string()))?;
        let (output, mixer) = OutputThread::open()?;

        Ok(Self {
            mixer,
            client,
            runtime,
            _output: Some(output),
        })
    }

    #[cfg(test)]
    fn detached(mixer: Mixer) -> Self {
        Self {
            mixer,
            client: reqwest::Client::new(),
            runtime: Handle::current(),
            _output: None,
        }
    }
}

impl AudioBackend for RodioBackend {
    fn create(&self, url: &str) -> Arc<dyn AudioResource> {
        let download = Download::new(url, self.client.clone(), self.runtime.clone());
        Arc::new(RodioResource::new(download, self.mixer.clone()))
    }
}

/// Fetch state shared by a resource and all its forks
struct Download {
    url: String,
    buffer: SharedBuffer,
    client: reqwest::Client,
    runtime: Handle,
    state: watch::Sender<LoadState>,
    failure: Mutex<Option<MediaErrorKind>>,
    /// Container hint for the decoder
    hint: Mutex<Option<String>>,
    /// Event channels of the live resources sharing this download
    listeners: Mutex<Vec<Weak<ResourceEventSender>>>,
}

impl Download {
    fn new(url: &str, client: reqwest::Client, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            buffer: SharedBuffer::new(),
            client,
            runtime,
            state: watch::Sender::new(LoadState::Unloaded),
            failure: Mutex::new(None),
            hint: Mutex::new(extension_from_url(url)),
            listeners: Mutex::new(Vec::new()),
        })
    }

    fn listen(&self, events: &Arc<ResourceEventSender>) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| tx.strong_count() > 0);
        listeners.push(Arc::downgrade(events));
    }

    fn start(self: &Arc<Self>) {
        let started = self.state.send_if_modified(|state| {
            let unloaded = *state == LoadState::Unloaded;
            if unloaded {
                *state = LoadState::Loading;
            }
            unloaded
        });
        if !started {
            return;
        }
        debug!("Loading {}", self.url);
        self.notify(ResourceEvent::LoadStart);

        let download: Weak<Self> = Arc::downgrade(self);
        let buffer = self.buffer.clone();
        let client = self.client.clone();
        let url = self.url.clone();
        self.runtime.spawn(async move {
            fetch(&client, &url, &buffer, |event| {
                if let Some(download) = download.upgrade() {
                    download.on_streaming(event);
                }
            })
            .await;
        });
    }

    fn on_streaming(&self, event: StreamingEvent) {
        match event {
            StreamingEvent::Started { content_type, .. } => {
                let mut hint = self.hint.lock();
                if hint.is_none() {
                    *hint = content_type.as_deref().and_then(extension_from_content_type);
                }
            }
            StreamingEvent::Playable => {
                self.state.send_replace(LoadState::Ready);
                self.notify(ResourceEvent::CanPlayThrough);
            }
            StreamingEvent::Failed(kind) => {
                *self.failure.lock() = Some(kind);
                self.state.send_replace(LoadState::Error);
                self.notify(ResourceEvent::Error(kind));
            }
            StreamingEvent::Progress { .. } | StreamingEvent::Complete => {}
        }
    }

    async fn ready(&self) -> Result<(), MediaErrorKind> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| matches!(s, LoadState::Ready | LoadState::Error))
            .await
            .map_err(|_| MediaErrorKind::Aborted)?;
        match state {
            LoadState::Ready => Ok(()),
            _ => Err(self.failure.lock().unwrap_or(MediaErrorKind::Unknown)),
        }
    }

    /// Send `event` to every live resource, dropping dead ones
    fn notify(&self, event: ResourceEvent) {
        self.listeners.lock().retain(|tx| match tx.upgrade() {
            Some(tx) => {
                let _ = tx.send(event.clone());
                true
            }
            None => false,
        });
    }
}

impl Drop for Download {
    fn drop(&mut self) {
        self.buffer.cancel();
    }
}

struct Output {
    sink: Option<Arc<Sink>>,
    volume: f32,
    duration: Option<Duration>,
    /// Seek requested before a sink existed, or not yet applied by the seeker
    pending_seek: Option<Duration>,
    released: bool,
    /// Bumped whenever the sink is replaced, so stale end watchers stay quiet
    generation: u64,
}

pub struct RodioResource {
    download: Arc<Download>,
    mixer: Mixer,
    events: Arc<ResourceEventSender>,
    tap: AnalysisTap,
    output: Arc<Mutex<Output>>,
}

impl RodioResource {
    fn new(download: Arc<Download>, mixer: Mixer) -> Self {
        let events = Arc::new(resource_event_channel());
        download.listen(&events);
        Self {
            download,
            mixer,
            events,
            tap: AnalysisTap::new(),
            output: Arc::new(Mutex::new(Output {
                sink: None,
                volume: 1.0,
                duration: None,
                pending_seek: None,
                released: false,
                generation: 0,
            })),
        }
    }

    fn sink(&self) -> Option<Arc<Sink>> {
        self.output.lock().sink.clone()
    }

    async fn decode(&self) -> Result<Decoder<StreamingBuffer>, MediaErrorKind> {
        let reader = StreamingBuffer::new(self.download.buffer.clone());
        let hint = self.download.hint.lock().clone();
        let byte_len = self.download.buffer.total();

        // Probing reads from the buffer and may block on the download
        let decoded = tokio::task::spawn_blocking(move || {
            let mut builder = Decoder::builder().with_data(reader).with_seekable(true);
            if let Some(hint) = hint {
                builder = builder.with_hint(hint.as_str());
            }
            if let Some(len) = byte_len {
                builder = builder.with_byte_len(len);
            }
            builder.build()
        })
        .await
        .map_err(|_| MediaErrorKind::Aborted)?;

        decoded.map_err(|e| {
            warn!("Could not decode {}: {}", self.download.url, e);
            let buffer = &self.download.buffer;
            buffer
                .failure()
                .unwrap_or_else(|| classify_decoder_error(&e, buffer.is_complete()))
        })
    }

    /// Apply pending seeks to `sink` off the caller's thread.
    ///
    /// `try_seek` waits for the mixer, and the decoder blocks until the bytes
    /// at the target have been downloaded.
    fn seek_in_background(&self, sink: Arc<Sink>, generation: u64) {
        let output = self.output.clone();
        self.download.runtime.spawn_blocking(move || {
            loop {
                let target = {
                    let output = output.lock();
                    if output.released || output.generation != generation {
                        return;
                    }
                    match output.pending_seek {
                        Some(target) => target,
                        None => return,
                    }
                };
                if let Err(e) = sink.try_seek(target) {
                    warn!("Seek to {:?} failed: {}", target, e);
                }
                let mut output = output.lock();
                if output.pending_seek == Some(target) {
                    output.pending_seek = None;
                    return;
                }
            }
        });
    }

    /// Report natural end of stream for `sink` unless it was replaced or released
    fn watch_end(&self, sink: Arc<Sink>, generation: u64) {
        let output = self.output.clone();
        let events = self.events.clone();
        let url = self.download.url.clone();
        self.download.runtime.spawn_blocking(move || {
            sink.sleep_until_end();
            let finished = {
                let mut output = output.lock();
                let current = !output.released && output.generation == generation;
                if current {
                    output.sink = None;
                }
                current
            };
            if finished {
                debug!("Reached end of {}", url);
                let _ = events.send(ResourceEvent::Ended);
            }
        });
    }
}

#[async_trait]
impl AudioResource for RodioResource {
    fn url(&self) -> &str {
        &self.download.url
    }

    fn load_state(&self) -> LoadState {
        *self.download.state.borrow()
    }

    fn load(&self) {
        self.download.start();
    }

    async fn play(&self) -> Result<(), MediaErrorKind> {
        {
            let output = self.output.lock();
            if output.released {
                return Err(MediaErrorKind::Aborted);
            }
            if let Some(sink) = &output.sink {
                sink.play();
                drop(output);
                let _ = self.events.send(ResourceEvent::Play);
                return Ok(());
            }
        }

        self.load();
        self.download.ready().await?;
        let decoder = self.decode().await?;
        let duration = decoder.total_duration();

        let sink = Arc::new(Sink::connect_new(&self.mixer));
        sink.pause();
        sink.append(AnalyzingSource::new(decoder, self.tap.clone()));

        let generation = {
            let mut output = self.output.lock();
            if output.released || output.sink.is_some() {
                sink.stop();
                return if output.released {
                    Err(MediaErrorKind::Aborted)
                } else {
                    Ok(())
                };
            }
            sink.set_volume(output.volume);
            if let Some(position) = output.pending_seek.take() {
                if let Err(e) = sink.try_seek(position) {
                    warn!("Initial seek to {:?} failed: {}", position, e);
                }
            }
            sink.play();
            output.duration = duration;
            output.generation += 1;
            output.sink = Some(sink.clone());
            output.generation
        };
        self.watch_end(sink, generation);

        if let Some(duration) = duration {
            let _ = self.events.send(ResourceEvent::LoadedMetadata { duration });
        }
        let _ = self.events.send(ResourceEvent::Play);
        info!("Output started for {}", self.download.url);
        Ok(())
    }

    fn pause(&self) {
        if let Some(sink) = self.sink() {
            if !sink.is_paused() {
                sink.pause();
                let _ = self.events.send(ResourceEvent::Pause);
            }
        }
    }

    fn is_paused(&self) -> bool {
        self.sink().is_none_or(|sink| sink.is_paused())
    }

    fn current_time(&self) -> Duration {
        let output = self.output.lock();
        match (&output.sink, output.pending_seek) {
            (_, Some(position)) => position,
            (Some(sink), None) => sink.get_pos(),
            (None, None) => Duration::ZERO,
        }
    }

    fn set_current_time(&self, position: Duration) {
        let mut output = self.output.lock();
        let sink = match output.sink.clone() {
            Some(sink) if !sink.empty() => sink,
            _ => {
                output.pending_seek = Some(position);
                return;
            }
        };
        // A seeker already running picks up the newest target
        if output.pending_seek.replace(position).is_some() {
            return;
        }
        let generation = output.generation;
        drop(output);
        self.seek_in_background(sink, generation);
    }

    fn duration(&self) -> Option<Duration> {
        self.output.lock().duration
    }

    fn volume(&self) -> f32 {
        self.output.lock().volume
    }

    fn set_volume(&self, volume: f32) {
        let mut output = self.output.lock();
        output.volume = volume;
        if let Some(sink) = &output.sink {
            sink.set_volume(volume);
        }
    }

    fn subscribe(&self) -> ResourceEventReceiver {
        self.events.subscribe()
    }

    fn release(&self) {
        let sink = {
            let mut output = self.output.lock();
            output.released = true;
            output.generation += 1;
            output.pending_seek = None;
            output.sink.take()
        };
        if let Some(sink) = sink {
            sink.stop();
        }
        self.tap.reset();
    }

    fn fork(&self) -> Arc<dyn AudioResource> {
        Arc::new(RodioResource::new(self.download.clone(), self.mixer.clone()))
    }

    fn analysis(&self) -> Option<AnalysisTap> {
        Some(self.tap.clone())
    }
}

impl Drop for RodioResource {
    fn drop(&mut self) {
        if let Some(sink) = self.output.lock().sink.take() {
            sink.stop();
        }
    }
}
