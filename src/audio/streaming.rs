//! In-memory streaming buffer fed by a download
//!
//! ```text
//! fetch task --append()--> SharedBuffer <--read_at()-- StreamingBuffer <-- rodio Decoder
//! ```
//!
//! The decoder runs on a blocking thread and may read ahead of the download;
//! reads park on a condvar until bytes arrive, the download completes, fails
//! or is cancelled. Every instance forked from one resource shares the buffer,
//! so an article is fetched once no matter how many times it is played.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::MediaErrorKind;

/// Bytes buffered before a download counts as able to play through
pub const HIGH_WATER_MARK_BYTES: u64 = 400 * 1024;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "aac", "ogg", "opus", "wav"];

/// Decoder hint from the URL path, e.g. `.../a12.mp3?sig=...` -> `mp3`
pub fn extension_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let filename = parsed.path_segments()?.next_back()?;
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    AUDIO_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Decoder hint from a `Content-Type` header
pub fn extension_from_content_type(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match mime.as_str() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/flac" | "audio/x-flac" => "flac",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "audio/aac" => "m4a",
        "audio/ogg" | "audio/vorbis" | "application/ogg" => "ogg",
        "audio/opus" => "opus",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        _ => return None,
    };
    Some(ext.to_string())
}

/// Content types that are certainly not audio (error pages, API responses)
pub fn is_non_audio_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime.starts_with("text/")
        || matches!(
            mime.as_str(),
            "application/json" | "application/xml" | "application/xhtml+xml"
        )
}

/// Progress reported by [`fetch`]
#[derive(Debug, Clone, PartialEq)]
pub enum StreamingEvent {
    /// Response accepted
    Started {
        content_type: Option<String>,
        total: Option<u64>,
    },
    /// Enough is buffered to start playback
    Playable,
    Progress { downloaded: u64, total: Option<u64> },
    Complete,
    Failed(MediaErrorKind),
}

#[derive(Default)]
struct BufferState {
    data: Vec<u8>,
    total: Option<u64>,
    complete: bool,
    cancelled: bool,
    failure: Option<MediaErrorKind>,
}

struct BufferInner {
    state: Mutex<BufferState>,
    changed: Condvar,
}

/// Byte buffer shared between the download task and decoders
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<BufferInner>,
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SharedBuffer")
            .field("downloaded", &state.data.len())
            .field("total", &state.total)
            .field("complete", &state.complete)
            .field("failure", &state.failure)
            .finish()
    }
}

impl Default for SharedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BufferInner {
                state: Mutex::new(BufferState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut BufferState) -> R) -> R {
        let result = f(&mut self.inner.state.lock());
        self.inner.changed.notify_all();
        result
    }

    pub fn append(&self, chunk: &[u8]) {
        if !chunk.is_empty() {
            self.update(|state| state.data.extend_from_slice(chunk));
        }
    }

    pub fn set_total(&self, total: u64) {
        self.inner.state.lock().total = Some(total);
    }

    pub fn mark_complete(&self) {
        self.update(|state| state.complete = true);
    }

    pub fn fail(&self, kind: MediaErrorKind) {
        self.update(|state| state.failure = Some(kind));
    }

    /// Wake blocked readers with an error and stop the download
    pub fn cancel(&self) {
        self.update(|state| state.cancelled = true);
    }

    pub fn downloaded(&self) -> u64 {
        self.inner.state.lock().data.len() as u64
    }

    /// Content length if the server sent one
    pub fn total(&self) -> Option<u64> {
        self.inner.state.lock().total
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().complete
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    pub fn failure(&self) -> Option<MediaErrorKind> {
        self.inner.state.lock().failure
    }

    /// Read at `position`, blocking until bytes are available.
    ///
    /// Returns `Ok(0)` only at the end of a completed download.
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.inner.state.lock();
        loop {
            if state.cancelled {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "download cancelled"));
            }
            if let Some(kind) = state.failure {
                return Err(io::Error::other(kind));
            }

            let len = state.data.len() as u64;
            if position < len {
                let start = position as usize;
                let n = buf.len().min(state.data.len() - start);
                buf[..n].copy_from_slice(&state.data[start..start + n]);
                return Ok(n);
            }
            if state.complete {
                return Ok(0);
            }

            self.inner.changed.wait(&mut state);
        }
    }

    /// Size to seek from the end against: actual size once complete, else content length
    fn end(&self) -> Option<u64> {
        let state = self.inner.state.lock();
        if state.complete {
            Some(state.data.len() as u64)
        } else {
            state.total
        }
    }
}

/// `Read + Seek` cursor over a [`SharedBuffer`] for the decoder
pub struct StreamingBuffer {
    shared: SharedBuffer,
    position: u64,
}

impl StreamingBuffer {
    pub fn new(shared: SharedBuffer) -> Self {
        Self {
            shared,
            position: 0,
        }
    }
}

impl Read for StreamingBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.shared.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for StreamingBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
            SeekFrom::End(offset) => {
                let end = self.shared.end().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "stream length unknown")
                })?;
                end.checked_add_signed(offset)
            }
        };
        // Positions past the downloaded range are fine; reads block until they arrive.
        self.position = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        Ok(self.position)
    }
}

/// Fetch `url` (http, https or file) into `buffer`, reporting progress to `on_event`.
///
/// Returns when the download completes, fails or the buffer is cancelled.
pub async fn fetch<F>(client: &reqwest::Client, url: &str, buffer: &SharedBuffer, mut on_event: F)
where
    F: FnMut(StreamingEvent) + Send,
{
    let result = match reqwest::Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => read_file(&parsed, buffer, &mut on_event).await,
        Ok(_) => download(client, url, buffer, &mut on_event).await,
        Err(_) => Err(MediaErrorKind::SrcNotSupported),
    };

    match result {
        Ok(()) if buffer.is_cancelled() => debug!("Fetch of {} cancelled", url),
        Ok(()) => {
            buffer.mark_complete();
            on_event(StreamingEvent::Complete);
            debug!("Fetched {} ({} bytes)", url, buffer.downloaded());
        }
        Err(kind) => {
            warn!("Fetch of {} failed: {}", url, kind);
            buffer.fail(kind);
            on_event(StreamingEvent::Failed(kind));
        }
    }
}

async fn read_file<F>(
    url: &reqwest::Url,
    buffer: &SharedBuffer,
    on_event: &mut F,
) -> Result<(), MediaErrorKind>
where
    F: FnMut(StreamingEvent) + Send,
{
    let path = url.to_file_path().map_err(|_| MediaErrorKind::SrcNotSupported)?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        debug!("Could not read {:?}: {}", path, e);
        MediaErrorKind::Network
    })?;

    let total = bytes.len() as u64;
    buffer.set_total(total);
    on_event(StreamingEvent::Started {
        content_type: None,
        total: Some(total),
    });
    buffer.append(&bytes);
    on_event(StreamingEvent::Playable);
    Ok(())
}

async fn download<F>(
    client: &reqwest::Client,
    url: &str,
    buffer: &SharedBuffer,
    on_event: &mut F,
) -> Result<(), MediaErrorKind>
where
    F: FnMut(StreamingEvent) + Send,
{
    let response = client.get(url).send().await.map_err(|e| {
        debug!("Request for {} failed: {}", url, e);
        MediaErrorKind::Network
    })?;
    if !response.status().is_success() {
        debug!("{} answered HTTP {}", url, response.status());
        return Err(MediaErrorKind::Network);
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if content_type.as_deref().is_some_and(is_non_audio_content_type) {
        return Err(MediaErrorKind::SrcNotSupported);
    }

    let total = response.content_length().filter(|len| *len > 0);
    if let Some(total) = total {
        buffer.set_total(total);
    }
    on_event(StreamingEvent::Started {
        content_type,
        total,
    });

    let mut stream = response.bytes_stream();
    let mut playable = false;
    while let Some(chunk) = stream.next().await {
        if buffer.is_cancelled() {
            return Ok(());
        }
        let chunk = chunk.map_err(|e| {
            debug!("Stream of {} broke: {}", url, e);
            MediaErrorKind::Network
        })?;
        buffer.append(&chunk);

        let downloaded = buffer.downloaded();
        on_event(StreamingEvent::Progress { downloaded, total });
        if !playable && downloaded >= HIGH_WATER_MARK_BYTES {
            playable = true;
            on_event(StreamingEvent::Playable);
        }
    }

    if !playable {
        on_event(StreamingEvent::Playable);
    }
    Ok(())
}
