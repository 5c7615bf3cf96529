//! Spectrum analysis tap for the playing stream
//!
//! `AnalyzingSource` sits inside the playing pipeline and feeds every sample
//! it passes through into an `AnalysisTap`. The visualizer reads the tap; it
//! never decodes audio on its own.
//!
//! - 2048-point FFT with Hann window and 50% overlap
//! - logarithmic bands between 20Hz and 20kHz
//! - dB magnitudes with attack/decay smoothing

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rodio::Source;
use spectrum_analyzer::scaling::divide_by_N_sqrt;
use spectrum_analyzer::windows::hann_window;
use spectrum_analyzer::{FrequencyLimit, samples_fft_to_spectrum};

pub const FFT_SIZE: usize = 2048;

/// Resolution of the stored spectrum; consumers resample it to their bar count
pub const SPECTRUM_BANDS: usize = 64;

pub const FLOOR_DB: f32 = -60.0;
pub const CEIL_DB: f32 = 12.0;

const MIN_FREQ: f32 = 20.0;
const MAX_FREQ: f32 = 20000.0;

/// Shared spectrum state written by the audio pipeline
#[derive(Clone)]
pub struct AnalysisTap {
    inner: Arc<RwLock<TapInner>>,
}

struct TapInner {
    spectrum_db: Vec<f32>,
    /// Mono mix awaiting the next FFT
    window: Vec<f32>,
    /// Sum of squares since last FFT, for the level meter
    energy: f32,
    energy_samples: usize,
    level: f32,
    channel: u16,
    channels: u16,
    sample_rate: u32,
    decay: f32,
    frames: u64,
}

impl Default for TapInner {
    fn default() -> Self {
        Self {
            spectrum_db: vec![FLOOR_DB; SPECTRUM_BANDS],
            window: Vec::with_capacity(FFT_SIZE),
            energy: 0.0,
            energy_samples: 0,
            level: 0.0,
            channel: 0,
            channels: 2,
            sample_rate: 48000,
            decay: 0.85,
            frames: 0,
        }
    }
}

impl AnalysisTap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TapInner::default())),
        }
    }

    /// Smoothed spectrum in dB, `SPECTRUM_BANDS` values between `FLOOR_DB` and `CEIL_DB`
    /// True when both handles feed the same pipeline
    pub fn same_as(&self, other: &AnalysisTap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn spectrum_db(&self) -> Vec<f32> {
        self.inner.read().spectrum_db.clone()
    }

    /// Smoothed RMS level (0.0 to 1.0)
    pub fn level(&self) -> f32 {
        self.inner.read().level
    }

    /// Number of FFT frames computed so far
    pub fn frames(&self) -> u64 {
        self.inner.read().frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.read().sample_rate
    }

    pub fn set_decay(&self, decay: f32) {
        self.inner.write().decay = decay.clamp(0.0, 0.99);
    }

    /// Spectrum resampled to `bars` values normalized to 0.0..=1.0
    pub fn bars(&self, bars: usize) -> Vec<f32> {
        let spectrum = self.spectrum_db();
        (0..bars)
            .map(|i| {
                let start = i * SPECTRUM_BANDS / bars.max(1);
                let end = ((i + 1) * SPECTRUM_BANDS / bars.max(1)).max(start + 1);
                let peak = spectrum[start..end.min(SPECTRUM_BANDS)]
                    .iter()
                    .copied()
                    .fold(FLOOR_DB, f32::max);
                (peak - FLOOR_DB) / (CEIL_DB - FLOOR_DB)
            })
            .collect()
    }

    /// Clear accumulated state (after seek or stop)
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.spectrum_db.fill(FLOOR_DB);
        inner.window.clear();
        inner.energy = 0.0;
        inner.energy_samples = 0;
        inner.level = 0.0;
        inner.channel = 0;
    }

    pub(crate) fn configure(&self, sample_rate: u32, channels: u16) {
        let mut inner = self.inner.write();
        inner.sample_rate = sample_rate;
        inner.channels = channels.max(1);
        inner.channel = 0;
    }

    /// Feed interleaved samples
    pub fn feed(&self, samples: &[f32]) {
        let mut inner = self.inner.write();
        for &sample in samples {
            Self::push(&mut inner, sample);
        }
    }

    fn push(inner: &mut TapInner, sample: f32) {
        inner.energy += sample * sample;
        inner.energy_samples += 1;

        // Average channels into one mono frame
        if inner.channel == 0 {
            inner.window.push(sample / inner.channels as f32);
        } else if let Some(last) = inner.window.last_mut() {
            *last += sample / inner.channels as f32;
        }
        inner.channel = (inner.channel + 1) % inner.channels;

        if inner.channel == 0 && inner.window.len() >= FFT_SIZE {
            Self::analyze(inner);
        }
    }

    fn analyze(inner: &mut TapInner) {
        if inner.energy_samples > 0 {
            let rms = (inner.energy / inner.energy_samples as f32).sqrt().min(1.0);
            inner.level = inner.level * 0.7 + rms * 0.3;
            inner.energy = 0.0;
            inner.energy_samples = 0;
        }

        let windowed = hann_window(&inner.window[..FFT_SIZE]);
        let max_freq = MAX_FREQ.min(inner.sample_rate as f32 / 2.0);

        match samples_fft_to_spectrum(
            &windowed,
            inner.sample_rate,
            FrequencyLimit::Range(MIN_FREQ, max_freq),
            Some(&divide_by_N_sqrt),
        ) {
            Ok(spectrum) => {
                let data = spectrum.data();
                let decay = inner.decay;

                for band in 0..SPECTRUM_BANDS {
                    let t0 = band as f32 / SPECTRUM_BANDS as f32;
                    let t1 = (band + 1) as f32 / SPECTRUM_BANDS as f32;
                    let low = MIN_FREQ * (MAX_FREQ / MIN_FREQ).powf(t0);
                    let high = MIN_FREQ * (MAX_FREQ / MIN_FREQ).powf(t1);

                    let magnitude = data
                        .iter()
                        .filter(|(freq, _)| freq.val() >= low && freq.val() < high)
                        .map(|(_, mag)| mag.val())
                        .fold(0.0f32, f32::max);

                    let db = if magnitude > 0.0 {
                        (20.0 * magnitude.log10()).clamp(FLOOR_DB, CEIL_DB)
                    } else {
                        FLOOR_DB
                    };

                    let current = inner.spectrum_db[band];
                    inner.spectrum_db[band] = if db > current {
                        current * 0.3 + db * 0.7
                    } else {
                        current * decay + db * (1.0 - decay)
                    };
                }
                inner.frames += 1;
            }
            Err(e) => {
                tracing::debug!("Spectrum analysis skipped: {:?}", e);
            }
        }

        inner.window.drain(0..FFT_SIZE / 2);
    }
}

impl Default for AnalysisTap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnalysisTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("AnalysisTap")
            .field("sample_rate", &inner.sample_rate)
            .field("channels", &inner.channels)
            .field("frames", &inner.frames)
            .finish()
    }
}

/// Source wrapper that copies every sample into an `AnalysisTap`
pub struct AnalyzingSource<S>
where
    S: Source<Item = f32>,
{
    source: S,
    tap: AnalysisTap,
}

impl<S> AnalyzingSource<S>
where
    S: Source<Item = f32>,
{
    pub fn new(source: S, tap: AnalysisTap) -> Self {
        tap.configure(source.sample_rate(), source.channels());
        Self { source, tap }
    }
}

impl<S> Iterator for AnalyzingSource<S>
where
    S: Source<Item = f32>,
{
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        let sample = self.source.next()?;
        let mut inner = self.tap.inner.write();
        AnalysisTap::push(&mut inner, sample);
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.source.size_hint()
    }
}

impl<S> Source for AnalyzingSource<S>
where
    S: Source<Item = f32>,
{
    fn current_span_len(&self) -> Option<usize> {
        self.source.current_span_len()
    }

    fn channels(&self) -> u16 {
        self.source.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.source.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.source.total_duration()
    }

    fn try_seek(&mut self, pos: Duration) -> Result<(), rodio::source::SeekError> {
        self.tap.reset();
        self.source.try_seek(pos)
    }
}
