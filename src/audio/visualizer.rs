//! Spectrum visualizer
//!
//! Reads the analysis tap of the resource the coordinator is driving, never a
//! parallel instance. When there is no tap (nothing playing, or the backend
//! cannot analyze) it falls back to a randomized idle animation. Nothing here
//! can fail playback.

use rand::Rng;
use tracing::debug;

use super::analyzer::AnalysisTap;
use super::coordinator::PlaybackCoordinator;
use crate::settings::VisualizerSettings;

/// Per-frame easing toward the idle targets
const IDLE_EASE: f32 = 0.2;
/// Idle bar ceiling while audio plays without a tap
const BUSY_CEIL: f32 = 0.7;
/// Idle bar ceiling with nothing playing
const QUIET_CEIL: f32 = 0.12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualizerMode {
    /// Bars come from the playing audio
    Live,
    /// Decorative animation
    Idle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualizerFrame {
    /// Bar heights, 0.0 to 1.0
    pub bars: Vec<f32>,
    pub mode: VisualizerMode,
}

pub struct Visualizer {
    coordinator: PlaybackCoordinator,
    settings: VisualizerSettings,
    /// Tap of the resource currently bound to the coordinator
    attached: Option<AnalysisTap>,
    idle: Vec<f32>,
    targets: Vec<f32>,
}

impl Visualizer {
    pub fn new(coordinator: &PlaybackCoordinator, settings: VisualizerSettings) -> Self {
        let bars = settings.bars.max(1);
        Self {
            coordinator: coordinator.clone(),
            settings,
            attached: None,
            idle: vec![0.0; bars],
            targets: vec![0.0; bars],
        }
    }

    pub fn bar_count(&self) -> usize {
        self.idle.len()
    }

    /// Compute the next frame
    pub fn frame(&mut self) -> VisualizerFrame {
        let state = self.coordinator.state();
        let active = state.active_article_id.as_deref().filter(|_| state.is_playing());

        let tap = match active {
            Some(id) => self.attach(id),
            None => {
                self.attached = None;
                None
            }
        };
        match tap {
            Some(tap) => VisualizerFrame {
                bars: tap.bars(self.bar_count()),
                mode: VisualizerMode::Live,
            },
            None => {
                let ceil = if active.is_some() { BUSY_CEIL } else { QUIET_CEIL };
                VisualizerFrame {
                    bars: self.animate(ceil),
                    mode: VisualizerMode::Idle,
                }
            }
        }
    }

    /// Follow the tap of whichever instance the coordinator is driving now.
    /// Replaying an article binds a fresh instance with its own tap.
    fn attach(&mut self, article_id: &str) -> Option<AnalysisTap> {
        let Some(tap) = self.coordinator.analysis_tap() else {
            if self.attached.take().is_some() {
                debug!("No analysis tap for {}, using idle animation", article_id);
            }
            return None;
        };
        if !self.attached.as_ref().is_some_and(|attached| attached.same_as(&tap)) {
            debug!("Visualizer attached to {}", article_id);
            tap.set_decay(self.settings.decay);
            self.attached = Some(tap.clone());
        }
        Some(tap)
    }

    fn animate(&mut self, ceil: f32) -> Vec<f32> {
        let mut rng = rand::rng();
        for (bar, target) in self.idle.iter_mut().zip(self.targets.iter_mut()) {
            if *target > ceil || (*target - *bar).abs() < 0.02 {
                *target = rng.random_range(0.0..ceil);
            }
            *bar += (*target - *bar) * IDLE_EASE;
            *bar = bar.clamp(0.0, 1.0);
        }
        self.idle.clone()
    }
}
