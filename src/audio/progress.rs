//! Progress sampling timer
//!
//! A `ProgressTicker` is acquired when a session starts playing and released
//! by dropping it. The owning session holds the only handle, so every exit
//! path (pause, stop, end of stream, error, takeover) stops the timer.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct ProgressTicker {
    handle: JoinHandle<()>,
}

impl ProgressTicker {
    /// Run `sample` every `period` until it returns `false` or the ticker is dropped.
    pub fn start<F>(period: Duration, mut sample: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !sample() {
                    break;
                }
            }
        });
        tracing::trace!("Progress ticker started ({:?})", period);
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.handle.abort();
        tracing::trace!("Progress ticker released");
    }
}

impl std::fmt::Debug for ProgressTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTicker")
            .field("running", &self.is_running())
            .finish()
    }
}
