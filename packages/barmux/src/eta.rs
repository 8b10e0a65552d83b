use std::time::Instant;

use crate::config::{self, Tick};

/// Remaining-time estimate for a bounded bar.
pub(crate) struct Estimater {
    /// Time when the progress started
    start: Instant,
    /// If the ETA is accurate enough to be displayed
    is_reasonably_accurate: bool,
    /// Step number when we last estimated ETA
    last_step: u64,
    /// Cycle number when we last estimated ETA
    last_tick: Tick,
    /// Last calculation, in seconds
    previous_eta: f32,
}

impl Estimater {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            is_reasonably_accurate: false,
            last_step: 0,
            last_tick: 0,
            previous_eta: 0.0,
        }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Recompute the estimate for the current cycle. Returns `None` until
    /// the countdown has proven itself by tracking the measured estimate
    /// downward between steps.
    pub fn update(&mut self, now: Instant, current: u64, total: u64, tick: Tick) -> Option<f32> {
        if current == 0 || total == 0 || current > total {
            return None;
        }
        let interval = config::refresh_interval();
        let elapsed = (now - self.start).as_secs_f32();
        let secs_per_step = elapsed / current as f32;
        let mut eta = secs_per_step * (total - current) as f32;
        if current == self.last_step {
            // subtract time passed since updating to this step
            let since_step = (interval * tick.saturating_sub(self.last_tick)).as_secs_f32();
            if since_step > eta {
                self.last_step = current;
                self.last_tick = tick;
            }
            eta = (eta - since_step).max(0.0);
            // only start showing ETA if it's reasonably accurate
            if !self.is_reasonably_accurate && eta < self.previous_eta - interval.as_secs_f32() {
                self.is_reasonably_accurate = true;
            }
            self.previous_eta = eta;
        } else {
            self.last_step = current;
            self.last_tick = tick;
        }

        self.is_reasonably_accurate.then_some(eta)
    }
}
