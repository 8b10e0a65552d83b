use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Error;

use crate::ansi;
use crate::atomic::AtomicEnum;
use crate::config::Tick;
use crate::error_box::InvalidState;
use crate::mux::{Multiplexer, Region, RenderSlot};
use crate::out::OutSink;
use crate::style::{Frame, FrameRender, TextBar};

/// Make a progress bar builder with the following defaults:
///
/// - Total steps: unbounded
/// - Destination: stdout, fixed region, private to this bar
/// - Renderer: [`TextBar`]
///
/// See [`BarBuilder`] for builder methods.
#[inline(always)]
pub fn bar(message: impl Into<String>) -> BarBuilder {
    BarBuilder::new(message.into())
}

/// Builder for a progress bar
pub struct BarBuilder {
    /// The message prefix for the bar
    message: String,
    /// Total steps (None = unbounded)
    total: Option<u64>,
    /// Share a caller-owned multiplexer instead of a private one
    mux: Option<Multiplexer>,
    /// Region strategy for a private multiplexer
    region: Region,
    /// Render to stderr instead of stdout (private multiplexer only)
    to_stderr: bool,
    /// Explicit sink, overrides stdout/stderr (private multiplexer only)
    sink: Option<OutSink>,
    renderer: Option<Box<dyn FrameRender>>,
    /// Message to display after done, instead of the default
    done_message: Option<String>,
}

impl BarBuilder {
    /// Start building a bar. [`bar`] is the canonical shorthand.
    pub fn new(message: String) -> Self {
        Self {
            message,
            total: None,
            mux: None,
            region: Region::Fixed,
            to_stderr: false,
            sink: None,
            renderer: None,
            done_message: None,
        }
    }

    /// Set the total steps, making the bar bounded. A bounded bar with a
    /// zero total errors on the first tick.
    ///
    /// By default the bar is unbounded: it animates and counts, but never
    /// completes on its own.
    #[inline(always)]
    pub fn total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    /// Share `mux` with other bars instead of using a private region.
    /// All bars on one multiplexer are redrawn together by one worker.
    #[inline(always)]
    pub fn multiplexer(mut self, mux: &Multiplexer) -> Self {
        self.mux = Some(mux.clone());
        self
    }

    /// Region strategy for the private multiplexer. Ignored when a shared
    /// one is supplied. Default is [`Region::Fixed`].
    #[inline(always)]
    pub fn region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    /// Render to stderr instead of stdout.
    #[inline(always)]
    pub fn stderr(mut self) -> Self {
        self.to_stderr = true;
        self
    }

    /// Render into an explicit sink.
    #[inline(always)]
    pub fn sink(mut self, sink: OutSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use a custom frame renderer instead of [`TextBar`].
    #[inline(always)]
    pub fn renderer(mut self, renderer: impl FrameRender + 'static) -> Self {
        self.renderer = Some(Box::new(renderer));
        self
    }

    /// Set a message to be displayed when the bar is done.
    ///
    /// Default is the message of the bar followed by `done`.
    #[inline(always)]
    pub fn when_done(mut self, message: impl Into<String>) -> Self {
        self.done_message = Some(message.into());
        self
    }

    /// Build the bar. Nothing renders until the first tick.
    pub fn build(self) -> Bar {
        let mux = match self.mux {
            Some(mux) => mux,
            None => match self.sink {
                Some(sink) => Multiplexer::with_sink(sink, self.region),
                None if self.to_stderr => Multiplexer::stderr(self.region),
                None => Multiplexer::new(self.region),
            },
        };
        let shared = Arc::new(BarShared {
            completed: AtomicU64::new(0),
            total: AtomicU64::new(self.total.unwrap_or(0)),
            bounded: self.total.is_some(),
            rendered_width: AtomicUsize::new(0),
            phase: AtomicEnum::new(Phase::Stopped as u8),
            started: Mutex::new(Instant::now()),
            message: Mutex::new(self.message),
            done_message: Mutex::new(self.done_message),
            renderer: self.renderer.unwrap_or_else(|| Box::new(TextBar::new())),
            op: Mutex::new(()),
        });
        Bar { shared, mux }
    }
}

/// Progress bar life cycle. Transitions only move forward; the cycle
/// restarts at `Stopped` only through [`Bar::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Not running. No worker, nothing rendered.
    Stopped = 0,
    /// First tick observed, render registration in flight.
    Begin = 1,
    /// Running with a known total; completes when the counter reaches it.
    StrictRefresh = 2,
    /// Running unbounded; only [`Bar::reset`] ends the run.
    LenientRefresh = 3,
    /// Done. The final frame has been requested; ticks are no-ops.
    Finish = 4,
}

impl From<u8> for Phase {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Begin,
            2 => Self::StrictRefresh,
            3 => Self::LenientRefresh,
            4 => Self::Finish,
            _ => Self::Stopped,
        }
    }
}
impl From<Phase> for u8 {
    fn from(v: Phase) -> Self {
        v as u8
    }
}

/// A live-updating progress indicator.
///
/// Callers advance it with [`tick`](Self::tick) from any thread; a
/// background worker redraws it every refresh interval. The first tick
/// starts the render loop, reaching the total (or [`reset`](Self::reset))
/// stops it with one final frame.
pub struct Bar {
    shared: Arc<BarShared>,
    mux: Multiplexer,
}

struct BarShared {
    completed: AtomicU64,
    total: AtomicU64,
    bounded: bool,
    /// Widest frame rendered so far, in columns.
    rendered_width: AtomicUsize,
    phase: AtomicEnum<Phase>,
    /// When the current run started.
    started: Mutex<Instant>,
    message: Mutex<String>,
    done_message: Mutex<Option<String>>,
    renderer: Box<dyn FrameRender>,
    /// Serializes every phase transition.
    op: Mutex<()>,
}

impl Bar {
    /// Advance by one step.
    #[inline(always)]
    pub fn tick(&self) -> crate::Result<()> {
        self.tick_by(1)
    }

    /// Advance by `n` steps, saturating at the total for bounded bars.
    /// The first tick of a run starts the render loop; the tick that
    /// reaches the total finishes it, with one final frame guaranteed.
    pub fn tick_by(&self, n: u64) -> crate::Result<()> {
        let _guard = self.shared.op_lock();
        self.advance_locked(n)
    }

    /// Seek a bounded bar to `percent` of its total, in `0.0..=1.0`.
    /// Forward-only: seeking behind the current position is a no-op.
    pub fn tick_to(&self, percent: f64) -> crate::Result<()> {
        let _guard = self.shared.op_lock();
        if !self.shared.bounded {
            return Err(Error::new(InvalidState(
                "percentage seek requires a bounded bar",
            )));
        }
        match self.shared.phase.get() {
            Phase::Finish => return Ok(()),
            Phase::Stopped => self.start_locked()?,
            _ => {}
        }
        let total = self.shared.total.load(Ordering::Acquire);
        let target = ((total as f64) * percent.clamp(0.0, 1.0)).round() as u64;
        let done = self.shared.completed.load(Ordering::Acquire);
        if target > done {
            self.advance_locked(target - done)?;
        }
        Ok(())
    }

    /// End the run early, or clear a finished bar back to [`Phase::Stopped`].
    ///
    /// Running: one final frame is written (with `final_message` if given)
    /// before this returns. Idle: a no-op that never starts a worker.
    /// Counters reset with the transition, so the bar can run again.
    pub fn reset(&self, final_message: Option<&str>) -> crate::Result<()> {
        let _guard = self.shared.op_lock();
        let result = match self.shared.phase.get() {
            Phase::Stopped | Phase::Finish => Ok(()),
            _ => {
                if let Some(text) = final_message {
                    *self
                        .shared
                        .done_message
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(text.to_string());
                }
                self.finish_locked()
            }
        };
        self.shared.completed.store(0, Ordering::Release);
        self.shared.phase.set(Phase::Stopped);
        result
    }

    /// Replace the live message.
    pub fn set_message(&self, message: impl Into<String>) {
        *self
            .shared
            .message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = message.into();
    }

    /// Spin until the bar is no longer running. Completion must be driven
    /// from another thread; an unbounded bar only stops via `reset`.
    pub fn wait(&self) {
        while self.is_running() {
            std::thread::yield_now();
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns
    /// whether the bar stopped in time.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
        true
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.shared.total.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase.get()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.shared.phase.get(),
            Phase::Begin | Phase::StrictRefresh | Phase::LenientRefresh
        )
    }

    fn advance_locked(&self, n: u64) -> crate::Result<()> {
        match self.shared.phase.get() {
            Phase::Finish => return Ok(()),
            Phase::Stopped => self.start_locked()?,
            _ => {}
        }
        match self.shared.phase.get() {
            Phase::StrictRefresh => {
                let total = self.shared.total.load(Ordering::Acquire);
                let done = self
                    .shared
                    .completed
                    .load(Ordering::Acquire)
                    .saturating_add(n)
                    .min(total);
                self.shared.completed.store(done, Ordering::Release);
                if done >= total {
                    self.finish_locked()?;
                }
            }
            Phase::LenientRefresh => {
                self.shared.completed.fetch_add(n, Ordering::AcqRel);
            }
            _ => {}
        }
        Ok(())
    }

    /// First tick of a run: reset counters, register with the
    /// multiplexer (which starts the shared worker if needed) and enter
    /// the running phase. Errors leave the bar Stopped.
    fn start_locked(&self) -> crate::Result<()> {
        if self.shared.bounded && self.shared.total.load(Ordering::Acquire) == 0 {
            return Err(Error::new(InvalidState("bounded bar ticked with a zero total")));
        }
        self.shared.completed.store(0, Ordering::Release);
        self.shared.rendered_width.store(0, Ordering::Release);
        *self
            .shared
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.shared.phase.set(Phase::Begin);
        let slot: Arc<dyn RenderSlot> = self.shared.clone();
        if let Err(error) = self.mux.attach(slot) {
            self.shared.phase.set(Phase::Stopped);
            return Err(error);
        }
        self.shared.phase.set(if self.shared.bounded {
            Phase::StrictRefresh
        } else {
            Phase::LenientRefresh
        });
        Ok(())
    }

    /// Enter Finish and deregister. Returns after the final frame has
    /// been written and, if this was the last live bar, the worker has
    /// been released back to the pool.
    fn finish_locked(&self) -> crate::Result<()> {
        self.shared.phase.set(Phase::Finish);
        let slot: Arc<dyn RenderSlot> = self.shared.clone();
        self.mux.detach(&slot, false)
    }
}

impl Drop for Bar {
    fn drop(&mut self) {
        if !self.is_running() {
            return;
        }
        // abandoned mid-run: tear down without a final frame
        self.shared.phase.set(Phase::Finish);
        let slot: Arc<dyn RenderSlot> = self.shared.clone();
        if let Err(error) = self.mux.detach(&slot, true) {
            log::warn!("progress bar dropped while running: {error:#}");
        }
    }
}

impl RenderSlot for BarShared {
    fn render_line(&self, width: usize, tick: Tick, out: &mut String) -> bool {
        let before = out.len();
        // sampled once: the frame drawn and the retirement decision
        // reported back must agree even if a tick lands mid-render
        let finished = self.phase.get() == Phase::Finish;
        let done = self.completed.load(Ordering::Acquire);
        let total = self.total.load(Ordering::Acquire);
        let started = *self.started.lock().unwrap_or_else(PoisonError::into_inner);
        let message = self.message.lock().unwrap_or_else(PoisonError::into_inner);
        let mut frame = Frame {
            message: &message,
            done,
            total,
            tick,
            started,
            width,
        };
        if finished {
            let done_message = self
                .done_message
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match done_message.as_deref() {
                Some(text) => {
                    frame.message = text;
                    self.renderer.render_done(out, &frame);
                }
                None => {
                    let text = format!("{message} done");
                    frame.message = &text;
                    self.renderer.render_done(out, &frame);
                }
            }
        } else {
            self.renderer.render_frame(out, &frame);
        }
        let rendered = ansi::visible_width(&out[before..]);
        self.rendered_width.fetch_max(rendered, Ordering::AcqRel);
        finished
    }

    fn max_width(&self) -> usize {
        self.rendered_width.load(Ordering::Acquire)
    }
}

impl BarShared {
    fn op_lock(&self) -> MutexGuard<'_, ()> {
        self.op.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
